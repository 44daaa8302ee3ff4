//! Error types for the delivery engine.
//!
//! Two layers of errors exist:
//! - [`TransportError`] describes a single failed attempt against one relay
//!   provider. It is consumed by the breaker and never reaches callers.
//! - [`DeliveryError`] is the terminal error returned by
//!   [`DeliveryEngine::send`](crate::engine::DeliveryEngine::send).

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::breaker::BreakerSnapshot;

/// Result type for a single transport attempt.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for engine-level operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Transport failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    // Socket level
    /// DNS resolution failed.
    DnsResolution,
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset or closed by the peer.
    ConnectionReset,
    /// Network or host unreachable.
    NetworkUnreachable,
    /// TCP connect did not complete in time.
    ConnectTimeout,
    /// Reading a reply timed out.
    ReadTimeout,
    /// Writing a command or the message body timed out.
    WriteTimeout,
    /// Any other socket I/O failure.
    Io,

    // Session level
    /// Connected, but the server greeting never arrived in time.
    GreetingTimeout,
    /// TLS handshake or configuration failure.
    Tls,
    /// Authentication was rejected.
    Authentication,
    /// The server replied with a non-success code.
    Rejected,
    /// The server reply could not be parsed.
    Protocol,

    // Engine level
    /// The fast-lane hard deadline fired before the attempt completed.
    FastLaneTimeout,
    /// A pooled connection could not be obtained.
    Pool,
    /// Unknown failure.
    Unknown,
}

impl TransportErrorKind {
    /// Returns true for failures that leave the connection unusable.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::DnsResolution
                | TransportErrorKind::ConnectionRefused
                | TransportErrorKind::ConnectionReset
                | TransportErrorKind::NetworkUnreachable
                | TransportErrorKind::ConnectTimeout
                | TransportErrorKind::ReadTimeout
                | TransportErrorKind::WriteTimeout
                | TransportErrorKind::Io
                | TransportErrorKind::GreetingTimeout
                | TransportErrorKind::Tls
                | TransportErrorKind::Protocol
                | TransportErrorKind::FastLaneTimeout
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::DnsResolution => write!(f, "DNS resolution failed"),
            TransportErrorKind::ConnectionRefused => write!(f, "Connection refused"),
            TransportErrorKind::ConnectionReset => write!(f, "Connection reset"),
            TransportErrorKind::NetworkUnreachable => write!(f, "Network unreachable"),
            TransportErrorKind::ConnectTimeout => write!(f, "Connect timeout"),
            TransportErrorKind::ReadTimeout => write!(f, "Read timeout"),
            TransportErrorKind::WriteTimeout => write!(f, "Write timeout"),
            TransportErrorKind::Io => write!(f, "I/O error"),
            TransportErrorKind::GreetingTimeout => write!(f, "Greeting timeout"),
            TransportErrorKind::Tls => write!(f, "TLS failure"),
            TransportErrorKind::Authentication => write!(f, "Authentication failed"),
            TransportErrorKind::Rejected => write!(f, "Rejected by server"),
            TransportErrorKind::Protocol => write!(f, "Protocol error"),
            TransportErrorKind::FastLaneTimeout => write!(f, "Fast-lane deadline exceeded"),
            TransportErrorKind::Pool => write!(f, "Connection pool error"),
            TransportErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// Enhanced mail system status code (RFC 3463).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 4=network/routing, 7=security/policy).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Creates a new enhanced status code.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self { class, subject, detail }
    }

    /// Parses an enhanced status code from a string (e.g., "4.7.0").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !matches!(class, 2 | 4 | 5) {
            return None;
        }
        Some(Self { class, subject, detail })
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// A failed attempt against a single relay provider.
#[derive(Error, Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    /// Creates a new transport error.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if the failure came from a server reply.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<EnhancedStatusCode> {
        self.enhanced_code
    }

    /// Creates an error from a server reply.
    pub fn from_reply(
        code: u16,
        enhanced: Option<EnhancedStatusCode>,
        message: impl Into<String>,
    ) -> Self {
        let kind = match code {
            530 | 534 | 535 => TransportErrorKind::Authentication,
            _ => TransportErrorKind::Rejected,
        };
        let mut err = Self::new(kind, message).with_smtp_code(code);
        err.enhanced_code = enhanced;
        err
    }

    /// Maps a socket error to a transport error.
    pub fn from_io(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        let kind = match error.kind() {
            ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportErrorKind::ConnectionReset,
            ErrorKind::TimedOut => TransportErrorKind::ConnectTimeout,
            ErrorKind::NotFound => TransportErrorKind::DnsResolution,
            ErrorKind::AddrNotAvailable => TransportErrorKind::NetworkUnreachable,
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, format!("{}: {}", context, error)).with_cause(error)
    }

    /// Creates the error recorded when the fast-lane deadline fires.
    pub fn fast_lane_timeout(deadline_ms: u64) -> Self {
        Self::new(
            TransportErrorKind::FastLaneTimeout,
            format!("attempt timed out after {}ms", deadline_ms),
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

/// Failure categories used for breaker cooldowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Credentials rejected.
    Auth,
    /// Provider usage or rate quota exhausted.
    Quota,
    /// Connected but the greeting never completed.
    GreetingTimeout,
    /// "Try again later" class replies.
    TransientSoft,
    /// Socket-level failure, including fast-lane deadline expiry.
    Connection,
    /// Nothing else matched.
    Unknown,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCategory::Auth => "AuthError",
            FailureCategory::Quota => "QuotaError",
            FailureCategory::GreetingTimeout => "GreetingTimeoutError",
            FailureCategory::TransientSoft => "TransientSoftError",
            FailureCategory::Connection => "ConnectionError",
            FailureCategory::Unknown => "UnknownError",
        };
        f.write_str(name)
    }
}

/// Terminal errors surfaced to callers of the engine.
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    /// Every provider was either open or failed.
    #[error("all providers exhausted after {attempts} attempt(s){}", category_suffix(.category))]
    AllProvidersExhausted {
        /// Category of the last attempted failure, `None` if nothing was attempted.
        category: Option<FailureCategory>,
        /// Number of network attempts made.
        attempts: usize,
        /// Breaker state of every provider at the time of failure.
        breakers: Vec<BreakerSnapshot>,
    },

    /// No provider has a complete credential bundle.
    #[error("no mail providers configured")]
    NoProvidersConfigured,

    /// The message cannot be sent as given.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

fn category_suffix(category: &Option<FailureCategory>) -> String {
    match category {
        Some(category) => format!(" (last failure: {})", category),
        None => String::new(),
    }
}

impl DeliveryError {
    /// Returns the failure category carried by this error, if any.
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            DeliveryError::AllProvidersExhausted { category, .. } => *category,
            _ => None,
        }
    }

    /// Returns the breaker snapshot carried by this error.
    pub fn breaker_snapshot(&self) -> &[BreakerSnapshot] {
        match self {
            DeliveryError::AllProvidersExhausted { breakers, .. } => breakers,
            _ => &[],
        }
    }
}
