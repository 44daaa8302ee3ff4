//! Failure classification.
//!
//! Maps a [`TransportError`] to a [`FailureCategory`] and the base cooldown
//! the breaker applies for it. Classification is pure: it only looks at the
//! error kind, the SMTP reply code, the enhanced status code and the message.

use std::time::Duration;

use crate::config::BreakerConfig;
use crate::errors::{EnhancedStatusCode, FailureCategory, TransportError, TransportErrorKind};

/// Base cooldown for authentication failures.
pub const AUTH_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Base cooldown when the greeting never completes.
pub const GREETING_TIMEOUT_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Base cooldown for "try again later" replies.
pub const TRANSIENT_SOFT_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// Base cooldown for socket-level failures.
pub const CONNECTION_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// Base cooldown when nothing matched.
pub const UNKNOWN_COOLDOWN: Duration = Duration::from_secs(15 * 60);

const AUTH_CODES: &[u16] = &[530, 534, 535];
const TRANSIENT_CODES: &[u16] = &[421, 450, 451, 452, 454, 471];

const QUOTA_PHRASES: &[&str] = &[
    "usage limit",
    "quota",
    "rate limit",
    "ratelimit",
    "rate-limit",
    "too many requests",
    "sending limit",
    "daily user sending",
];

// Gmail-style vendor signals: 4.7.28 (rate limited), 5.4.5 (daily quota).
const QUOTA_ENHANCED: &[(u8, u16, u16)] = &[(4, 7, 28), (5, 4, 5)];

const GREETING_PHRASES: &[&str] = &["greeting never received", "greeting timeout", "greeting timed out"];

const TRANSIENT_PHRASES: &[&str] = &["temporarily", "try again later", "busy"];

const CONNECTION_PHRASES: &[&str] = &[
    "econnrefused",
    "econnreset",
    "etimedout",
    "enotfound",
    "ehostunreach",
    "connection refused",
    "connection reset",
    "timed out",
    "unreachable",
];

/// Outcome of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Failure category.
    pub category: FailureCategory,
    /// Base cooldown before escalation.
    pub cooldown: Duration,
}

/// Stateless failure classifier.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    quota_cooldown: Duration,
}

impl ErrorClassifier {
    /// Creates a classifier using the configured quota cooldown.
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            quota_cooldown: config.effective_quota_cooldown(),
        }
    }

    /// Classifies a transport failure.
    pub fn classify(&self, error: &TransportError) -> Classification {
        let category = Self::category(error);
        Classification {
            category,
            cooldown: self.cooldown(category),
        }
    }

    /// Returns the base cooldown for a category.
    pub fn cooldown(&self, category: FailureCategory) -> Duration {
        match category {
            FailureCategory::Auth => AUTH_COOLDOWN,
            FailureCategory::Quota => self.quota_cooldown,
            FailureCategory::GreetingTimeout => GREETING_TIMEOUT_COOLDOWN,
            FailureCategory::TransientSoft => TRANSIENT_SOFT_COOLDOWN,
            FailureCategory::Connection => CONNECTION_COOLDOWN,
            FailureCategory::Unknown => UNKNOWN_COOLDOWN,
        }
    }

    /// Determines the category; first match in priority order wins.
    pub fn category(error: &TransportError) -> FailureCategory {
        let message = error.message().to_ascii_lowercase();
        let code = error.smtp_code();
        let has_phrase = |phrases: &[&str]| phrases.iter().any(|p| message.contains(p));

        if error.kind() == TransportErrorKind::Authentication
            || code.map_or(false, |c| AUTH_CODES.contains(&c))
            || message.contains("auth")
        {
            return FailureCategory::Auth;
        }

        if has_phrase(QUOTA_PHRASES) || error.enhanced_code().map_or(false, is_quota_enhanced) {
            return FailureCategory::Quota;
        }

        if error.kind() == TransportErrorKind::GreetingTimeout || has_phrase(GREETING_PHRASES) {
            return FailureCategory::GreetingTimeout;
        }

        if code.map_or(false, |c| TRANSIENT_CODES.contains(&c)) || has_phrase(TRANSIENT_PHRASES) {
            return FailureCategory::TransientSoft;
        }

        if is_socket_kind(error.kind()) || has_phrase(CONNECTION_PHRASES) {
            return FailureCategory::Connection;
        }

        FailureCategory::Unknown
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(&BreakerConfig::default())
    }
}

fn is_quota_enhanced(code: EnhancedStatusCode) -> bool {
    QUOTA_ENHANCED
        .iter()
        .any(|&(class, subject, detail)| code == EnhancedStatusCode::new(class, subject, detail))
}

fn is_socket_kind(kind: TransportErrorKind) -> bool {
    matches!(
        kind,
        TransportErrorKind::DnsResolution
            | TransportErrorKind::ConnectionRefused
            | TransportErrorKind::ConnectionReset
            | TransportErrorKind::NetworkUnreachable
            | TransportErrorKind::ConnectTimeout
            | TransportErrorKind::ReadTimeout
            | TransportErrorKind::WriteTimeout
            | TransportErrorKind::Io
            | TransportErrorKind::FastLaneTimeout
            | TransportErrorKind::Pool
    )
}

/// Escalation step added per consecutive failure.
pub const ESCALATION_STEP: Duration = Duration::from_secs(2 * 60);

/// Consecutive failures beyond which escalation plateaus.
pub const ESCALATION_CAP: u32 = 4;

/// Returns `base + min(consecutive_failures, 4) * 2min`.
pub fn escalated_cooldown(base: Duration, consecutive_failures: u32) -> Duration {
    base + ESCALATION_STEP * consecutive_failures.min(ESCALATION_CAP)
}
