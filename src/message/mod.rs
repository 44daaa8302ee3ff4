//! Message types accepted and produced by the engine.
//!
//! This module provides:
//! - [`Address`] with light syntactic checks
//! - [`Lane`], the caller-declared delivery path
//! - [`OutboundMessage`] and its builder
//! - [`Receipt`], the provider acknowledgment returned on success

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::errors::{DeliveryError, DeliveryResult};
use crate::registry::ProviderId;

mod envelope;

pub use envelope::{Envelope, MessageBase};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Address {
    /// Display name (e.g., "Shop").
    pub name: Option<String>,
    /// Mailbox (e.g., "no-reply@shop.example").
    pub email: String,
}

impl Address {
    /// Creates an address from a bare mailbox.
    pub fn new(email: impl Into<String>) -> DeliveryResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates an address with a display name.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> DeliveryResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        let name = name.into();
        Ok(Self {
            name: if name.is_empty() { None } else { Some(name) },
            email,
        })
    }

    /// Parses "Name <mailbox>" or a bare mailbox.
    pub fn parse(s: &str) -> DeliveryResult<Self> {
        let s = s.trim();

        if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
            if start < end {
                let name = s[..start].trim().trim_matches('"');
                let email = s[start + 1..end].trim();
                return Self::with_name(name, email);
            }
        }

        Self::new(s)
    }

    // Syntax only; deliverability is not checked here.
    fn validate_email(email: &str) -> DeliveryResult<()> {
        let invalid = |reason: &str| {
            Err(DeliveryError::InvalidMessage(format!(
                "invalid address {:?}: {}",
                email, reason
            )))
        };

        if email.is_empty() || email.len() > 254 {
            return invalid("length must be 1-254 characters");
        }
        if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return invalid("contains whitespace or control characters");
        }
        match email.split_once('@') {
            Some((local, domain))
                if !local.is_empty() && local.len() <= 64 && !domain.is_empty() && !domain.contains('@') =>
            {
                Ok(())
            }
            _ => invalid("must be local@domain"),
        }
    }

    /// Returns the domain part of the mailbox.
    pub fn domain(&self) -> &str {
        self.email.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
    }

    /// Formats the address for MAIL FROM/RCPT TO.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }

    /// Formats the address for headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') => {
                format!("\"{}\" <{}>", name.replace('"', "\\\""), self.email)
            }
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header())
    }
}

impl TryFrom<&str> for Address {
    type Error = DeliveryError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = DeliveryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// Delivery path declared by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Low-latency path for OTP-class messages: one warm connection,
    /// hard per-attempt deadline, dedupe.
    Fast,
    /// Bulk transactional path: pooled connections, relaxed timeouts.
    #[default]
    Normal,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Lane::Fast => "fast",
            Lane::Normal => "normal",
        })
    }
}

/// A message handed to the engine, content already assembled.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Recipients.
    pub to: Vec<Address>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
    /// Extra headers, in order.
    pub headers: Vec<(String, String)>,
    /// Envelope sender override.
    pub envelope_from: Option<Address>,
    /// Delivery path.
    pub lane: Lane,
    /// Caller-supplied idempotency key for fast-lane dedupe.
    pub idempotency_key: Option<String>,
}

impl OutboundMessage {
    /// Creates a new message builder.
    pub fn builder() -> OutboundMessageBuilder {
        OutboundMessageBuilder::default()
    }

    /// Returns the value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Checks the message can be sent at all.
    pub fn validate(&self) -> DeliveryResult<()> {
        if self.to.is_empty() {
            return Err(DeliveryError::InvalidMessage(
                "at least one recipient is required".into(),
            ));
        }
        if self.text.is_none() && self.html.is_none() {
            return Err(DeliveryError::InvalidMessage(
                "a text or html body is required".into(),
            ));
        }
        for (name, value) in &self.headers {
            if name.is_empty() || name.chars().any(|c| c.is_control() || c == ':' || c == ' ') {
                return Err(DeliveryError::InvalidMessage(format!(
                    "invalid header name {:?}",
                    name
                )));
            }
            if value.contains('\r') || value.contains('\n') {
                return Err(DeliveryError::InvalidMessage(format!(
                    "header {} contains a line break",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`OutboundMessage`].
#[derive(Debug, Default)]
pub struct OutboundMessageBuilder {
    to: Vec<Address>,
    subject: String,
    text: Option<String>,
    html: Option<String>,
    headers: Vec<(String, String)>,
    envelope_from: Option<Address>,
    lane: Lane,
    idempotency_key: Option<String>,
}

impl OutboundMessageBuilder {
    /// Adds a recipient.
    pub fn to(mut self, address: impl TryInto<Address, Error = DeliveryError>) -> DeliveryResult<Self> {
        self.to.push(address.try_into()?);
        Ok(self)
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the plain text body.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sets the HTML body.
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the envelope sender.
    pub fn envelope_from(
        mut self,
        address: impl TryInto<Address, Error = DeliveryError>,
    ) -> DeliveryResult<Self> {
        self.envelope_from = Some(address.try_into()?);
        Ok(self)
    }

    /// Sets the lane.
    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    /// Sets the idempotency key.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Builds the message.
    pub fn build(self) -> DeliveryResult<OutboundMessage> {
        let message = OutboundMessage {
            to: self.to,
            subject: self.subject,
            text: self.text,
            html: self.html,
            headers: self.headers,
            envelope_from: self.envelope_from,
            lane: self.lane,
            idempotency_key: self.idempotency_key,
        };
        message.validate()?;
        Ok(message)
    }
}

/// Acknowledgment of a successful send.
#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    /// Provider that accepted the message.
    pub provider_id: ProviderId,
    /// Message-ID header value, without angle brackets.
    pub message_id: String,
    /// Final server reply text.
    pub response: String,
    /// Recipients the server accepted.
    pub accepted: Vec<Address>,
    /// Lane the message travelled on.
    pub lane: Lane,
    /// Time from `send` to acceptance. A deduplicated receipt carries the
    /// elapsed time of the send it joined, not the caller's own wait.
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    /// True when this receipt was shared from an identical in-flight send.
    pub deduplicated: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
