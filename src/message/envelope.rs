//! Header and envelope composition plus RFC 5322 rendering.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Address, OutboundMessage};
use crate::errors::DeliveryResult;
use crate::registry::ProviderDescriptor;

// Headers the engine writes itself; caller copies are dropped.
const MANAGED_HEADERS: &[&str] = &[
    "from",
    "sender",
    "to",
    "subject",
    "date",
    "message-id",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
];

/// Provider-independent part of a composed message.
///
/// Computed once per `send`, so every provider attempt carries the same
/// Message-ID and Date.
#[derive(Debug, Clone)]
pub struct MessageBase {
    message: OutboundMessage,
    default_from: Address,
    message_id: String,
    date: DateTime<Utc>,
}

impl MessageBase {
    /// Composes the base: default From, Message-ID (kept if the caller set
    /// one) and Date.
    pub fn compose(message: OutboundMessage, default_from: &Address) -> DeliveryResult<Self> {
        message.validate()?;

        let message_id = match message.header("Message-ID") {
            Some(id) => id.trim().trim_start_matches('<').trim_end_matches('>').to_string(),
            None => format!("{}@{}", Uuid::new_v4(), default_from.domain()),
        };

        Ok(Self {
            message,
            default_from: default_from.clone(),
            message_id,
            date: Utc::now(),
        })
    }

    /// Returns the caller's message.
    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    /// Returns the Message-ID, without angle brackets.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// A message addressed for one specific provider.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// From header.
    pub from: Address,
    /// Sender header, set when the authenticated mailbox differs from From.
    pub sender: Option<Address>,
    /// MAIL FROM address.
    pub envelope_from: Address,
    /// RCPT TO addresses.
    pub recipients: Vec<Address>,
    /// Message-ID, without angle brackets.
    pub message_id: String,
    /// Date header.
    pub date: DateTime<Utc>,
    /// Subject.
    pub subject: String,
    /// Plain text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
    /// Caller headers that survive composition.
    pub headers: Vec<(String, String)>,
}

impl Envelope {
    /// Finalizes From, Sender and envelope-from for `provider`.
    pub fn for_provider(base: &MessageBase, provider: &ProviderDescriptor) -> Self {
        let message = &base.message;
        let from = provider
            .from
            .clone()
            .unwrap_or_else(|| base.default_from.clone());

        let sender = Address::new(provider.credentials.username.as_str())
            .ok()
            .filter(|user| !user.email.eq_ignore_ascii_case(&from.email));

        let envelope_from = message.envelope_from.clone().unwrap_or_else(|| from.clone());

        let headers = message
            .headers
            .iter()
            .filter(|(name, _)| !MANAGED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
            .cloned()
            .collect();

        Self {
            from,
            sender,
            envelope_from,
            recipients: message.to.clone(),
            message_id: base.message_id.clone(),
            date: base.date,
            subject: message.subject.clone(),
            text: message.text.clone(),
            html: message.html.clone(),
            headers,
        }
    }

    /// Renders the message as RFC 5322 bytes with CRLF line endings.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);

        write_header(&mut out, "Date", &self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string());
        write_header(&mut out, "From", &self.from.to_header());
        if let Some(sender) = &self.sender {
            write_header(&mut out, "Sender", &sender.to_header());
        }
        let to: Vec<String> = self.recipients.iter().map(Address::to_header).collect();
        write_header(&mut out, "To", &to.join(", "));
        write_header(&mut out, "Subject", &encode_word(&self.subject));
        write_header(&mut out, "Message-ID", &format!("<{}>", self.message_id));
        for (name, value) in &self.headers {
            write_header(&mut out, name, &encode_word(value));
        }
        write_header(&mut out, "MIME-Version", "1.0");

        match (&self.text, &self.html) {
            (Some(text), Some(html)) => {
                let boundary = format!("----=_Part_{}", Uuid::new_v4().simple());
                write_header(
                    &mut out,
                    "Content-Type",
                    &format!("multipart/alternative; boundary=\"{}\"", boundary),
                );
                out.extend_from_slice(b"\r\n");
                write_part(&mut out, &boundary, "text/plain", text);
                write_part(&mut out, &boundary, "text/html", html);
                out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
            }
            (text, html) => {
                let (content_type, body) = match (text, html) {
                    (_, Some(html)) => ("text/html", html.as_str()),
                    (Some(text), None) => ("text/plain", text.as_str()),
                    (None, None) => ("text/plain", ""),
                };
                write_single(&mut out, content_type, body);
            }
        }

        out
    }
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{}: {}", name, value);
    out.extend_from_slice(fold(&line).as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn write_single(out: &mut Vec<u8>, content_type: &str, body: &str) {
    write_header(out, "Content-Type", &format!("{}; charset=utf-8", content_type));
    write_header(out, "Content-Transfer-Encoding", "quoted-printable");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&quoted_printable::encode(body.as_bytes()));
    out.extend_from_slice(b"\r\n");
}

fn write_part(out: &mut Vec<u8>, boundary: &str, content_type: &str, body: &str) {
    out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    write_single(out, content_type, body);
}

// Folds at 78 columns on spaces.
fn fold(line: &str) -> String {
    if line.len() <= 78 {
        return line.to_string();
    }

    let mut result = String::with_capacity(line.len() + 8);
    let mut current = String::new();
    for word in line.split(' ') {
        if current.is_empty() {
            current.push_str(word);
        } else if current.len() + 1 + word.len() <= 76 {
            current.push(' ');
            current.push_str(word);
        } else {
            result.push_str(&current);
            result.push_str("\r\n ");
            current = word.to_string();
        }
    }
    result.push_str(&current);
    result
}

// RFC 2047 B-encoding for non-ASCII values.
fn encode_word(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }
    format!("=?UTF-8?B?{}?=", BASE64.encode(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::message::Lane;
    use crate::registry::ProviderDescriptor;

    fn provider(username: &str, from: Option<&str>) -> ProviderDescriptor {
        let mut config = ProviderConfig::new("alpha", "smtp.alpha.example").credentials(username, "secret");
        config.from = from.map(str::to_string);
        ProviderDescriptor::from_config(&config, 0).unwrap()
    }

    fn message() -> OutboundMessage {
        OutboundMessage::builder()
            .to("user@example.com")
            .unwrap()
            .subject("Your code")
            .text("123456")
            .header("X-Campaign", "otp")
            .header("From", "spoof@evil.example")
            .lane(Lane::Fast)
            .build()
            .unwrap()
    }

    fn default_from() -> Address {
        Address::parse("Shop <no-reply@shop.example>").unwrap()
    }

    #[test]
    fn test_message_id_generated_once() {
        let base = MessageBase::compose(message(), &default_from()).unwrap();
        assert!(base.message_id().ends_with("@shop.example"));

        let a = Envelope::for_provider(&base, &provider("relay-user@alpha.example", None));
        let b = Envelope::for_provider(&base, &provider("apikey", None));
        assert_eq!(a.message_id, b.message_id);
    }

    #[test]
    fn test_caller_message_id_kept() {
        let msg = OutboundMessage::builder()
            .to("user@example.com")
            .unwrap()
            .text("t")
            .header("Message-ID", "<order-42@shop.example>")
            .build()
            .unwrap();
        let base = MessageBase::compose(msg, &default_from()).unwrap();
        assert_eq!(base.message_id(), "order-42@shop.example");
    }

    #[test]
    fn test_sender_and_envelope_from() {
        let base = MessageBase::compose(message(), &default_from()).unwrap();

        let env = Envelope::for_provider(&base, &provider("relay-user@alpha.example", None));
        assert_eq!(env.from.email, "no-reply@shop.example");
        assert_eq!(env.sender.as_ref().unwrap().email, "relay-user@alpha.example");
        assert_eq!(env.envelope_from.email, "no-reply@shop.example");

        // Non-address usernames never become a Sender header.
        let env = Envelope::for_provider(&base, &provider("apikey", None));
        assert!(env.sender.is_none());

        let env = Envelope::for_provider(
            &base,
            &provider("no-reply@shop.example", Some("Shop <no-reply@shop.example>")),
        );
        assert!(env.sender.is_none());
    }

    #[test]
    fn test_render_drops_managed_headers() {
        let base = MessageBase::compose(message(), &default_from()).unwrap();
        let env = Envelope::for_provider(&base, &provider("apikey", None));
        let rendered = String::from_utf8(env.render()).unwrap();

        assert!(rendered.contains("From: Shop <no-reply@shop.example>\r\n"));
        assert!(rendered.contains("X-Campaign: otp\r\n"));
        assert!(!rendered.contains("spoof@evil.example"));
        assert!(rendered.contains("Content-Type: text/plain; charset=utf-8\r\n"));
    }

    #[test]
    fn test_render_alternative_and_encoded_subject() {
        let msg = OutboundMessage::builder()
            .to("user@example.com")
            .unwrap()
            .subject("Código de verificación")
            .text("hi")
            .html("<p>hi</p>")
            .build()
            .unwrap();
        let base = MessageBase::compose(msg, &default_from()).unwrap();
        let env = Envelope::for_provider(&base, &provider("apikey", None));
        let rendered = String::from_utf8(env.render()).unwrap();

        assert!(rendered.contains("multipart/alternative"));
        assert!(rendered.contains("Subject: =?UTF-8?B?"));
        assert!(rendered.contains("text/html; charset=utf-8"));
    }

    #[test]
    fn test_fold_long_header() {
        let long = format!("X-Long: {}", "word ".repeat(30));
        let folded = fold(long.trim_end());
        assert!(folded.lines().all(|l| l.trim_end_matches('\r').len() <= 78));
    }
}
