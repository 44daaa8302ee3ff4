//! Fast-lane deduplication.
//!
//! Identical fast-lane sends arriving within the window share a single
//! in-flight attempt. Expired entries are pruned lazily on each call.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::config::DedupeConfig;
use crate::errors::DeliveryResult;
use crate::message::{OutboundMessage, Receipt};

/// Boxed send future that can be awaited by several callers.
pub type SharedSend = Shared<BoxFuture<'static, DeliveryResult<Receipt>>>;

struct DedupeEntry {
    expires_at: Instant,
    future: SharedSend,
}

/// Coalesces identical fast-lane sends.
pub struct DedupeGate {
    window: Duration,
    enabled: bool,
    entries: Mutex<HashMap<String, DedupeEntry>>,
}

impl DedupeGate {
    /// Creates a gate with the configured window.
    pub fn new(config: &DedupeConfig) -> Self {
        Self {
            window: config.effective_window(),
            enabled: config.enabled,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Hex SHA-256 over the idempotency key, or over recipients, subject and
    /// bodies when no key is set. Addresses are hashed as given, so only
    /// byte-identical requests match.
    pub fn fingerprint(message: &OutboundMessage) -> String {
        let mut hasher = Sha256::new();

        match &message.idempotency_key {
            Some(key) => {
                hasher.update(b"key\0");
                hasher.update(key.as_bytes());
            }
            None => {
                for recipient in &message.to {
                    hasher.update(recipient.email.as_bytes());
                    hasher.update(b",");
                }
                for part in [
                    Some(message.subject.as_str()),
                    message.text.as_deref(),
                    message.html.as_deref(),
                ] {
                    hasher.update(b"\0");
                    if let Some(part) = part {
                        hasher.update(part.as_bytes());
                    }
                }
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Runs `make()` unless an identical send is already in flight, in which
    /// case that send's outcome is shared.
    pub async fn run<F>(&self, fingerprint: String, make: F) -> DeliveryResult<Receipt>
    where
        F: FnOnce() -> BoxFuture<'static, DeliveryResult<Receipt>>,
    {
        if !self.enabled {
            return make().await;
        }

        let (future, joined) = {
            let now = Instant::now();
            let mut entries = self.entries.lock();
            entries.retain(|_, entry| entry.expires_at > now);

            match entries.get(&fingerprint) {
                Some(entry) => (entry.future.clone(), true),
                None => {
                    let future = make().shared();
                    entries.insert(
                        fingerprint.clone(),
                        DedupeEntry {
                            expires_at: now + self.window,
                            future: future.clone(),
                        },
                    );
                    (future, false)
                }
            }
        };

        if joined {
            tracing::debug!(fingerprint = %fingerprint, "Joined in-flight fast-lane send");
        }

        let result = future.await;
        match result {
            Ok(mut receipt) if joined => {
                receipt.deduplicated = true;
                Ok(receipt)
            }
            other => other,
        }
    }

    /// Number of live entries; expired ones are not counted.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Returns true when no entry is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for DedupeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeGate")
            .field("window", &self.window)
            .field("enabled", &self.enabled)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Address, Lane};
    use crate::registry::ProviderId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn message(key: Option<&str>, text: &str) -> OutboundMessage {
        let mut builder = OutboundMessage::builder()
            .to("user@example.com")
            .unwrap()
            .subject("Your code")
            .text(text)
            .lane(Lane::Fast);
        if let Some(key) = key {
            builder = builder.idempotency_key(key);
        }
        builder.build().unwrap()
    }

    fn receipt() -> Receipt {
        Receipt {
            provider_id: ProviderId::new("alpha"),
            message_id: "id@shop.example".into(),
            response: "250 OK".into(),
            accepted: vec![],
            lane: Lane::Fast,
            elapsed: Duration::from_millis(120),
            deduplicated: false,
        }
    }

    fn counting_send(calls: Arc<AtomicUsize>) -> impl FnOnce() -> BoxFuture<'static, DeliveryResult<Receipt>> {
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(receipt())
            }
            .boxed()
        }
    }

    #[test]
    fn test_fingerprint() {
        let a = DedupeGate::fingerprint(&message(None, "123456"));
        let b = DedupeGate::fingerprint(&message(None, "123456"));
        let c = DedupeGate::fingerprint(&message(None, "654321"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);

        // The key wins over content.
        let k1 = DedupeGate::fingerprint(&message(Some("otp-1"), "123456"));
        let k2 = DedupeGate::fingerprint(&message(Some("otp-1"), "654321"));
        assert_eq!(k1, k2);
        assert_ne!(k1, a);

        let mut shouted = message(None, "123456");
        shouted.to = vec![Address::new("USER@example.com").unwrap()];
        assert_ne!(DedupeGate::fingerprint(&shouted), a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_sends_share_one_attempt() {
        let gate = DedupeGate::new(&DedupeConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = DedupeGate::fingerprint(&message(None, "123456"));

        let (first, second) = tokio::join!(
            gate.run(fp.clone(), counting_send(calls.clone())),
            gate.run(fp.clone(), counting_send(calls.clone())),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.message_id, second.message_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_triggers_new_attempt() {
        let gate = DedupeGate::new(&DedupeConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = DedupeGate::fingerprint(&message(None, "123456"));

        gate.run(fp.clone(), counting_send(calls.clone())).await.unwrap();
        assert_eq!(gate.len(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(gate.is_empty());

        let receipt = gate.run(fp, counting_send(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!receipt.deduplicated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_gate_never_coalesces() {
        let gate = DedupeGate::new(&DedupeConfig {
            enabled: false,
            ..DedupeConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = DedupeGate::fingerprint(&message(None, "123456"));

        let (a, b) = tokio::join!(
            gate.run(fp.clone(), counting_send(calls.clone())),
            gate.run(fp.clone(), counting_send(calls.clone())),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
