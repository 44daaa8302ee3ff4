//! Per-provider circuit breakers with escalating cooldowns.
//!
//! A provider opens on its first failure. The cooldown comes from the
//! failure category and grows by two minutes per consecutive failure, up to
//! four steps. Once `open_until` passes the provider is half-open: the next
//! attempt goes through, and its outcome either closes or reopens it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::classifier::{escalated_cooldown, Classification, ErrorClassifier};
use crate::errors::{FailureCategory, TransportError};
use crate::registry::ProviderId;

/// Circuit state as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// No recent failures.
    Closed,
    /// Cooling down; attempts are skipped.
    Open,
    /// Cooldown elapsed after failures; the next attempt is a probe.
    HalfOpen,
}

/// Mutable breaker state for one provider.
#[derive(Debug, Clone, Default)]
pub struct BreakerState {
    /// `None` when closed.
    pub open_until: Option<Instant>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Last failure message, diagnostic only.
    pub last_error: Option<String>,
    /// Category of the last failure.
    pub last_category: Option<FailureCategory>,
}

impl BreakerState {
    fn state_at(&self, now: Instant) -> CircuitState {
        match self.open_until {
            Some(until) if now < until => CircuitState::Open,
            _ if self.consecutive_failures > 0 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Serializable copy of a provider's breaker state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Provider.
    pub provider_id: ProviderId,
    /// Circuit state at snapshot time.
    pub state: CircuitState,
    /// Wall-clock end of the cooldown.
    pub open_until: Option<DateTime<Utc>>,
    /// Remaining cooldown in milliseconds; 0 unless open.
    pub remaining_ms: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Category of the last failure.
    pub last_category: Option<FailureCategory>,
}

/// Breaker state for every provider, for the life of the engine.
#[derive(Debug)]
pub struct CircuitBreakerStore {
    classifier: ErrorClassifier,
    states: Mutex<HashMap<ProviderId, BreakerState>>,
}

impl CircuitBreakerStore {
    /// Creates an empty store.
    pub fn new(classifier: ErrorClassifier) -> Self {
        Self {
            classifier,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Starts tracking a provider in the closed state.
    pub fn register(&self, provider: &ProviderId) {
        self.states.lock().entry(provider.clone()).or_default();
    }

    /// Returns true while the provider is cooling down.
    pub fn is_open(&self, provider: &ProviderId) -> bool {
        let now = Instant::now();
        self.states
            .lock()
            .get(provider)
            .and_then(|s| s.open_until)
            .map_or(false, |until| now < until)
    }

    /// Returns the circuit state of a provider.
    pub fn state(&self, provider: &ProviderId) -> CircuitState {
        let now = Instant::now();
        self.states
            .lock()
            .get(provider)
            .map_or(CircuitState::Closed, |s| s.state_at(now))
    }

    /// Returns the remaining cooldown, if open.
    pub fn remaining(&self, provider: &ProviderId) -> Option<Duration> {
        let now = Instant::now();
        self.states
            .lock()
            .get(provider)
            .and_then(|s| s.open_until)
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// Classifies a failure and opens the provider for the escalated cooldown.
    pub fn record_failure(&self, provider: &ProviderId, error: &TransportError) -> Classification {
        let classification = self.classifier.classify(error);
        let now = Instant::now();

        let (cooldown, failures) = {
            let mut states = self.states.lock();
            let state = states.entry(provider.clone()).or_default();

            let cooldown = escalated_cooldown(classification.cooldown, state.consecutive_failures);
            let candidate = now + cooldown;

            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.open_until = Some(state.open_until.map_or(candidate, |prev| prev.max(candidate)));
            state.last_error = Some(error.to_string());
            state.last_category = Some(classification.category);

            (cooldown, state.consecutive_failures)
        };

        tracing::warn!(
            provider = %provider,
            category = %classification.category,
            consecutive_failures = failures,
            cooldown_secs = cooldown.as_secs(),
            error = %error,
            "Provider circuit opened"
        );

        classification
    }

    /// Closes the provider's circuit.
    pub fn record_success(&self, provider: &ProviderId) {
        let was_failing = {
            let mut states = self.states.lock();
            let state = states.entry(provider.clone()).or_default();
            let was_failing = state.consecutive_failures > 0;
            state.consecutive_failures = 0;
            state.open_until = None;
            was_failing
        };

        if was_failing {
            tracing::info!(provider = %provider, "Provider circuit closed");
        }
    }

    /// Returns a snapshot of every known provider, sorted by id.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let wall = Utc::now();

        let mut snapshots: Vec<_> = self
            .states
            .lock()
            .iter()
            .map(|(id, state)| {
                let remaining = state
                    .open_until
                    .filter(|until| now < *until)
                    .map(|until| until - now)
                    .unwrap_or(Duration::ZERO);
                let open_until = state.open_until.map(|until| {
                    let delta = until.saturating_duration_since(now);
                    wall + chrono::Duration::from_std(delta).unwrap_or_else(|_| chrono::Duration::zero())
                });

                BreakerSnapshot {
                    provider_id: id.clone(),
                    state: state.state_at(now),
                    open_until,
                    remaining_ms: remaining.as_millis() as u64,
                    consecutive_failures: state.consecutive_failures,
                    last_error: state.last_error.clone(),
                    last_category: state.last_category,
                }
            })
            .collect();

        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    /// Forgets all breaker state.
    pub fn reset(&self) {
        self.states.lock().clear();
    }
}

impl Default for CircuitBreakerStore {
    fn default() -> Self {
        Self::new(ErrorClassifier::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::errors::TransportErrorKind;

    fn refused() -> TransportError {
        TransportError::new(TransportErrorKind::ConnectionRefused, "connection refused")
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_first_failure() {
        let store = CircuitBreakerStore::default();
        let id = ProviderId::new("alpha");
        assert!(!store.is_open(&id));
        assert_eq!(store.state(&id), CircuitState::Closed);

        let classification = store.record_failure(&id, &refused());
        assert_eq!(classification.category, FailureCategory::Connection);
        assert!(store.is_open(&id));
        assert_eq!(store.remaining(&id), Some(Duration::from_secs(10 * 60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown() {
        let store = CircuitBreakerStore::default();
        let id = ProviderId::new("alpha");
        store.record_failure(&id, &refused());

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert!(!store.is_open(&id));
        assert_eq!(store.state(&id), CircuitState::HalfOpen);

        store.record_success(&id);
        assert_eq!(store.state(&id), CircuitState::Closed);
        let snap = &store.snapshot()[0];
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.open_until.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_plateaus_at_eight_minutes() {
        let store = CircuitBreakerStore::default();
        let id = ProviderId::new("alpha");
        let base = Duration::from_secs(10 * 60);

        let mut cooldowns = Vec::new();
        for _ in 0..7 {
            store.record_failure(&id, &refused());
            cooldowns.push(store.remaining(&id).unwrap());
            // Let the cooldown lapse so each step is measured from scratch.
            tokio::time::advance(cooldowns[cooldowns.len() - 1]).await;
        }

        for pair in cooldowns[..5].windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert_eq!(cooldowns[4], base + Duration::from_secs(8 * 60));
        assert_eq!(cooldowns[5], cooldowns[4]);
        assert_eq!(cooldowns[6], cooldowns[4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_until_never_shrinks() {
        let store = CircuitBreakerStore::default();
        let id = ProviderId::new("alpha");

        // 12h quota cooldown, then a short connection failure.
        store.record_failure(&id, &TransportError::from_reply(550, None, "daily quota exceeded"));
        let before = store.remaining(&id).unwrap();
        store.record_failure(&id, &refused());
        assert!(store.remaining(&id).unwrap() >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_floor_applies() {
        let store = CircuitBreakerStore::new(ErrorClassifier::new(&BreakerConfig {
            quota_cooldown: Duration::from_secs(60),
        }));
        let id = ProviderId::new("alpha");
        store.record_failure(&id, &TransportError::from_reply(550, None, "Usage limit reached"));
        assert!(store.remaining(&id).unwrap() >= Duration::from_secs(30 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_quota_cooldown_is_capped() {
        let store = CircuitBreakerStore::new(ErrorClassifier::new(&BreakerConfig {
            quota_cooldown: Duration::from_secs(u64::MAX / 2),
        }));
        let id = ProviderId::new("alpha");
        store.record_failure(&id, &TransportError::from_reply(550, None, "daily quota reached"));
        assert_eq!(
            store.remaining(&id),
            Some(crate::config::MAX_QUOTA_COOLDOWN)
        );
        assert!(store.snapshot()[0].open_until.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_reset() {
        let store = CircuitBreakerStore::default();
        store.record_failure(&"beta".into(), &refused());
        store.record_failure(&"alpha".into(), &TransportError::from_reply(535, None, "bad credentials"));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].provider_id.as_str(), "alpha");
        assert_eq!(snapshot[0].last_category, Some(FailureCategory::Auth));
        assert_eq!(snapshot[0].remaining_ms, 60 * 60 * 1000);
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert!(snapshot[1].last_error.as_deref().unwrap().contains("connection refused"));

        store.reset();
        assert!(store.snapshot().is_empty());
        assert!(!store.is_open(&"alpha".into()));
    }

    #[tokio::test]
    async fn test_registered_provider_starts_closed() {
        let store = CircuitBreakerStore::default();
        store.register(&"alpha".into());

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, CircuitState::Closed);
        assert_eq!(snapshot[0].remaining_ms, 0);
        assert!(snapshot[0].open_until.is_none());
    }
}
