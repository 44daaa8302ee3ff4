//! Fast-lane latency tracking.
//!
//! Keeps an exponentially weighted moving average per provider and remembers
//! the provider that last delivered a fast-lane message, which is tried first
//! next time.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::registry::{ProviderDescriptor, ProviderId};

/// Smoothing factor applied to new samples.
pub const EWMA_ALPHA: f64 = 0.35;

#[derive(Debug, Default)]
struct LatencyState {
    ewma: HashMap<ProviderId, f64>,
    last_good: Option<ProviderId>,
}

/// EWMA latency per provider plus the last-good fast-lane provider.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    state: Mutex<LatencyState>,
}

impl LatencyTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful fast-lane send.
    pub fn record(&self, provider: &ProviderId, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut state = self.state.lock();

        let value = state
            .ewma
            .entry(provider.clone())
            .and_modify(|ewma| *ewma = *ewma * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA)
            .or_insert(sample);
        let value = *value;
        state.last_good = Some(provider.clone());

        tracing::trace!(provider = %provider, sample_ms = sample, ewma_ms = value, "Latency sample");
    }

    /// Forgets `provider` as last-good after a failure.
    pub fn record_failure(&self, provider: &ProviderId) {
        let mut state = self.state.lock();
        if state.last_good.as_ref() == Some(provider) {
            state.last_good = None;
        }
    }

    /// EWMA latency in milliseconds.
    pub fn ewma(&self, provider: &ProviderId) -> Option<f64> {
        self.state.lock().ewma.get(provider).copied()
    }

    /// Provider that last delivered a fast-lane message.
    pub fn last_good(&self) -> Option<ProviderId> {
        self.state.lock().last_good.clone()
    }

    /// Moves the last-good provider to the front; order is otherwise kept.
    pub fn order_for_fast_lane(&self, providers: &[ProviderDescriptor]) -> Vec<ProviderDescriptor> {
        let mut ordered = providers.to_vec();
        if let Some(last_good) = self.last_good() {
            if let Some(pos) = ordered.iter().position(|p| p.id == last_good) {
                let provider = ordered.remove(pos);
                ordered.insert(0, provider);
            }
        }
        ordered
    }

    /// Forgets all samples.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.ewma.clear();
        state.last_good = None;
    }
}
