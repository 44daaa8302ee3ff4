//! Delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::message::Lane;

/// Engine-wide delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    /// Messages delivered.
    pub sent: AtomicU64,
    /// Messages that exhausted every provider.
    pub failed: AtomicU64,
    /// Network attempts.
    pub attempts: AtomicU64,
    /// Deliveries that needed more than one provider.
    pub fallbacks: AtomicU64,
    /// Breaker openings.
    pub breaker_trips: AtomicU64,
    /// Providers skipped because their breaker was open.
    pub skipped_open: AtomicU64,
    /// Fast-lane attempts cut off by the deadline.
    pub fast_lane_timeouts: AtomicU64,
    /// Sends that joined an in-flight identical send.
    pub dedupe_hits: AtomicU64,
    /// Fast-lane deliveries.
    pub fast_lane_sent: AtomicU64,
    /// Normal-lane deliveries.
    pub normal_lane_sent: AtomicU64,
}

impl DeliveryMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a delivery; `attempt` is 1 for a first-try success.
    pub fn record_sent(&self, lane: Lane, attempt: usize) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        match lane {
            Lane::Fast => self.fast_lane_sent.fetch_add(1, Ordering::Relaxed),
            Lane::Normal => self.normal_lane_sent.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Records a terminal failure.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a network attempt.
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a breaker opening.
    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a provider skipped while open.
    pub fn record_skipped_open(&self) {
        self.skipped_open.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a fast-lane deadline expiry.
    pub fn record_fast_lane_timeout(&self) {
        self.fast_lane_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a deduplicated send.
    pub fn record_dedupe_hit(&self) {
        self.dedupe_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            skipped_open: self.skipped_open.load(Ordering::Relaxed),
            fast_lane_timeouts: self.fast_lane_timeouts.load(Ordering::Relaxed),
            dedupe_hits: self.dedupe_hits.load(Ordering::Relaxed),
            fast_lane_sent: self.fast_lane_sent.load(Ordering::Relaxed),
            normal_lane_sent: self.normal_lane_sent.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters.
    pub fn reset(&self) {
        for counter in [
            &self.sent,
            &self.failed,
            &self.attempts,
            &self.fallbacks,
            &self.breaker_trips,
            &self.skipped_open,
            &self.fast_lane_timeouts,
            &self.dedupe_hits,
            &self.fast_lane_sent,
            &self.normal_lane_sent,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Messages delivered.
    pub sent: u64,
    /// Messages that exhausted every provider.
    pub failed: u64,
    /// Network attempts.
    pub attempts: u64,
    /// Deliveries that needed more than one provider.
    pub fallbacks: u64,
    /// Breaker openings.
    pub breaker_trips: u64,
    /// Providers skipped because their breaker was open.
    pub skipped_open: u64,
    /// Fast-lane attempts cut off by the deadline.
    pub fast_lane_timeouts: u64,
    /// Deduplicated sends.
    pub dedupe_hits: u64,
    /// Fast-lane deliveries.
    pub fast_lane_sent: u64,
    /// Normal-lane deliveries.
    pub normal_lane_sent: u64,
}

impl MetricsSnapshot {
    /// Delivered share of finished sends.
    pub fn success_rate(&self) -> f64 {
        let total = self.sent + self.failed;
        if total == 0 {
            0.0
        } else {
            self.sent as f64 / total as f64
        }
    }
}
