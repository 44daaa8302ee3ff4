//! Send orchestration.
//!
//! [`DeliveryEngine`] owns every piece of shared state: registry, breakers,
//! latency samples, pools, the dedupe gate and metrics. A send walks the
//! providers in order, skipping open breakers, until one accepts the message
//! or the list is exhausted.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::time::{timeout, Instant};
use tracing::Instrument;

use crate::breaker::{BreakerSnapshot, CircuitBreakerStore};
use crate::classifier::ErrorClassifier;
use crate::config::DeliveryConfig;
use crate::dedupe::DedupeGate;
use crate::errors::{DeliveryError, DeliveryResult, TransportError, TransportErrorKind, TransportResult};
use crate::latency::LatencyTracker;
use crate::message::{Address, Envelope, Lane, MessageBase, OutboundMessage, Receipt};
use crate::observability::{DeliveryMetrics, MetricsSnapshot};
use crate::registry::{ProviderDescriptor, ProviderRegistry};
use crate::transport::{LaneSettings, PoolStatus, RelayConnector, SendAck, SmtpConnector, TransportPool};


struct EngineInner {
    default_from: Address,
    registry: ProviderRegistry,
    breakers: CircuitBreakerStore,
    latency: LatencyTracker,
    pool: TransportPool,
    dedupe: DedupeGate,
    metrics: DeliveryMetrics,
    fast: LaneSettings,
    normal: LaneSettings,
}

/// Multi-provider delivery engine.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("providers", &self.inner.registry.len())
            .field("default_from", &self.inner.default_from)
            .finish()
    }
}

impl DeliveryEngine {
    /// Creates an engine over any relay connector.
    pub fn new(config: DeliveryConfig, connector: Arc<dyn RelayConnector>) -> DeliveryResult<Self> {
        config.validate()?;
        let default_from = Address::parse(&config.default_from)?;
        let registry = ProviderRegistry::from_config(&config);

        let breakers = CircuitBreakerStore::new(ErrorClassifier::new(&config.breaker));
        for provider in registry.list() {
            breakers.register(&provider.id);
        }

        tracing::info!(
            providers = registry.len(),
            fast_attempt_timeout_ms = config.fast_lane.effective_attempt_timeout().as_millis() as u64,
            "Delivery engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                default_from,
                breakers,
                latency: LatencyTracker::new(),
                pool: TransportPool::new(connector),
                dedupe: DedupeGate::new(&config.dedupe),
                metrics: DeliveryMetrics::new(),
                fast: LaneSettings::fast(&config.fast_lane),
                normal: LaneSettings::normal(&config.normal_lane),
                registry,
            }),
        })
    }

    /// Creates an engine that talks SMTP over rustls.
    pub fn with_smtp(config: DeliveryConfig) -> DeliveryResult<Self> {
        let connector = SmtpConnector::new(&config.tls, config.client_id())?;
        Self::new(config, Arc::new(connector))
    }

    /// Delivers a message through the first provider that accepts it.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::NoProvidersConfigured`] when the registry is empty
    /// - [`DeliveryError::InvalidMessage`] when the message cannot be composed
    /// - [`DeliveryError::AllProvidersExhausted`] when every provider was open
    ///   or failed
    pub async fn send(&self, message: OutboundMessage) -> DeliveryResult<Receipt> {
        if self.inner.registry.is_empty() {
            return Err(DeliveryError::NoProvidersConfigured);
        }

        let started = Instant::now();
        let base = MessageBase::compose(message, &self.inner.default_from)?;

        match base.message().lane {
            Lane::Normal => self.deliver(base, started).await,
            Lane::Fast => {
                let fingerprint = DedupeGate::fingerprint(base.message());
                let engine = self.clone();
                let result = self
                    .inner
                    .dedupe
                    .run(fingerprint, move || {
                        async move { engine.deliver(base, started).await }.boxed()
                    })
                    .await;

                if matches!(&result, Ok(receipt) if receipt.deduplicated) {
                    self.inner.metrics.record_dedupe_hit();
                }
                result
            }
        }
    }

    async fn deliver(&self, base: MessageBase, started: Instant) -> DeliveryResult<Receipt> {
        let lane = base.message().lane;
        let span = tracing::info_span!("deliver", %lane, message_id = %base.message_id());
        self.deliver_inner(base, lane, started).instrument(span).await
    }

    async fn deliver_inner(&self, base: MessageBase, lane: Lane, started: Instant) -> DeliveryResult<Receipt> {
        let inner = &self.inner;
        let (settings, providers) = match lane {
            Lane::Fast => (inner.fast, inner.latency.order_for_fast_lane(inner.registry.list())),
            Lane::Normal => (inner.normal, inner.registry.list().to_vec()),
        };

        let mut attempts = 0;
        let mut last_category = None;

        for provider in &providers {
            if inner.breakers.is_open(&provider.id) {
                inner.metrics.record_skipped_open();
                tracing::debug!(provider = %provider.id, "Skipping provider with open circuit");
                continue;
            }

            attempts += 1;
            inner.metrics.record_attempt();
            let envelope = Envelope::for_provider(&base, provider);
            let attempt_started = Instant::now();

            match self.attempt(provider, &settings, &envelope).await {
                Ok(ack) => {
                    let rtt = attempt_started.elapsed();
                    inner.breakers.record_success(&provider.id);
                    if lane == Lane::Fast {
                        inner.latency.record(&provider.id, rtt);
                    }
                    inner.metrics.record_sent(lane, attempts);

                    tracing::info!(
                        provider = %provider.id,
                        elapsed_ms = rtt.as_millis() as u64,
                        attempt = attempts,
                        outcome = "sent",
                        "Message delivered"
                    );

                    return Ok(Receipt {
                        provider_id: provider.id.clone(),
                        message_id: envelope.message_id,
                        response: ack.response,
                        accepted: ack.accepted,
                        lane,
                        elapsed: started.elapsed(),
                        deduplicated: false,
                    });
                }
                Err(error) => {
                    let classification = inner.breakers.record_failure(&provider.id, &error);
                    inner.metrics.record_breaker_trip();
                    inner.latency.record_failure(&provider.id);
                    last_category = Some(classification.category);

                    tracing::warn!(
                        provider = %provider.id,
                        elapsed_ms = attempt_started.elapsed().as_millis() as u64,
                        attempt = attempts,
                        outcome = "failed",
                        category = %classification.category,
                        error = %error,
                        "Delivery attempt failed"
                    );
                }
            }
        }

        inner.metrics.record_failed();
        let error = DeliveryError::AllProvidersExhausted {
            category: last_category,
            attempts,
            breakers: inner.breakers.snapshot(),
        };
        tracing::error!(attempts, error = %error, "Message not delivered");
        Err(error)
    }

    // One provider, one deadline. On expiry the attempt future is dropped,
    // which drops its socket, and the lane's pool is discarded.
    async fn attempt(
        &self,
        provider: &ProviderDescriptor,
        settings: &LaneSettings,
        envelope: &Envelope,
    ) -> TransportResult<SendAck> {
        let pool = &self.inner.pool;
        let work = async {
            let mut conn = pool.acquire(provider, settings).await?;
            let result = conn.send(envelope).await;
            if let Err(e) = &result {
                if e.kind().is_connection_level() {
                    TransportPool::detach(conn);
                }
            }
            result
        };

        match timeout(settings.attempt_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                pool.discard(&provider.id, settings.lane);
                Err(self.deadline_error(settings))
            }
        }
    }

    fn deadline_error(&self, settings: &LaneSettings) -> TransportError {
        let deadline_ms = settings.attempt_timeout.as_millis() as u64;
        match settings.lane {
            Lane::Fast => {
                self.inner.metrics.record_fast_lane_timeout();
                TransportError::fast_lane_timeout(deadline_ms)
            }
            Lane::Normal => TransportError::new(
                TransportErrorKind::ReadTimeout,
                format!("attempt timed out after {}ms", deadline_ms),
            ),
        }
    }

    /// Breaker state of every provider.
    pub fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.inner.breakers.snapshot()
    }

    /// Fast-lane latency samples.
    pub fn latency(&self) -> &LatencyTracker {
        &self.inner.latency
    }

    /// Status of every live connection pool.
    pub fn pool_status(&self) -> Vec<PoolStatus> {
        self.inner.pool.status()
    }

    /// Delivery counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Providers in priority order.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    /// Clears breakers, latency samples, dedupe entries, pools and counters.
    pub fn reset_state(&self) {
        let inner = &self.inner;
        inner.breakers.reset();
        for provider in inner.registry.list() {
            inner.breakers.register(&provider.id);
        }
        inner.latency.reset();
        inner.dedupe.clear();
        inner.pool.clear();
        inner.metrics.reset();
        tracing::info!("Delivery engine state reset");
    }
}
