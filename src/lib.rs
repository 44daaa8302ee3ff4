//! # Mail Delivery Engine
//!
//! Transactional mail delivery across several SMTP relay providers:
//! - Ordered failover across providers with complete credentials
//! - Per-provider circuit breakers with category-based, escalating cooldowns
//! - A fast lane for one-time-code mail: one warm connection per provider,
//!   a hard per-attempt deadline, latency-aware ordering and dedupe of
//!   identical in-flight sends
//! - A pooled normal lane for everything else
//! - Structured logging and delivery counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_mail_delivery::{DeliveryConfig, DeliveryEngine, Lane, OutboundMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DeliveryConfig::from_env()?;
//!     let engine = DeliveryEngine::with_smtp(config)?;
//!
//!     let message = OutboundMessage::builder()
//!         .to("user@example.com")?
//!         .subject("Your verification code")
//!         .text("Your code is 123456")
//!         .lane(Lane::Fast)
//!         .build()?;
//!
//!     let receipt = engine.send(message).await?;
//!     println!("Delivered via {} as {}", receipt.provider_id, receipt.message_id);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod message;
pub mod registry;

// Failure handling
pub mod breaker;
pub mod classifier;
pub mod latency;

// Transport layer
pub mod transport;

// Orchestration
pub mod dedupe;
pub mod engine;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use breaker::{BreakerSnapshot, CircuitBreakerStore, CircuitState};
pub use classifier::{Classification, ErrorClassifier};
pub use config::{
    BreakerConfig, DedupeConfig, DeliveryConfig, DeliveryConfigBuilder, FastLaneConfig,
    NormalLaneConfig, ProviderConfig, TlsConfig, TlsMode, TlsVersion,
};
pub use dedupe::DedupeGate;
pub use engine::DeliveryEngine;
pub use errors::{
    DeliveryError, DeliveryResult, FailureCategory, TransportError, TransportErrorKind,
    TransportResult,
};
pub use latency::LatencyTracker;
pub use message::{Address, Envelope, Lane, OutboundMessage, OutboundMessageBuilder, Receipt};
pub use observability::{init_logging, DeliveryMetrics, LogFormat, LoggingConfig, MetricsSnapshot};
pub use registry::{ProviderDescriptor, ProviderId, ProviderRegistry};
pub use transport::{LaneSettings, PoolStatus, RelayConnection, RelayConnector, SmtpConnector, TransportPool};
