//! Observability for the delivery engine.
//!
//! Structured logging is done with `tracing` events throughout the crate;
//! this module installs a subscriber and keeps the engine's counters.

mod logging;
mod metrics;

pub use logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
pub use metrics::{DeliveryMetrics, MetricsSnapshot};
