//! Transport layer for relay connections.
//!
//! Provides:
//! - [`RelayConnector`] / [`RelayConnection`], the seam between the engine
//!   and the wire
//! - [`LaneSettings`], per-lane timeouts and pool sizing
//! - [`TransportPool`], pooled connections keyed by provider and lane
//! - [`SmtpConnector`], the SMTP implementation over rustls

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{FastLaneConfig, NormalLaneConfig};
use crate::errors::TransportResult;
use crate::message::{Address, Envelope, Lane};
use crate::registry::ProviderDescriptor;

pub mod pool;
pub mod smtp;

pub use pool::{PoolKey, PoolStatus, PooledConnection, TransportPool};
pub use smtp::{SmtpConnector, SmtpReply};

/// Server acknowledgment of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    /// Final reply text after the message body.
    pub response: String,
    /// Recipients the server accepted.
    pub accepted: Vec<Address>,
    /// Recipients the server refused, with the reply text.
    pub rejected: Vec<(Address, String)>,
}

/// Opens authenticated relay sessions.
#[async_trait]
pub trait RelayConnector: Send + Sync + fmt::Debug + 'static {
    /// Connects, secures and authenticates a session with `provider`.
    async fn connect(
        &self,
        provider: &ProviderDescriptor,
        settings: &LaneSettings,
    ) -> TransportResult<Box<dyn RelayConnection>>;
}

/// An open, authenticated relay session.
///
/// Sessions end when the connection is dropped, which closes the socket.
#[async_trait]
pub trait RelayConnection: Send + fmt::Debug {
    /// Transmits one message.
    async fn send(&mut self, envelope: &Envelope) -> TransportResult<SendAck>;

    /// Checks the session is still usable.
    async fn health_check(&mut self) -> TransportResult<()>;
}

/// Connection tunables for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneSettings {
    /// Lane these settings apply to.
    pub lane: Lane,
    /// TCP connect and greeting timeout.
    pub connect_timeout: Duration,
    /// Per-read and per-write timeout.
    pub socket_timeout: Duration,
    /// Overall deadline for one attempt.
    pub attempt_timeout: Duration,
    /// Pooled connections per provider.
    pub max_connections: usize,
}

impl LaneSettings {
    /// Fast-lane settings; always a single connection.
    pub fn fast(config: &FastLaneConfig) -> Self {
        Self {
            lane: Lane::Fast,
            connect_timeout: config.effective_connect_timeout(),
            socket_timeout: config.effective_socket_timeout(),
            attempt_timeout: config.effective_attempt_timeout(),
            max_connections: 1,
        }
    }

    /// Normal-lane settings.
    pub fn normal(config: &NormalLaneConfig) -> Self {
        Self {
            lane: Lane::Normal,
            connect_timeout: config.connect_timeout,
            socket_timeout: config.socket_timeout,
            attempt_timeout: config.attempt_timeout,
            max_connections: config.effective_max_connections(),
        }
    }
}
