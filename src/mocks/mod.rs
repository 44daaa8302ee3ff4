//! Mock implementations for testing.
//!
//! [`MockConnector`] stands in for real relays. Each provider gets a script
//! of [`MockBehavior`]s consumed one per connect or send, plus counters for
//! asserting how often the engine touched it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::{TransportError, TransportErrorKind, TransportResult};
use crate::message::Envelope;
use crate::registry::{ProviderDescriptor, ProviderId};
use crate::transport::{LaneSettings, RelayConnection, RelayConnector, SendAck};

/// Scripted outcome of one connect or send.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Accept the message after `latency`.
    Accept {
        /// Simulated round-trip time.
        latency: Duration,
    },
    /// Fail while connecting.
    FailConnect {
        /// Error kind.
        kind: TransportErrorKind,
        /// Error message.
        message: String,
        /// Time before failing.
        latency: Duration,
    },
    /// Refuse the message with an SMTP reply.
    Reject {
        /// Reply code.
        code: u16,
        /// Reply text.
        message: String,
        /// Time before refusing.
        latency: Duration,
    },
    /// Fail mid-send at the socket level.
    FailSend {
        /// Error kind.
        kind: TransportErrorKind,
        /// Error message.
        message: String,
    },
    /// Never complete the send.
    Hang,
}

impl MockBehavior {
    /// Accepts immediately.
    pub fn accept() -> Self {
        Self::Accept { latency: Duration::ZERO }
    }

    /// Accepts after `latency`.
    pub fn accept_after(latency: Duration) -> Self {
        Self::Accept { latency }
    }

    /// Fails the connect immediately.
    pub fn fail_connect(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::FailConnect {
            kind,
            message: message.into(),
            latency: Duration::ZERO,
        }
    }

    /// Refuses the message immediately.
    pub fn reject(code: u16, message: impl Into<String>) -> Self {
        Self::Reject {
            code,
            message: message.into(),
            latency: Duration::ZERO,
        }
    }

    /// Drops the connection mid-send.
    pub fn fail_send(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::FailSend {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
struct ProviderState {
    script: VecDeque<MockBehavior>,
    fallback: MockBehavior,
    unhealthy: bool,
    connects: usize,
    connect_failures: usize,
    sends: usize,
    health_checks: usize,
    dropped: usize,
    delivered: Vec<Envelope>,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: MockBehavior::accept(),
            unhealthy: false,
            connects: 0,
            connect_failures: 0,
            sends: 0,
            health_checks: 0,
            dropped: 0,
            delivered: Vec::new(),
        }
    }
}

impl ProviderState {
    fn next(&mut self) -> MockBehavior {
        self.script.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

type SharedState = Arc<Mutex<HashMap<ProviderId, ProviderState>>>;

/// Scripted relay connector.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: SharedState,
}

impl MockConnector {
    /// Creates a connector where every provider accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends behaviors to a provider's script.
    pub fn script(&self, provider: impl Into<ProviderId>, behaviors: impl IntoIterator<Item = MockBehavior>) -> &Self {
        self.state
            .lock()
            .entry(provider.into())
            .or_default()
            .script
            .extend(behaviors);
        self
    }

    /// Sets the behavior used once a provider's script runs out.
    pub fn fallback(&self, provider: impl Into<ProviderId>, behavior: MockBehavior) -> &Self {
        self.state.lock().entry(provider.into()).or_default().fallback = behavior;
        self
    }

    /// Makes health checks pass or fail.
    pub fn set_healthy(&self, provider: impl Into<ProviderId>, healthy: bool) -> &Self {
        self.state.lock().entry(provider.into()).or_default().unhealthy = !healthy;
        self
    }

    fn read<T>(&self, provider: &ProviderId, f: impl FnOnce(&ProviderState) -> T) -> Option<T> {
        self.state.lock().get(provider).map(f)
    }

    /// Successful connects.
    pub fn connects(&self, provider: &ProviderId) -> usize {
        self.read(provider, |s| s.connects).unwrap_or(0)
    }

    /// Network attempts: failed connects plus sends.
    pub fn attempts(&self, provider: &ProviderId) -> usize {
        self.read(provider, |s| s.connect_failures + s.sends).unwrap_or(0)
    }

    /// Network attempts across every provider.
    pub fn total_attempts(&self) -> usize {
        self.state
            .lock()
            .values()
            .map(|s| s.connect_failures + s.sends)
            .sum()
    }

    /// Health checks run.
    pub fn health_checks(&self, provider: &ProviderId) -> usize {
        self.read(provider, |s| s.health_checks).unwrap_or(0)
    }

    /// Connections dropped, i.e. sockets closed.
    pub fn dropped(&self, provider: &ProviderId) -> usize {
        self.read(provider, |s| s.dropped).unwrap_or(0)
    }

    /// Messages accepted by a provider.
    pub fn delivered(&self, provider: &ProviderId) -> Vec<Envelope> {
        self.read(provider, |s| s.delivered.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RelayConnector for MockConnector {
    async fn connect(
        &self,
        provider: &ProviderDescriptor,
        _settings: &LaneSettings,
    ) -> TransportResult<Box<dyn RelayConnection>> {
        let failure = {
            let mut state = self.state.lock();
            let entry = state.entry(provider.id.clone()).or_default();
            let upcoming = entry.script.front().unwrap_or(&entry.fallback).clone();
            match upcoming {
                MockBehavior::FailConnect { .. } => {
                    entry.connect_failures += 1;
                    entry.script.pop_front();
                    Some(upcoming)
                }
                _ => {
                    entry.connects += 1;
                    None
                }
            }
        };

        if let Some(MockBehavior::FailConnect { kind, message, latency }) = failure {
            tokio::time::sleep(latency).await;
            return Err(TransportError::new(kind, message));
        }

        Ok(Box::new(MockConnection {
            provider: provider.id.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// Connection handed out by [`MockConnector`].
#[derive(Debug)]
pub struct MockConnection {
    provider: ProviderId,
    state: SharedState,
}

impl MockConnection {
    fn with_state<T>(&self, f: impl FnOnce(&mut ProviderState) -> T) -> T {
        f(self.state.lock().entry(self.provider.clone()).or_default())
    }
}

#[async_trait]
impl RelayConnection for MockConnection {
    async fn send(&mut self, envelope: &Envelope) -> TransportResult<SendAck> {
        let behavior = self.with_state(|s| {
            s.sends += 1;
            s.next()
        });

        match behavior {
            MockBehavior::Accept { latency } => {
                tokio::time::sleep(latency).await;
                self.with_state(|s| s.delivered.push(envelope.clone()));
                Ok(SendAck {
                    response: "250 2.0.0 OK queued".to_string(),
                    accepted: envelope.recipients.clone(),
                    rejected: Vec::new(),
                })
            }
            MockBehavior::FailConnect { kind, message, latency } => {
                tokio::time::sleep(latency).await;
                Err(TransportError::new(kind, message))
            }
            MockBehavior::Reject { code, message, latency } => {
                tokio::time::sleep(latency).await;
                Err(TransportError::from_reply(code, None, message))
            }
            MockBehavior::FailSend { kind, message } => Err(TransportError::new(kind, message)),
            MockBehavior::Hang => futures::future::pending().await,
        }
    }

    async fn health_check(&mut self) -> TransportResult<()> {
        let unhealthy = self.with_state(|s| {
            s.health_checks += 1;
            s.unhealthy
        });
        if unhealthy {
            Err(TransportError::new(TransportErrorKind::ConnectionReset, "NOOP failed"))
        } else {
            Ok(())
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.with_state(|s| s.dropped += 1);
    }
}
