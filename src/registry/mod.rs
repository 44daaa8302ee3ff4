//! Provider registry.
//!
//! Turns the configured credential bundles into an ordered, immutable list
//! of [`ProviderDescriptor`]s. Incomplete bundles are skipped, not rejected.

use std::fmt;

use secrecy::SecretString;
use serde::Serialize;

use crate::config::{DeliveryConfig, ProviderConfig, TlsMode};
use crate::errors::{DeliveryError, DeliveryResult};
use crate::message::Address;

/// Stable provider identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// Creates a provider id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Where a provider's relay listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname.
    pub host: String,
    /// Port.
    pub port: u16,
    /// TLS mode.
    pub tls_mode: TlsMode,
}

impl Endpoint {
    /// Returns "host:port".
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Provider login.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Secret.
    pub password: SecretString,
}

/// An immutable, fully configured relay provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    /// Identifier.
    pub id: ProviderId,
    /// Human label.
    pub label: String,
    /// Relay endpoint.
    pub endpoint: Endpoint,
    /// Login.
    pub credentials: Credentials,
    /// From override.
    pub from: Option<Address>,
    /// Position in the configured order (0 = highest).
    pub priority: usize,
}

impl ProviderDescriptor {
    /// Builds a descriptor from a complete credential bundle.
    pub fn from_config(config: &ProviderConfig, priority: usize) -> DeliveryResult<Self> {
        if let Some(field) = config.missing_field() {
            return Err(DeliveryError::Configuration(format!(
                "provider {:?} is missing {}",
                config.id, field
            )));
        }

        let from = config.from.as_deref().map(Address::parse).transpose()?;

        Ok(Self {
            id: ProviderId::new(config.id.trim()),
            label: config.label.clone().unwrap_or_else(|| config.id.clone()),
            endpoint: Endpoint {
                host: config.host.trim().to_string(),
                port: config.effective_port(),
                tls_mode: config.effective_tls_mode(),
            },
            credentials: Credentials {
                username: config.username.clone().unwrap_or_default(),
                password: config
                    .password
                    .clone()
                    .unwrap_or_else(|| SecretString::new(String::new())),
            },
            from,
            priority,
        })
    }
}

/// Ordered list of usable providers.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<ProviderDescriptor>,
}

impl ProviderRegistry {
    /// Builds the registry in configured order, skipping incomplete bundles.
    pub fn from_config(config: &DeliveryConfig) -> Self {
        let mut providers = Vec::with_capacity(config.providers.len());

        for provider in &config.providers {
            match ProviderDescriptor::from_config(provider, providers.len()) {
                Ok(descriptor) => providers.push(descriptor),
                Err(e) => tracing::warn!(provider = %provider.id, error = %e, "Skipping mail provider"),
            }
        }

        if providers.is_empty() {
            tracing::warn!("No mail providers configured");
        }

        Self { providers }
    }

    /// Returns providers in priority order.
    pub fn list(&self) -> &[ProviderDescriptor] {
        &self.providers
    }

    /// Looks up a provider by id.
    pub fn get(&self, id: &ProviderId) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| &p.id == id)
    }

    /// Number of usable providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true when nothing usable is configured.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
