//! Configuration types for the delivery engine.
//!
//! Provides:
//! - Ordered provider credential bundles
//! - Fast-lane and normal-lane transport tunables
//! - Breaker and dedupe tunables
//! - TLS policy (always on, minimum version enforced)
//!
//! Tunables are stored as configured; the `effective_*` accessors apply
//! the clamping ranges, so out-of-range values are tolerated rather than
//! rejected.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::errors::{DeliveryError, DeliveryResult};

/// Default SMTP submission port (STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Implicit TLS submission port.
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Default fast-lane connect/greeting timeout.
pub const DEFAULT_FAST_CONNECT_TIMEOUT: Duration = Duration::from_millis(800);

/// Default fast-lane socket timeout.
pub const DEFAULT_FAST_SOCKET_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Default fast-lane hard deadline per attempt.
pub const DEFAULT_FAST_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Default normal-lane pool size.
pub const DEFAULT_NORMAL_POOL_SIZE: usize = 4;

/// Default quota cooldown.
pub const DEFAULT_QUOTA_COOLDOWN: Duration = Duration::from_secs(12 * 60 * 60);

/// Lowest quota cooldown the breaker will apply.
pub const MIN_QUOTA_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Highest quota cooldown the breaker will apply.
pub const MAX_QUOTA_COOLDOWN: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default dedupe window.
pub const DEFAULT_DEDUPE_WINDOW: Duration = Duration::from_millis(3_000);

fn clamp(value: Duration, min: Duration, max: Duration) -> Duration {
    value.max(min).min(max)
}

/// TLS mode for relay connections. Plaintext is not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// STARTTLS upgrade after the greeting (port 587).
    StartTls,
    /// TLS from the first byte (port 465).
    Implicit,
}

impl TlsMode {
    /// Picks the conventional mode for a port.
    pub fn for_port(port: u16) -> Self {
        if port == IMPLICIT_TLS_PORT {
            TlsMode::Implicit
        } else {
            TlsMode::StartTls
        }
    }
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    /// TLS 1.2 (default).
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

/// TLS policy shared by every provider connection.
///
/// Certificate and hostname verification cannot be disabled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// Minimum protocol version.
    #[serde(default)]
    pub min_version: TlsVersion,
    /// Extra PEM bundle trusted in addition to the webpki roots.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

/// One relay provider's credential bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Stable provider identifier (e.g., "alpha").
    pub id: String,
    /// Human label for logs.
    #[serde(default)]
    pub label: Option<String>,
    /// Relay hostname.
    #[serde(default)]
    pub host: String,
    /// Relay port.
    #[serde(default)]
    pub port: Option<u16>,
    /// TLS mode; derived from the port when absent.
    #[serde(default)]
    pub tls_mode: Option<TlsMode>,
    /// Authentication username.
    #[serde(default)]
    pub username: Option<String>,
    /// Authentication secret.
    #[serde(default)]
    pub password: Option<SecretString>,
    /// From address override for this provider.
    #[serde(default)]
    pub from: Option<String>,
}

impl ProviderConfig {
    /// Creates a provider bundle with the given id and host.
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            host: host.into(),
            port: None,
            tls_mode: None,
            username: None,
            password: None,
            from: None,
        }
    }

    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = Some(mode);
        self
    }

    /// Sets the credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the From override.
    pub fn from_address(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Returns the port, defaulting to submission.
    pub fn effective_port(&self) -> u16 {
        self.port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT)
    }

    /// Returns the TLS mode, derived from the port when unset.
    pub fn effective_tls_mode(&self) -> TlsMode {
        self.tls_mode
            .unwrap_or_else(|| TlsMode::for_port(self.effective_port()))
    }

    /// Names the first required field that is missing or empty.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.id.trim().is_empty() {
            return Some("id");
        }
        if self.host.trim().is_empty() {
            return Some("host");
        }
        if self.username.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Some("username");
        }
        if self
            .password
            .as_ref()
            .map_or(true, |p| p.expose_secret().is_empty())
        {
            return Some("password");
        }
        None
    }
}

/// Fast-lane (OTP-class) tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct FastLaneConfig {
    /// Connect and greeting timeout, clamped to 300ms..=5s.
    #[serde(default = "default_fast_connect", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Socket read/write timeout, clamped to 1s..=30s.
    #[serde(default = "default_fast_socket", with = "humantime_serde")]
    pub socket_timeout: Duration,
    /// Hard per-attempt deadline, clamped to 500ms..=5s.
    #[serde(default = "default_fast_attempt", with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

fn default_fast_connect() -> Duration { DEFAULT_FAST_CONNECT_TIMEOUT }
fn default_fast_socket() -> Duration { DEFAULT_FAST_SOCKET_TIMEOUT }
fn default_fast_attempt() -> Duration { DEFAULT_FAST_ATTEMPT_TIMEOUT }

impl FastLaneConfig {
    /// Connect/greeting timeout after clamping.
    pub fn effective_connect_timeout(&self) -> Duration {
        clamp(self.connect_timeout, Duration::from_millis(300), Duration::from_secs(5))
    }

    /// Socket timeout after clamping.
    pub fn effective_socket_timeout(&self) -> Duration {
        clamp(self.socket_timeout, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Attempt deadline after clamping.
    pub fn effective_attempt_timeout(&self) -> Duration {
        clamp(self.attempt_timeout, Duration::from_millis(500), Duration::from_secs(5))
    }
}

impl Default for FastLaneConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_fast_connect(),
            socket_timeout: default_fast_socket(),
            attempt_timeout: default_fast_attempt(),
        }
    }
}

/// Normal-lane (bulk transactional) tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct NormalLaneConfig {
    /// Pooled connections per provider.
    #[serde(default = "default_normal_pool")]
    pub max_connections: usize,
    /// Connect and greeting timeout.
    #[serde(default = "default_normal_connect", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Socket read/write timeout.
    #[serde(default = "default_normal_socket", with = "humantime_serde")]
    pub socket_timeout: Duration,
    /// Overall per-attempt deadline.
    #[serde(default = "default_normal_attempt", with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

fn default_normal_pool() -> usize { DEFAULT_NORMAL_POOL_SIZE }
fn default_normal_connect() -> Duration { Duration::from_secs(30) }
fn default_normal_socket() -> Duration { Duration::from_secs(60) }
fn default_normal_attempt() -> Duration { Duration::from_secs(120) }

impl NormalLaneConfig {
    /// Pool size, at least one.
    pub fn effective_max_connections(&self) -> usize {
        self.max_connections.max(1)
    }
}

impl Default for NormalLaneConfig {
    fn default() -> Self {
        Self {
            max_connections: default_normal_pool(),
            connect_timeout: default_normal_connect(),
            socket_timeout: default_normal_socket(),
            attempt_timeout: default_normal_attempt(),
        }
    }
}

/// Breaker tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Cooldown applied to quota failures, clamped to 30 minutes..7 days.
    #[serde(default = "default_quota_cooldown", with = "humantime_serde")]
    pub quota_cooldown: Duration,
}

fn default_quota_cooldown() -> Duration { DEFAULT_QUOTA_COOLDOWN }

impl BreakerConfig {
    /// Quota cooldown after applying the floor.
    pub fn effective_quota_cooldown(&self) -> Duration {
        self.quota_cooldown.clamp(MIN_QUOTA_COOLDOWN, MAX_QUOTA_COOLDOWN)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            quota_cooldown: default_quota_cooldown(),
        }
    }
}

/// Fast-lane dedupe tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupeConfig {
    /// How long an identical request is collapsed onto the first one.
    #[serde(default = "default_dedupe_window", with = "humantime_serde")]
    pub window: Duration,
    /// Enable dedupe.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_dedupe_window() -> Duration { DEFAULT_DEDUPE_WINDOW }
fn default_true() -> bool { true }

impl DedupeConfig {
    /// Window after clamping to at least one second.
    pub fn effective_window(&self) -> Duration {
        self.window.max(Duration::from_secs(1))
    }
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            window: default_dedupe_window(),
            enabled: true,
        }
    }
}

/// Delivery engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Providers in priority order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Default From header (e.g., "Shop <no-reply@shop.example>").
    pub default_from: String,
    /// Fast-lane tunables.
    #[serde(default)]
    pub fast_lane: FastLaneConfig,
    /// Normal-lane tunables.
    #[serde(default)]
    pub normal_lane: NormalLaneConfig,
    /// Breaker tunables.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Dedupe tunables.
    #[serde(default)]
    pub dedupe: DedupeConfig,
    /// TLS policy.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Client identifier for EHLO.
    #[serde(default)]
    pub client_id: Option<String>,
}

impl DeliveryConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> DeliveryConfigBuilder {
        DeliveryConfigBuilder::default()
    }

    /// Parses a JSON configuration document.
    pub fn from_json_str(json: &str) -> DeliveryResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DeliveryError::Configuration(format!("invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads configuration from `MAIL_*` environment variables.
    ///
    /// `MAIL_PROVIDERS` lists provider ids in priority order; each provider
    /// reads `MAIL_<ID>_HOST`, `_PORT`, `_USER`, `_PASS`, `_TLS`, `_LABEL`
    /// and `_FROM`.
    pub fn from_env() -> DeliveryResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> DeliveryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let millis = |key: &str| -> DeliveryResult<Option<Duration>> {
            get(key)
                .map(|v| {
                    v.parse::<u64>().map(Duration::from_millis).map_err(|_| {
                        DeliveryError::Configuration(format!("{} must be milliseconds", key))
                    })
                })
                .transpose()
        };

        let mut builder = Self::builder().default_from(
            get("MAIL_FROM")
                .ok_or_else(|| DeliveryError::Configuration("MAIL_FROM is required".into()))?,
        );

        for id in get("MAIL_PROVIDERS").unwrap_or_default().split(',') {
            let id = id.trim();
            if id.is_empty() {
                continue;
            }
            let prefix = format!("MAIL_{}", id.to_ascii_uppercase().replace('-', "_"));
            let var = |suffix: &str| get(&format!("{}_{}", prefix, suffix));

            let mut provider = ProviderConfig::new(id, var("HOST").unwrap_or_default());
            if let Some(port) = var("PORT") {
                provider.port = Some(port.parse().map_err(|_| {
                    DeliveryError::Configuration(format!("{}_PORT must be a port number", prefix))
                })?);
            }
            provider.tls_mode = match var("TLS").as_deref() {
                None => None,
                Some("implicit") | Some("ssl") | Some("true") => Some(TlsMode::Implicit),
                Some("starttls") | Some("false") => Some(TlsMode::StartTls),
                Some(other) => {
                    return Err(DeliveryError::Configuration(format!(
                        "{}_TLS has unknown mode {:?}",
                        prefix, other
                    )))
                }
            };
            provider.username = var("USER");
            provider.password = var("PASS").map(SecretString::new);
            provider.label = var("LABEL");
            provider.from = var("FROM");
            builder = builder.provider(provider);
        }

        if let Some(d) = millis("MAIL_FAST_CONNECT_TIMEOUT_MS")? {
            builder.config.fast_lane.connect_timeout = d;
        }
        if let Some(d) = millis("MAIL_FAST_SOCKET_TIMEOUT_MS")? {
            builder.config.fast_lane.socket_timeout = d;
        }
        if let Some(d) = millis("MAIL_FAST_ATTEMPT_TIMEOUT_MS")? {
            builder.config.fast_lane.attempt_timeout = d;
        }
        if let Some(d) = millis("MAIL_DEDUPE_WINDOW_MS")? {
            builder.config.dedupe.window = d;
        }
        if let Some(minutes) = get("MAIL_QUOTA_COOLDOWN_MINUTES") {
            let minutes: u64 = minutes.parse().map_err(|_| {
                DeliveryError::Configuration("MAIL_QUOTA_COOLDOWN_MINUTES must be an integer".into())
            })?;
            let secs = minutes.checked_mul(60).ok_or_else(|| {
                DeliveryError::Configuration("MAIL_QUOTA_COOLDOWN_MINUTES is out of range".into())
            })?;
            builder.config.breaker.quota_cooldown = Duration::from_secs(secs);
        }

        builder.build()
    }

    /// Validates the configuration.
    ///
    /// Incomplete provider bundles are not errors here; the registry skips them.
    pub fn validate(&self) -> DeliveryResult<()> {
        if self.default_from.trim().is_empty() {
            return Err(DeliveryError::Configuration("default_from is required".into()));
        }

        if self.breaker.quota_cooldown > MAX_QUOTA_COOLDOWN {
            return Err(DeliveryError::Configuration(format!(
                "quota_cooldown must not exceed {}",
                humantime::format_duration(MAX_QUOTA_COOLDOWN)
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(DeliveryError::Configuration(format!(
                    "duplicate provider id {:?}",
                    provider.id
                )));
            }
        }

        Ok(())
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for [`DeliveryConfig`].
#[derive(Debug)]
pub struct DeliveryConfigBuilder {
    config: DeliveryConfig,
}

impl Default for DeliveryConfigBuilder {
    fn default() -> Self {
        Self {
            config: DeliveryConfig {
                providers: Vec::new(),
                default_from: String::new(),
                fast_lane: FastLaneConfig::default(),
                normal_lane: NormalLaneConfig::default(),
                breaker: BreakerConfig::default(),
                dedupe: DedupeConfig::default(),
                tls: TlsConfig::default(),
                client_id: None,
            },
        }
    }
}

impl DeliveryConfigBuilder {
    /// Appends a provider; order of calls is priority order.
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.config.providers.push(provider);
        self
    }

    /// Sets the default From header.
    pub fn default_from(mut self, from: impl Into<String>) -> Self {
        self.config.default_from = from.into();
        self
    }

    /// Sets the fast-lane tunables.
    pub fn fast_lane(mut self, config: FastLaneConfig) -> Self {
        self.config.fast_lane = config;
        self
    }

    /// Sets the normal-lane tunables.
    pub fn normal_lane(mut self, config: NormalLaneConfig) -> Self {
        self.config.normal_lane = config;
        self
    }

    /// Sets the quota cooldown.
    pub fn quota_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.breaker.quota_cooldown = cooldown;
        self
    }

    /// Sets the dedupe window.
    pub fn dedupe_window(mut self, window: Duration) -> Self {
        self.config.dedupe.window = window;
        self
    }

    /// Disables fast-lane dedupe.
    pub fn no_dedupe(mut self) -> Self {
        self.config.dedupe.enabled = false;
        self
    }

    /// Sets the TLS policy.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.config.tls = config;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = Some(id.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> DeliveryResult<DeliveryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_builder_keeps_provider_order() {
        let config = DeliveryConfig::builder()
            .default_from("Shop <no-reply@shop.example>")
            .provider(ProviderConfig::new("alpha", "smtp.alpha.example").credentials("u", "p"))
            .provider(ProviderConfig::new("beta", "smtp.beta.example").credentials("u", "p"))
            .build()
            .unwrap();

        let ids: Vec<_> = config.providers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["alpha", "beta"]);
        assert_eq!(config.client_id(), "localhost");
    }

    #[test]
    fn test_missing_from_rejected() {
        assert!(DeliveryConfig::builder().build().is_err());
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let result = DeliveryConfig::builder()
            .default_from("no-reply@shop.example")
            .provider(ProviderConfig::new("alpha", "a.example"))
            .provider(ProviderConfig::new("alpha", "b.example"))
            .build();
        assert!(matches!(result, Err(DeliveryError::Configuration(_))));
    }

    #[test]
    fn test_clamping() {
        let fast = FastLaneConfig {
            connect_timeout: Duration::from_millis(10),
            socket_timeout: Duration::from_secs(120),
            attempt_timeout: Duration::from_millis(100),
        };
        assert_eq!(fast.effective_connect_timeout(), Duration::from_millis(300));
        assert_eq!(fast.effective_socket_timeout(), Duration::from_secs(30));
        assert_eq!(fast.effective_attempt_timeout(), Duration::from_millis(500));

        let breaker = BreakerConfig { quota_cooldown: Duration::from_secs(60) };
        assert_eq!(breaker.effective_quota_cooldown(), MIN_QUOTA_COOLDOWN);

        let breaker = BreakerConfig { quota_cooldown: Duration::from_secs(u64::MAX / 2) };
        assert_eq!(breaker.effective_quota_cooldown(), MAX_QUOTA_COOLDOWN);

        let dedupe = DedupeConfig { window: Duration::from_millis(200), enabled: true };
        assert_eq!(dedupe.effective_window(), Duration::from_secs(1));
    }

    #[test]
    fn test_tls_mode_from_port() {
        let implicit = ProviderConfig::new("a", "h").port(465);
        assert_eq!(implicit.effective_tls_mode(), TlsMode::Implicit);

        let submission = ProviderConfig::new("a", "h");
        assert_eq!(submission.effective_port(), DEFAULT_PORT);
        assert_eq!(submission.effective_tls_mode(), TlsMode::StartTls);
    }

    #[test]
    fn test_missing_field() {
        assert_eq!(ProviderConfig::new("a", "h").missing_field(), Some("username"));
        assert_eq!(
            ProviderConfig::new("a", "h").credentials("user", "").missing_field(),
            Some("password")
        );
        assert_eq!(ProviderConfig::new("a", " ").missing_field(), Some("host"));
        assert_eq!(ProviderConfig::new("a", "h").credentials("u", "p").missing_field(), None);
    }

    #[test]
    fn test_from_json() {
        let config = DeliveryConfig::from_json_str(
            r#"{
                "default_from": "no-reply@shop.example",
                "providers": [
                    {"id": "alpha", "host": "smtp.alpha.example", "port": 465,
                     "username": "u", "password": "p"}
                ],
                "fast_lane": {"attempt_timeout": "2s"},
                "breaker": {"quota_cooldown": "6h"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.providers[0].effective_tls_mode(), TlsMode::Implicit);
        assert_eq!(config.fast_lane.attempt_timeout, Duration::from_secs(2));
        assert_eq!(config.fast_lane.connect_timeout, DEFAULT_FAST_CONNECT_TIMEOUT);
        assert_eq!(config.breaker.quota_cooldown, Duration::from_secs(6 * 3600));
        assert!(config.dedupe.enabled);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("MAIL_FROM", "Shop <no-reply@shop.example>"),
            ("MAIL_PROVIDERS", "alpha, beta-2"),
            ("MAIL_ALPHA_HOST", "smtp.alpha.example"),
            ("MAIL_ALPHA_PORT", "465"),
            ("MAIL_ALPHA_USER", "alpha-user"),
            ("MAIL_ALPHA_PASS", "secret"),
            ("MAIL_BETA_2_HOST", "smtp.beta.example"),
            ("MAIL_BETA_2_TLS", "starttls"),
            ("MAIL_DEDUPE_WINDOW_MS", "5000"),
            ("MAIL_QUOTA_COOLDOWN_MINUTES", "90"),
        ]
        .into_iter()
        .collect();

        let config =
            DeliveryConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].port, Some(465));
        assert_eq!(config.providers[0].missing_field(), None);
        assert_eq!(config.providers[1].id, "beta-2");
        assert_eq!(config.providers[1].tls_mode, Some(TlsMode::StartTls));
        assert_eq!(config.providers[1].missing_field(), Some("username"));
        assert_eq!(config.dedupe.window, Duration::from_secs(5));
        assert_eq!(config.breaker.quota_cooldown, Duration::from_secs(90 * 60));
    }

    #[test]
    fn test_quota_cooldown_above_cap_rejected() {
        let result = DeliveryConfig::builder()
            .default_from("no-reply@shop.example")
            .quota_cooldown(MAX_QUOTA_COOLDOWN + Duration::from_secs(1))
            .build();
        assert!(matches!(result, Err(DeliveryError::Configuration(_))));

        let config = DeliveryConfig::builder()
            .default_from("no-reply@shop.example")
            .quota_cooldown(MAX_QUOTA_COOLDOWN)
            .build()
            .unwrap();
        assert_eq!(config.breaker.effective_quota_cooldown(), MAX_QUOTA_COOLDOWN);
    }

    #[test]
    fn test_from_lookup_rejects_overflowing_quota_cooldown() {
        let vars: HashMap<&str, String> = [
            ("MAIL_FROM", "no-reply@shop.example".to_string()),
            ("MAIL_QUOTA_COOLDOWN_MINUTES", u64::MAX.to_string()),
        ]
        .into_iter()
        .collect();

        let result = DeliveryConfig::from_lookup(|key| vars.get(key).cloned());
        assert!(matches!(result, Err(DeliveryError::Configuration(_))));
    }

    #[test]
    fn test_from_lookup_bad_port() {
        let result = DeliveryConfig::from_lookup(|key| match key {
            "MAIL_FROM" => Some("no-reply@shop.example".into()),
            "MAIL_PROVIDERS" => Some("alpha".into()),
            "MAIL_ALPHA_PORT" => Some("smtp".into()),
            _ => None,
        });
        assert!(matches!(result, Err(DeliveryError::Configuration(_))));
    }
}
