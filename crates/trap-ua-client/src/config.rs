// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client configuration.
//!
//! [`ClientConfig`] can be assembled in code through [`ClientConfig::builder`]
//! or loaded from YAML, TOML or JSON. Durations use humantime notation
//! (`"500ms"`, `"1m"`).
//!
//! ```
//! use std::time::Duration;
//! use trap_ua_client::backoff::MaxRetry;
//! use trap_ua_client::config::{ClientConfig, ConfigFormat};
//!
//! let config = ClientConfig::from_str(
//!     r#"
//!     endpoint = "opc.tcp://plc-01:4840"
//!     requested_session_timeout = "30s"
//!
//!     [connection_strategy]
//!     max_retry = 5
//!     initial_delay = "200ms"
//!     max_delay = "5s"
//!     "#,
//!     ConfigFormat::Toml,
//! )
//! .unwrap();
//!
//! assert_eq!(config.requested_session_timeout, Duration::from_secs(30));
//! assert_eq!(config.connection_strategy.max_retry, MaxRetry::Bounded(5));
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backoff::ConnectionStrategy;
use crate::error::{ConfigurationError, UaError, UaResult};
use crate::types::{EndpointUrl, SecurityMode, SecurityPolicy, UserIdentity};

// =============================================================================
// ClientConfig
// =============================================================================

/// Configuration of a [`UaClient`](crate::client::UaClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server endpoint URL, e.g. `opc.tcp://localhost:4840`.
    pub endpoint: String,

    /// Application name announced in CreateSession.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Session name announced in CreateSession.
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Message security mode. Passed through to the secure channel.
    #[serde(default)]
    pub security_mode: SecurityMode,

    /// Security policy. Passed through to the secure channel.
    #[serde(default)]
    pub security_policy: SecurityPolicy,

    /// Identity used to activate sessions.
    #[serde(default)]
    pub user_identity: UserIdentity,

    /// Session timeout requested from the server.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub requested_session_timeout: Duration,

    /// Deadline for one connection attempt.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Deadline for ordinary service requests.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Deadline for keep-alive probes.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub keepalive_timeout: Duration,

    /// Deadline for each Republish request.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub republish_timeout: Duration,

    /// Fraction of the session timeout after which an idle session is probed.
    #[serde(default = "default_keepalive_ratio")]
    pub keepalive_ratio: f64,

    /// Requested secure channel token lifetime.
    #[serde(default = "default_channel_lifetime", with = "humantime_serde")]
    pub secure_channel_lifetime: Duration,

    /// Require the endpoint URL to match one advertised by the server.
    #[serde(default)]
    pub endpoint_must_exist: bool,

    /// Retry policy for connect and reconnect.
    #[serde(default)]
    pub connection_strategy: ConnectionStrategy,

    /// Defaults for new subscriptions.
    #[serde(default)]
    pub subscription_defaults: SubscriptionDefaults,
}

fn default_application_name() -> String {
    "TRAP OPC UA Client".to_string()
}

fn default_session_name() -> String {
    "trap-ua-session".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_keepalive_ratio() -> f64 {
    0.5
}

fn default_channel_lifetime() -> Duration {
    Duration::from_secs(600)
}

impl ClientConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Creates a configuration with defaults for everything but the endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            application_name: default_application_name(),
            session_name: default_session_name(),
            security_mode: SecurityMode::default(),
            security_policy: SecurityPolicy::default(),
            user_identity: UserIdentity::default(),
            requested_session_timeout: default_session_timeout(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            keepalive_timeout: default_request_timeout(),
            republish_timeout: default_request_timeout(),
            keepalive_ratio: default_keepalive_ratio(),
            secure_channel_lifetime: default_channel_lifetime(),
            endpoint_must_exist: false,
            connection_strategy: ConnectionStrategy::default(),
            subscription_defaults: SubscriptionDefaults::default(),
        }
    }

    /// Validates this configuration.
    pub fn validate(&self) -> UaResult<()> {
        EndpointUrl::parse(&self.endpoint).map_err(|e| {
            UaError::configuration(ConfigurationError::invalid_value("endpoint", e.to_string()))
        })?;

        if self.security_mode == SecurityMode::None && self.security_policy != SecurityPolicy::None
        {
            return Err(ConfigurationError::invalid_value(
                "security_policy",
                "a security policy requires a security mode other than None",
            )
            .into());
        }

        let timeouts = [
            ("requested_session_timeout", self.requested_session_timeout),
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
            ("keepalive_timeout", self.keepalive_timeout),
            ("republish_timeout", self.republish_timeout),
            ("secure_channel_lifetime", self.secure_channel_lifetime),
        ];
        for (field, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigurationError::invalid_value(field, "must be greater than 0").into());
            }
        }

        if !(self.keepalive_ratio > 0.0 && self.keepalive_ratio < 1.0) {
            return Err(ConfigurationError::invalid_value(
                "keepalive_ratio",
                format!("{} is outside (0, 1)", self.keepalive_ratio),
            )
            .into());
        }

        self.connection_strategy.validate()?;
        self.subscription_defaults.validate()?;
        Ok(())
    }

    /// Parses the configured endpoint.
    pub fn endpoint_url(&self) -> UaResult<EndpointUrl> {
        EndpointUrl::parse(&self.endpoint)
    }

    /// Parses and validates a configuration from a string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str, format: ConfigFormat) -> UaResult<Self> {
        let config: Self = parse_str(content, format)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    ///
    /// The format follows the extension: `.yaml`/`.yml`, `.toml` or `.json`.
    pub fn from_file(path: impl AsRef<Path>) -> UaResult<Self> {
        let path = path.as_ref();
        info!("Loading client configuration from: {}", path.display());

        let format = ConfigFormat::from_path(path)?;
        let content = fs::read_to_string(path).map_err(|e| ConfigurationError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let config = Self::from_str(&content, format)?;
        debug!(
            endpoint = %config.endpoint,
            max_retry = %config.connection_strategy.max_retry,
            "Client configuration loaded"
        );
        Ok(config)
    }
}

// =============================================================================
// ClientConfigBuilder
// =============================================================================

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    endpoint: Option<String>,
    application_name: Option<String>,
    session_name: Option<String>,
    security_mode: Option<SecurityMode>,
    security_policy: Option<SecurityPolicy>,
    user_identity: Option<UserIdentity>,
    requested_session_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    keepalive_timeout: Option<Duration>,
    republish_timeout: Option<Duration>,
    keepalive_ratio: Option<f64>,
    secure_channel_lifetime: Option<Duration>,
    endpoint_must_exist: Option<bool>,
    connection_strategy: Option<ConnectionStrategy>,
    subscription_defaults: Option<SubscriptionDefaults>,
}

impl ClientConfigBuilder {
    /// Sets the server endpoint URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Sets the session name.
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    /// Sets the security mode.
    pub fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = Some(mode);
        self
    }

    /// Sets the security policy.
    pub fn security_policy(mut self, policy: SecurityPolicy) -> Self {
        self.security_policy = Some(policy);
        self
    }

    /// Sets username/password authentication.
    pub fn username(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_identity = Some(UserIdentity::UserName {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Sets the requested session timeout.
    pub fn requested_session_timeout(mut self, timeout: Duration) -> Self {
        self.requested_session_timeout = Some(timeout);
        self
    }

    /// Sets the connection attempt timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the keep-alive probe timeout.
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = Some(timeout);
        self
    }

    /// Sets the Republish timeout.
    pub fn republish_timeout(mut self, timeout: Duration) -> Self {
        self.republish_timeout = Some(timeout);
        self
    }

    /// Sets the idle fraction of the session timeout that triggers a keep-alive.
    pub fn keepalive_ratio(mut self, ratio: f64) -> Self {
        self.keepalive_ratio = Some(ratio);
        self
    }

    /// Sets the requested secure channel lifetime.
    pub fn secure_channel_lifetime(mut self, lifetime: Duration) -> Self {
        self.secure_channel_lifetime = Some(lifetime);
        self
    }

    /// Requires the endpoint to be advertised by the server.
    pub fn endpoint_must_exist(mut self, required: bool) -> Self {
        self.endpoint_must_exist = Some(required);
        self
    }

    /// Sets the connection strategy.
    pub fn connection_strategy(mut self, strategy: ConnectionStrategy) -> Self {
        self.connection_strategy = Some(strategy);
        self
    }

    /// Sets the subscription defaults.
    pub fn subscription_defaults(mut self, defaults: SubscriptionDefaults) -> Self {
        self.subscription_defaults = Some(defaults);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> UaResult<ClientConfig> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| ConfigurationError::invalid_value("endpoint", "is required"))?;
        let mut config = ClientConfig::new(endpoint);

        if let Some(v) = self.application_name {
            config.application_name = v;
        }
        if let Some(v) = self.session_name {
            config.session_name = v;
        }
        if let Some(v) = self.security_mode {
            config.security_mode = v;
        }
        if let Some(v) = self.security_policy {
            config.security_policy = v;
        }
        if let Some(v) = self.user_identity {
            config.user_identity = v;
        }
        if let Some(v) = self.requested_session_timeout {
            config.requested_session_timeout = v;
        }
        if let Some(v) = self.connect_timeout {
            config.connect_timeout = v;
        }
        if let Some(v) = self.request_timeout {
            config.request_timeout = v;
        }
        if let Some(v) = self.keepalive_timeout {
            config.keepalive_timeout = v;
        }
        if let Some(v) = self.republish_timeout {
            config.republish_timeout = v;
        }
        if let Some(v) = self.keepalive_ratio {
            config.keepalive_ratio = v;
        }
        if let Some(v) = self.secure_channel_lifetime {
            config.secure_channel_lifetime = v;
        }
        if let Some(v) = self.endpoint_must_exist {
            config.endpoint_must_exist = v;
        }
        if let Some(v) = self.connection_strategy {
            config.connection_strategy = v;
        }
        if let Some(v) = self.subscription_defaults {
            config.subscription_defaults = v;
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// SubscriptionDefaults
// =============================================================================

/// Default parameters for subscriptions and monitored items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDefaults {
    /// Publishing interval.
    #[serde(default = "default_publishing_interval", with = "humantime_serde")]
    pub publishing_interval: Duration,

    /// Lifetime count, in publishing intervals.
    #[serde(default = "default_lifetime_count")]
    pub lifetime_count: u32,

    /// Maximum keep-alive count, in publishing intervals.
    #[serde(default = "default_max_keepalive_count")]
    pub max_keepalive_count: u32,

    /// Maximum notifications per publish, 0 for unlimited.
    #[serde(default)]
    pub max_notifications_per_publish: u32,

    /// Subscription priority.
    #[serde(default)]
    pub priority: u8,

    /// Monitored item sampling interval.
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub sampling_interval: Duration,

    /// Monitored item queue size.
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,
}

fn default_publishing_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_lifetime_count() -> u32 {
    60
}

fn default_max_keepalive_count() -> u32 {
    10
}

fn default_sampling_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_queue_size() -> u32 {
    10
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            publishing_interval: default_publishing_interval(),
            lifetime_count: default_lifetime_count(),
            max_keepalive_count: default_max_keepalive_count(),
            max_notifications_per_publish: 0,
            priority: 0,
            sampling_interval: default_sampling_interval(),
            queue_size: default_queue_size(),
        }
    }
}

impl SubscriptionDefaults {
    /// Validates the defaults.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.publishing_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "subscription_defaults.publishing_interval",
                "must be greater than 0",
            ));
        }
        if self.max_keepalive_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "subscription_defaults.max_keepalive_count",
                "must be greater than 0",
            ));
        }
        if self.lifetime_count < self.max_keepalive_count.saturating_mul(3) {
            return Err(ConfigurationError::invalid_value(
                "subscription_defaults.lifetime_count",
                format!(
                    "{} must be at least three times max_keepalive_count ({})",
                    self.lifetime_count, self.max_keepalive_count
                ),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// ConfigFormat
// =============================================================================

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML.
    Yaml,
    /// TOML.
    Toml,
    /// JSON.
    Json,
}

impl ConfigFormat {
    /// Determines the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigurationError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            Some(other) => Err(ConfigurationError::UnsupportedFormat {
                extension: other.to_string(),
            }),
            None => Err(ConfigurationError::UnsupportedFormat {
                extension: "(no extension)".to_string(),
            }),
        }
    }
}

fn parse_str<T: DeserializeOwned>(content: &str, format: ConfigFormat) -> Result<T, ConfigurationError> {
    match format {
        ConfigFormat::Yaml => ::config::Config::builder()
            .add_source(::config::File::from_str(content, ::config::FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::parse(e.to_string())),
        ConfigFormat::Toml => toml::from_str(content).map_err(|e| ConfigurationError::parse(e.to_string())),
        ConfigFormat::Json => {
            serde_json::from_str(content).map_err(|e| ConfigurationError::parse(e.to_string()))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::backoff::MaxRetry;

    #[test]
    fn test_builder_defaults() {
        let config = ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .build()
            .unwrap();

        assert_eq!(config.requested_session_timeout, Duration::from_secs(60));
        assert_eq!(config.connection_strategy.max_retry, MaxRetry::Unbounded);
        assert!(!config.endpoint_must_exist);
        assert_eq!(config.subscription_defaults.lifetime_count, 60);
    }

    #[test]
    fn test_builder_requires_endpoint() {
        assert!(ClientConfig::builder().build().is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_endpoint() {
        let error = ClientConfig::builder()
            .endpoint("localhost:4840")
            .build()
            .unwrap_err();
        assert!(matches!(
            error,
            UaError::Configuration(ConfigurationError::InvalidValue { field: "endpoint", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let strategy = ConnectionStrategy::default()
            .with_initial_delay(Duration::from_secs(5))
            .with_max_delay(Duration::from_secs(1));
        assert!(ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .connection_strategy(strategy)
            .build()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_short_lifetime() {
        let defaults = SubscriptionDefaults {
            lifetime_count: 5,
            max_keepalive_count: 10,
            ..Default::default()
        };
        assert!(defaults.validate().is_err());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
endpoint: "opc.tcp://plc-01:4840/UA"
security_mode: sign
security_policy: basic256_sha256
endpoint_must_exist: true
connection_strategy:
  max_retry: unbounded
  initial_delay: 50ms
  max_delay: 2s
  randomisation_factor: 0.2
"#;
        let config = ClientConfig::from_str(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.security_mode, SecurityMode::Sign);
        assert_eq!(config.security_policy, SecurityPolicy::Basic256Sha256);
        assert!(config.endpoint_must_exist);
        assert_eq!(config.connection_strategy.initial_delay, Duration::from_millis(50));
        assert_eq!(config.connection_strategy.max_retry, MaxRetry::Unbounded);
    }

    #[test]
    fn test_json_config_with_username() {
        let json = r#"{
            "endpoint": "opc.tcp://localhost:4840",
            "user_identity": { "type": "user_name", "username": "op", "password": "pw" }
        }"#;
        let config = ClientConfig::from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.user_identity.user(), "op");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "endpoint = \"opc.tcp://localhost:4840\"\nrequest_timeout = \"2s\""
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let error = ClientConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(
            error,
            UaError::Configuration(ConfigurationError::UnsupportedFormat { .. })
        ));
    }
}
