//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (explicit path, or the first of the default paths)
//! - Environment variables (`PARLEY_*`, nested keys separated by `__`)

use anyhow::{Context, Result};
use parley_core::{RecipientPolicy, RouterConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Paths searched when no config file is given explicitly.
const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Typing indicator configuration.
    #[serde(default)]
    pub typing: TypingConfig,

    /// Message delivery configuration.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Shutdown configuration.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per connection, in events.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Typing indicator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Auto-clear window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Message delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// How messages with a `recipientId` reach the recipient.
    #[serde(default)]
    pub recipient_policy: RecipientPolicy,

    /// Push the online user list to a connection after `join`.
    #[serde(default = "default_true")]
    pub send_online_users_on_join: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long sessions get to flush queued events, in milliseconds.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_debounce_ms() -> u64 {
    3_000 // 3 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_grace_period_ms() -> u64 {
    5_000 // 5 seconds
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            typing: TypingConfig::default(),
            delivery: DeliveryConfig::default(),
            metrics: MetricsConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            recipient_policy: RecipientPolicy::default(),
            send_online_users_on_join: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl ShutdownConfig {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Config {
    /// Load configuration from the default paths and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from `path` (or the default paths) and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// environment override has the wrong type.
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path),
            None => CONFIG_PATHS
                .iter()
                .map(|candidate| PathBuf::from(shellexpand::tilde(candidate).as_ref()))
                .find(|candidate| candidate.exists()),
        };

        Self::layered(file.as_deref(), None)
    }

    /// Build the layered configuration. `env` replaces the process
    /// environment when given.
    fn layered(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(file) = file {
            tracing::info!("Loading configuration from {}", file.display());
            builder = builder.add_source(
                ::config::File::from(file).format(::config::FileFormat::Toml),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Core router settings.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            typing_timeout: Duration::from_millis(self.typing.debounce_ms),
            outbound_queue_capacity: self.limits.outbound_queue_capacity,
            recipient_policy: self.delivery.recipient_policy,
            send_online_users_on_join: self.delivery.send_online_users_on_join,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.typing.debounce_ms, 3000);
        assert_eq!(config.delivery.recipient_policy, RecipientPolicy::Deduplicated);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [delivery]
            recipient_policy = "additional"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.outbound_queue_capacity, 256);
        assert_eq!(config.delivery.recipient_policy, RecipientPolicy::Additional);
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::layered(
            None,
            env(&[
                ("PARLEY_PORT", "7000"),
                ("PARLEY_LIMITS__MAX_CONNECTIONS", "10"),
                ("PARLEY_TYPING__DEBOUNCE_MS", "500"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.limits.max_connections, 10);
        assert_eq!(config.router_config().typing_timeout, Duration::from_millis(500));
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_file_then_environment() {
        let path = std::env::temp_dir().join(format!("parley-test-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 9100\n[metrics]\nenabled = false\n").unwrap();

        let config = Config::layered(Some(&path), env(&[("PARLEY_PORT", "9200")])).unwrap();
        let from_file = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 9200);
        assert!(!config.metrics.enabled);
        assert_eq!(from_file.port, 9100);
    }
}
