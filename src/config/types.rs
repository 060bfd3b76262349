//! Configuration types.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Default port for the HTTP/WebSocket server.
pub const DEFAULT_PORT: u16 = 8080;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    /// Connection table for the local-directory backend.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl AppConfig {
    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.watch.validate()?;

        let mut seen = HashSet::new();
        for connection in &self.connections {
            if connection.id.trim().is_empty() {
                return Err(ConfigError::Invalid("connection id must not be empty".to_string()));
            }
            if !seen.insert(connection.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate connection id: {}",
                    connection.id
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for the HTTP/WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whether to enable permissive CORS.
    #[serde(default = "default_true")]
    pub cors_permissive: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_permissive: default_true(),
        }
    }
}

impl ServerConfig {
    /// Address to bind, as `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Watch registry tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Consecutive failures tolerated before a watch is reported lost.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Random spread applied to each delay (0.1 = ±10%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Bound on waiting for one worker to exit during teardown.
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
    /// Bound on the whole registry shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Fold path case when building watch keys.
    #[serde(default = "default_true")]
    pub case_insensitive_paths: bool,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_teardown_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_ms() -> u64 {
    15_000
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            case_insensitive_paths: default_true(),
        }
    }
}

impl WatchConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("watch.max_retries must be at least 1".to_string()));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "watch.initial_delay_ms ({}) exceeds watch.max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid("watch.multiplier must be at least 1.0".to_string()));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(
                "watch.jitter must be in [0.0, 1.0)".to_string(),
            ));
        }
        Ok(())
    }
}

/// One storage connection served by the local backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Identifier clients use as `connectionId`.
    pub id: String,
    /// Directory the connection's paths are resolved against.
    pub root: PathBuf,
}
