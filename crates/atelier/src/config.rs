//! Host Configuration
//!
//! Loaded from `atelier.toml`. Every field has a default so an empty file
//! (or no file at all) yields a working configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::supervisor::RestartPolicy;
use crate::types::whole_millis;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub worker: WorkerConfig,
    pub transport: TransportConfig,
    pub health: HealthConfig,
    pub restart: RestartConfig,
    pub tracker: TrackerConfig,
    pub server: ServerConfig,
}

/// How to launch the worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable; a bare name is looked up next to the host binary, then on PATH
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Directories searched for plugin manifests
    pub search_paths: Vec<PathBuf>,
    pub handshake_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("atelier-worker"),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            search_paths: vec![PathBuf::from("./plugins")],
            handshake_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Timeout for requests that do not specify their own
    pub default_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_frame_bytes: atelier_protocol::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl TransportConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive worker probe failures that trigger a respawn
    pub failure_threshold: u32,
    /// Also probe each active plugin on every tick
    pub probe_plugins: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            failure_threshold: 3,
            probe_plugins: true,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub max_restarts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub restart_window_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        let policy = RestartPolicy::default();
        Self {
            max_restarts: policy.max_restarts,
            initial_backoff_ms: whole_millis(policy.initial_backoff),
            max_backoff_ms: whole_millis(policy.max_backoff),
            backoff_multiplier: policy.backoff_multiplier,
            restart_window_ms: whole_millis(policy.restart_window),
        }
    }
}

impl RestartConfig {
    pub fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            restart_window: Duration::from_millis(self.restart_window_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Invocation records kept before the oldest is evicted
    pub capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { capacity: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Run `scan_plugins` when new manifests appear on the search paths
    pub watch_plugins: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9700,
            watch_plugins: false,
        }
    }
}

impl HostConfig {
    /// Load and validate a configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the host spin or never time out
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("worker.handshake_timeout_ms", self.worker.handshake_timeout_ms),
            ("worker.shutdown_timeout_ms", self.worker.shutdown_timeout_ms),
            ("transport.default_timeout_ms", self.transport.default_timeout_ms),
            ("health.interval_ms", self.health.interval_ms),
            ("health.probe_timeout_ms", self.health.probe_timeout_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.tracker.capacity == 0 {
            return Err(ConfigError::Invalid(
                "tracker.capacity must be at least 1".into(),
            ));
        }
        if self.transport.max_frame_bytes < 2 {
            return Err(ConfigError::Invalid(
                "transport.max_frame_bytes is too small".into(),
            ));
        }
        if self.restart.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "restart.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.restart.initial_backoff_ms > self.restart.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "restart.initial_backoff_ms exceeds restart.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}
