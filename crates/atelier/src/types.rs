//! Host data model
//!
//! Everything here is handed out by value: observers get copies of
//! supervisor and registry state, never references into it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use atelier_protocol::{PluginConfigOption, PluginManifest, PluginMethod};

use crate::error::HostError;

/// Whole milliseconds in `d`, saturating instead of wrapping
pub fn whole_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Supervisor-wide lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ManagerState {
    #[default]
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored(String),
}

impl ManagerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ManagerState::Running)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Uninitialized => write!(f, "uninitialized"),
            ManagerState::Starting => write!(f, "starting"),
            ManagerState::Running => write!(f, "running"),
            ManagerState::Stopping => write!(f, "stopping"),
            ManagerState::Stopped => write!(f, "stopped"),
            ManagerState::Errored(message) => write!(f, "errored ({})", message),
        }
    }
}

/// Plugin lifecycle status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum PluginStatus {
    Discovered,
    Loading,
    Active,
    Unloading,
    Errored(String),
}

impl PluginStatus {
    /// Name without the error payload, for messages
    pub fn name(&self) -> &'static str {
        match self {
            PluginStatus::Discovered => "discovered",
            PluginStatus::Loading => "loading",
            PluginStatus::Active => "active",
            PluginStatus::Unloading => "unloading",
            PluginStatus::Errored(_) => "errored",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Errored(message) => write!(f, "errored ({})", message),
            other => f.write_str(other.name()),
        }
    }
}

/// Rolling probe statistics for the worker or a single plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_latency_ms: Option<u32>,
    pub failure_count: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl HealthStatus {
    pub fn record_success(&mut self, latency: Duration) {
        self.healthy = true;
        self.last_latency_ms = Some(u32::try_from(latency.as_millis()).unwrap_or(u32::MAX));
        self.failure_count = 0;
        self.last_check_at = Some(Utc::now());
        self.last_error = None;
    }

    /// Record a failed probe, returning the new consecutive failure count
    pub fn record_failure(&mut self, error: impl Into<String>) -> u32 {
        self.healthy = false;
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_check_at = Some(Utc::now());
        self.last_error = Some(error.into());
        self.failure_count
    }
}

/// Runtime record for one discovered plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Plugin {
    pub manifest: PluginManifest,
    pub status: PluginStatus,
    pub error_message: Option<String>,
    pub methods: Vec<PluginMethod>,
    pub config: Vec<PluginConfigOption>,
    pub health: HealthStatus,
    /// Manifest location as reported by the worker
    pub path: String,
    /// Other side of an in-flight hot-swap
    pub swap_peer: Option<String>,
}

impl Plugin {
    pub fn discovered(manifest: PluginManifest, path: impl Into<String>) -> Self {
        Self {
            manifest,
            status: PluginStatus::Discovered,
            error_message: None,
            methods: Vec::new(),
            config: Vec::new(),
            health: HealthStatus::default(),
            path: path.into(),
            swap_peer: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn is_active(&self) -> bool {
        self.status == PluginStatus::Active
    }

    pub fn method(&self, name: &str) -> Option<&PluginMethod> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Diagnostic record of one method invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InvocationRecord {
    pub id: String,
    pub plugin_id: String,
    pub method: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time status snapshot reported by `ipc_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HostStatus {
    pub lifecycle_state: ManagerState,
    pub health_status: HealthStatus,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time_ms: f64,
    pub uptime_seconds: u64,
    pub respawn_count: u32,
}

/// Options for a single plugin call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Overrides the transport's default timeout
    pub timeout: Option<Duration>,
    /// Append an [`InvocationRecord`] for this call
    pub track_history: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            track_history: true,
        }
    }
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn untracked(mut self) -> Self {
        self.track_history = false;
        self
    }
}

/// One member of a batch.
///
/// With `plugin_id` set this is a plugin call subject to the same checks as
/// `call`; without it the method goes to the worker as a raw request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BatchRequest {
    #[serde(default)]
    pub plugin_id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl BatchRequest {
    pub fn raw(method: impl Into<String>, params: Value) -> Self {
        Self {
            plugin_id: None,
            method: method.into(),
            params,
        }
    }

    pub fn plugin(plugin_id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            plugin_id: Some(plugin_id.into()),
            method: method.into(),
            params,
        }
    }
}

/// Outcome of one batch member, at the same position as its request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BatchResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

impl From<Result<Value, HostError>> for BatchResult {
    fn from(outcome: Result<Value, HostError>) -> Self {
        match outcome {
            Ok(value) => Self {
                success: true,
                result: Some(value),
                error: None,
                error_kind: None,
            },
            Err(e) => Self {
                success: false,
                result: None,
                error: Some(e.to_string()),
                error_kind: Some(e.kind().to_string()),
            },
        }
    }
}

/// Outcome of a hot-swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SwapResult {
    pub success: bool,
    pub old_id: String,
    pub new_id: String,
    pub error: Option<String>,
}

/// Notifications for observers of host state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    StateChanged {
        state: ManagerState,
    },
    PluginStatusChanged {
        plugin_id: String,
        status: PluginStatus,
    },
    HealthChanged {
        plugin_id: Option<String>,
        health: HealthStatus,
    },
    Respawned {
        respawn_count: u32,
        reason: String,
    },
}
