//! Request/response envelopes and method payloads
//!
//! All payloads are JSON. Field names are snake_case on the wire.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin::{PluginConfigOption, PluginMethod};

/// Method names understood by a worker
pub mod methods {
    pub const PING: &str = "ping";
    pub const DISCOVER: &str = "discover";
    pub const LOAD: &str = "plugin.load";
    pub const UNLOAD: &str = "plugin.unload";
    pub const CALL: &str = "plugin.call";
    pub const HEALTH: &str = "plugin.health";
    pub const CONFIGURE: &str = "plugin.configure";
}

/// Error codes carried in [`WireError::code`]
pub mod error_codes {
    pub const UNKNOWN_METHOD: &str = "unknown_method";
    pub const INVALID_PARAMS: &str = "invalid_params";
    pub const NOT_FOUND: &str = "not_found";
    pub const NOT_LOADED: &str = "not_loaded";
    pub const LOAD_FAILED: &str = "load_failed";
    pub const INTERNAL: &str = "internal";
}

/// A correlated request from host to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Error reported by the worker for a single request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

/// The worker's answer to a [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(WireError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Collapse into a `Result`; a response with neither field is a null result
    pub fn into_result(self) -> Result<Value, WireError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Sent once by the worker after it is ready to accept requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub version: String,
    pub pid: u32,
}

/// Log line forwarded from the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub version: String,
    #[serde(default)]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverParams {
    /// Extra directories to search in addition to the worker's own search path
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// Manifest paths the host already knows about
    #[serde(default)]
    pub exclude: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverResult {
    #[serde(default)]
    pub manifests: Vec<ManifestEntry>,
    #[serde(default)]
    pub errors: Vec<DiscoveryIssue>,
}

/// A manifest found on disk, left unparsed so the host validates each one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub manifest: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryIssue {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadParams {
    pub plugin_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadResult {
    #[serde(default)]
    pub methods: Vec<PluginMethod>,
    #[serde(default)]
    pub config: Vec<PluginConfigOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadParams {
    pub plugin_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParams {
    pub plugin_id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthParams {
    pub plugin_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureParams {
    pub plugin_id: String,
    pub key: String,
    pub value: Value,
}
