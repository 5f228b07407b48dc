//! Command Surface
//!
//! One variant per operation the UI layer can ask for. Commands arrive as
//! `{"command": "<verb>", ...args}` and always produce a [`CommandResponse`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use ts_rs::TS;

use crate::error::HostError;
use crate::manager::HostManager;
use crate::types::{whole_millis, BatchRequest, CallOptions};

/// Requests accepted from the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    IpcStart,
    IpcStop,
    IpcStatus,

    /// Raw worker request
    IpcCall {
        method: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    IpcBatch {
        requests: Vec<BatchRequest>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Worker health, or one plugin's when `plugin` is set
    HealthCheck {
        #[serde(default)]
        plugin: Option<String>,
    },

    Ping,
    DiscoverPlugins,
    ScanPlugins,

    PluginList {
        /// Wildcard over plugin ids
        #[serde(default)]
        pattern: Option<String>,
    },

    PluginLoad {
        name: String,
    },

    PluginUnload {
        name: String,
    },

    PluginSwap {
        old_name: String,
        new_name: String,
    },

    PluginCall {
        plugin: String,
        method: String,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        timeout_ms: Option<u64>,
        /// Defaults to true
        #[serde(default)]
        track_history: Option<bool>,
    },

    PluginConfigure {
        name: String,
        key: String,
        value: Value,
    },

    InvocationHistory {
        #[serde(default)]
        plugin: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl Command {
    /// Verb as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Command::IpcStart => "ipc_start",
            Command::IpcStop => "ipc_stop",
            Command::IpcStatus => "ipc_status",
            Command::IpcCall { .. } => "ipc_call",
            Command::IpcBatch { .. } => "ipc_batch",
            Command::HealthCheck { .. } => "health_check",
            Command::Ping => "ping",
            Command::DiscoverPlugins => "discover_plugins",
            Command::ScanPlugins => "scan_plugins",
            Command::PluginList { .. } => "plugin_list",
            Command::PluginLoad { .. } => "plugin_load",
            Command::PluginUnload { .. } => "plugin_unload",
            Command::PluginSwap { .. } => "plugin_swap",
            Command::PluginCall { .. } => "plugin_call",
            Command::PluginConfigure { .. } => "plugin_configure",
            Command::InvocationHistory { .. } => "invocation_history",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CommandError {
    pub kind: String,
    pub message: String,
}

/// Answer to every [`Command`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl CommandResponse {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self::failure("protocol_error", format!("unserializable result: {}", e)),
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CommandError {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }

    pub fn error(err: &HostError) -> Self {
        Self::failure(err.kind(), err.to_string())
    }
}

impl<T: Serialize> From<Result<T, HostError>> for CommandResponse {
    fn from(result: Result<T, HostError>) -> Self {
        match result {
            Ok(data) => CommandResponse::ok(data),
            Err(e) => CommandResponse::error(&e),
        }
    }
}

impl HostManager {
    /// Run one command against the host
    pub async fn execute(self: &Arc<Self>, command: Command) -> CommandResponse {
        debug!(command = command.name(), "Executing command");
        match command {
            Command::IpcStart => match self.start().await {
                Ok(()) => CommandResponse::ok(self.status()),
                Err(e) => CommandResponse::error(&e),
            },
            Command::IpcStop => {
                self.stop().await;
                CommandResponse::ok(self.status())
            }
            Command::IpcStatus => CommandResponse::ok(self.status()),
            Command::IpcCall {
                method,
                params,
                timeout_ms,
            } => self
                .request(&method, params, timeout_ms.map(Duration::from_millis))
                .await
                .into(),
            Command::IpcBatch {
                requests,
                timeout_ms,
            } => CommandResponse::ok(
                self.batch(requests, timeout_ms.map(Duration::from_millis))
                    .await,
            ),
            Command::HealthCheck { plugin } => self.health_check(plugin.as_deref()).await.into(),
            Command::Ping => self
                .ping()
                .await
                .map(|latency| json!({ "latency_ms": whole_millis(latency) }))
                .into(),
            Command::DiscoverPlugins => self.discover().await.into(),
            Command::ScanPlugins => self.scan().await.into(),
            Command::PluginList { pattern } => CommandResponse::ok(self.list(pattern.as_deref())),
            Command::PluginLoad { name } => self.load(&name).await.into(),
            Command::PluginUnload { name } => self.unload(&name).await.into(),
            Command::PluginSwap { old_name, new_name } => {
                let result = self.swap(&old_name, &new_name).await;
                let mut response = CommandResponse::ok(&result);
                if let Some(message) = result.error {
                    response.success = false;
                    response.error = Some(CommandError {
                        kind: "swap_failed".into(),
                        message,
                    });
                }
                response
            }
            Command::PluginCall {
                plugin,
                method,
                args,
                timeout_ms,
                track_history,
            } => {
                let options = CallOptions {
                    timeout: timeout_ms.map(Duration::from_millis),
                    track_history: track_history.unwrap_or(true),
                };
                self.call(&plugin, &method, args, options).await.into()
            }
            Command::PluginConfigure { name, key, value } => {
                self.configure(&name, &key, value).await.into()
            }
            Command::InvocationHistory { plugin, limit } => {
                CommandResponse::ok(self.history(plugin.as_deref(), limit))
            }
        }
    }
}
