//! Host error taxonomy

use atelier_protocol::{FrameError, WireError};

/// Result type alias
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors surfaced by the plugin host.
///
/// Every variant carries plain strings so a single failure can be handed to
/// several waiters (all pending requests fail with the same cause on
/// shutdown).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("Process error: {0}")]
    Process(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request `{method}` timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin {0} already has a transition in flight")]
    PluginBusy(String),

    #[error("Plugin {id} is {status}; `{operation}` requires {expected}")]
    PluginStatus {
        id: String,
        operation: String,
        status: String,
        expected: String,
    },

    #[error("Plugin host is not running (state: {0})")]
    NotConnected(String),

    #[error("Plugin host is shutting down")]
    ShuttingDown,

    #[error("Worker rejected `{method}` [{code}]: {message}")]
    Remote {
        method: String,
        code: String,
        message: String,
    },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HostError {
    /// Stable identifier used by the command surface
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::Process(_) => "process_error",
            HostError::Protocol(_) => "protocol_error",
            HostError::Timeout { .. } => "timeout",
            HostError::PluginNotFound(_) => "plugin_not_found",
            HostError::PluginBusy(_) => "plugin_busy",
            HostError::PluginStatus { .. } => "plugin_status",
            HostError::NotConnected(_) => "not_connected",
            HostError::ShuttingDown => "shutting_down",
            HostError::Remote { .. } => "remote_error",
            HostError::InvalidParams(_) => "invalid_params",
            HostError::Config(_) => "config_error",
        }
    }

    pub(crate) fn remote(method: &str, error: WireError) -> Self {
        HostError::Remote {
            method: method.to_string(),
            code: error.code,
            message: error.message,
        }
    }
}

impl From<FrameError> for HostError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => HostError::Process(format!("worker pipe: {}", e)),
            other => HostError::Protocol(other.to_string()),
        }
    }
}

impl From<crate::config::ConfigError> for HostError {
    fn from(err: crate::config::ConfigError) -> Self {
        HostError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        HostError::Protocol(format!("unexpected payload shape: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(HostError::PluginBusy("a".into()).kind(), "plugin_busy");
        assert_eq!(
            HostError::NotConnected("stopped".into()).kind(),
            "not_connected"
        );
        assert_eq!(HostError::ShuttingDown.kind(), "shutting_down");
    }

    #[test]
    fn test_frame_errors_map_to_taxonomy() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(HostError::from(FrameError::Io(io)), HostError::Process(_)));
        assert!(matches!(
            HostError::from(FrameError::UnknownType(42)),
            HostError::Protocol(_)
        ));
    }

    #[test]
    fn test_config_errors_keep_their_message() {
        let err = crate::config::HostConfig::from_toml_str("[health]\ninterval_ms = 0")
            .map_err(HostError::from)
            .unwrap_err();
        assert_eq!(err.kind(), "config_error");
        assert!(err.to_string().contains("health.interval_ms"));
    }
}
