//! WebSocket Protocol Messages

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::commands::{Command, CommandResponse};
use crate::types::HostEvent;

/// Command sent by a WebSocket client
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ClientMessage {
    /// Echoed back in the matching response
    pub id: String,
    pub request: Command,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent on initial connection
    Connected {
        session_id: String,
        server_version: String,
    },

    Response {
        id: String,
        response: CommandResponse,
    },

    /// Host state push
    Event {
        event: HostEvent,
    },

    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    pub fn connected(session_id: impl Into<String>) -> Self {
        Self::Connected {
            session_id: session_id.into(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn response(id: impl Into<String>, response: CommandResponse) -> Self {
        Self::Response {
            id: id.into(),
            response,
        }
    }

    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            message: message.into(),
        }
    }
}
