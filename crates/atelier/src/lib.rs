//! Atelier - Plugin Host
//!
//! Runs plugins inside a supervised worker process and exposes them to a UI
//! layer:
//! - Worker supervision with crash detection and backoff respawn
//! - Correlated request/response transport over stdio frames
//! - Plugin registry with discovery, load/unload, configuration and hot swap
//! - Periodic health probing and invocation history
//! - HTTP command API with a WebSocket event stream

pub use atelier_protocol;

// Host components
pub mod config;
pub mod error;
pub mod health;
pub mod registry;
pub mod supervisor;
pub mod swap;
pub mod tracker;
pub mod transport;
pub mod types;

// Facade and command surface
pub mod commands;
pub mod manager;

// HTTP/WebSocket server
pub mod server;

// Search path watcher
pub mod watcher;

#[cfg(test)]
mod testing;

pub use commands::{Command, CommandResponse};
pub use config::HostConfig;
pub use error::{HostError, Result};
pub use manager::HostManager;
