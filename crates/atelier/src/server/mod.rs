//! HTTP + WebSocket Server
//!
//! Exposes the command surface over HTTP and streams host events to
//! WebSocket clients.

mod handler;
mod protocol;
mod router;
mod state;

pub use handler::*;
pub use protocol::*;
pub use router::*;
pub use state::*;
