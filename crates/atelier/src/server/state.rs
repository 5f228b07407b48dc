//! Server Application State

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::manager::HostManager;

/// Shared state for every request handler
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    manager: Arc<HostManager>,
    /// Connected WebSocket clients and when they connected
    clients: DashMap<Uuid, DateTime<Utc>>,
}

impl AppState {
    pub fn new(manager: Arc<HostManager>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                manager,
                clients: DashMap::new(),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<HostManager> {
        &self.inner.manager
    }

    pub fn register_client(&self) -> Uuid {
        let session_id = Uuid::new_v4();
        self.inner.clients.insert(session_id, Utc::now());
        tracing::info!("Client connected: {}", session_id);
        session_id
    }

    pub fn remove_client(&self, session_id: Uuid) {
        if let Some((_, connected_at)) = self.inner.clients.remove(&session_id) {
            let seconds = (Utc::now() - connected_at).num_seconds();
            tracing::info!("Client disconnected: {} after {}s", session_id, seconds);
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }
}
