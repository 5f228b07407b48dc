//! Hot-Swap Coordinator
//!
//! Replaces one active plugin with another without a window where neither
//! serves: the incoming plugin is loaded first and the outgoing one keeps
//! answering calls until that load succeeds.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{HostError, Result};
use crate::registry::PluginRegistry;
use crate::types::{PluginStatus, SwapResult};

pub struct HotSwapCoordinator {
    registry: Arc<PluginRegistry>,
}

impl HotSwapCoordinator {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    /// Swap `old_id` out for `new_id`. Expected failures are reported in the result.
    pub async fn swap(&self, old_id: &str, new_id: &str) -> SwapResult {
        let outcome = self.try_swap(old_id, new_id).await;
        if let Err(e) = &outcome {
            warn!(old_id, new_id, error = %e, "Hot-swap failed");
        }
        SwapResult {
            success: outcome.is_ok(),
            old_id: old_id.to_string(),
            new_id: new_id.to_string(),
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    async fn try_swap(&self, old_id: &str, new_id: &str) -> Result<()> {
        if old_id == new_id {
            return Err(HostError::InvalidParams(
                "cannot swap a plugin with itself".into(),
            ));
        }

        let old = self
            .registry
            .begin(old_id, "swap", |s| *s == PluginStatus::Active, "active")?;
        let new = self.registry.begin(
            new_id,
            "swap",
            |s| matches!(s, PluginStatus::Discovered | PluginStatus::Errored(_)),
            "discovered or errored",
        )?;

        self.registry.begin_swap(old.id(), new.id());
        if let Err(e) = self.registry.load_guarded(&new).await {
            self.registry.abort_swap(new.id(), &e);
            return Err(e);
        }

        // Incoming side is serving; retire the outgoing one
        self.registry.unload_guarded(&old).await?;
        info!(old_id, new_id, "Hot-swap complete");
        Ok(())
    }
}
