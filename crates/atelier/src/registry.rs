//! Plugin Registry
//!
//! Sole owner of [`Plugin`] records. Status changes happen under one
//! `RwLock` whose critical sections never span an `.await`; worker traffic
//! happens between them. Per-plugin exclusivity comes from the in-flight set:
//! a plugin mid-transition refuses a second transition with `PluginBusy`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ts_rs::TS;
use wildmatch::WildMatch;

use atelier_protocol::wire::{
    ConfigureParams, DiscoverParams, DiscoverResult, LoadParams, LoadResult, UnloadParams,
};
use atelier_protocol::{methods, PluginConfigOption, PluginManifest};

use crate::error::{HostError, Result};
use crate::supervisor::Supervisor;
use crate::types::{HealthStatus, HostEvent, Plugin, PluginStatus};

/// A manifest that could not be turned into a plugin record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ManifestIssue {
    pub path: String,
    pub message: String,
}

/// Outcome of `discover` / `scan`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DiscoveryReport {
    /// Ids seen for the first time in this pass
    pub added: Vec<String>,
    pub errors: Vec<ManifestIssue>,
    /// Every known plugin after the pass
    pub plugins: Vec<Plugin>,
}

#[derive(Default)]
struct Inner {
    plugins: HashMap<String, Plugin>,
    in_flight: HashSet<String>,
}

/// Error message left on a plugin whose load was abandoned midway
const ABANDONED: &str = "transition cancelled before it finished";

/// Exclusive right to move one plugin through a transition.
/// Dropping it frees the plugin for the next transition, settling any
/// `Loading`/`Unloading` status an abandoned transition left behind.
pub(crate) struct TransitionGuard<'a> {
    registry: &'a PluginRegistry,
    id: String,
}

impl TransitionGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.registry.finish_transition(&self.id);
    }
}

pub struct PluginRegistry {
    supervisor: Arc<Supervisor>,
    search_paths: Vec<PathBuf>,
    inner: RwLock<Inner>,
    events: broadcast::Sender<HostEvent>,
}

impl PluginRegistry {
    pub fn new(
        supervisor: Arc<Supervisor>,
        search_paths: Vec<PathBuf>,
        events: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self {
            supervisor,
            search_paths,
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// Claim `id` for `operation` if its current status passes `allowed`
    pub(crate) fn begin(
        &self,
        id: &str,
        operation: &str,
        allowed: fn(&PluginStatus) -> bool,
        expected: &str,
    ) -> Result<TransitionGuard<'_>> {
        let mut inner = self.inner.write();
        let status = match inner.plugins.get(id) {
            Some(plugin) => plugin.status.clone(),
            None => return Err(HostError::PluginNotFound(id.to_string())),
        };
        if inner.in_flight.contains(id) {
            return Err(HostError::PluginBusy(id.to_string()));
        }
        if !allowed(&status) {
            return Err(HostError::PluginStatus {
                id: id.to_string(),
                operation: operation.to_string(),
                status: status.name().to_string(),
                expected: expected.to_string(),
            });
        }
        inner.in_flight.insert(id.to_string());
        Ok(TransitionGuard {
            registry: self,
            id: id.to_string(),
        })
    }

    /// Release `id` and clear its swap link. Completed transitions never end
    /// in a transient status, so one found here was cancelled mid-flight.
    fn finish_transition(&self, id: &str) {
        let settled = {
            let mut inner = self.inner.write();
            inner.in_flight.remove(id);
            let Some(plugin) = inner.plugins.get_mut(id) else {
                return;
            };
            plugin.swap_peer = None;
            match plugin.status {
                PluginStatus::Unloading => {
                    plugin.methods.clear();
                    plugin.config.clear();
                    plugin.error_message = None;
                    plugin.health = HealthStatus::default();
                    plugin.status = PluginStatus::Discovered;
                }
                PluginStatus::Loading => {
                    plugin.methods.clear();
                    plugin.config.clear();
                    plugin.error_message = Some(ABANDONED.to_string());
                    plugin.status = PluginStatus::Errored(ABANDONED.to_string());
                }
                _ => return,
            }
            plugin.status.clone()
        };
        warn!(plugin_id = %id, "Abandoned transition, plugin settled as {}", settled);
        let _ = self.events.send(HostEvent::PluginStatusChanged {
            plugin_id: id.to_string(),
            status: settled,
        });
    }

    /// Mutate one record, announcing a status change if there was one
    fn update(&self, id: &str, f: impl FnOnce(&mut Plugin)) -> Option<Plugin> {
        let snapshot = {
            let mut inner = self.inner.write();
            let plugin = inner.plugins.get_mut(id)?;
            let before = plugin.status.clone();
            f(plugin);
            let changed = plugin.status != before;
            (plugin.clone(), changed)
        };
        let (plugin, changed) = snapshot;
        if changed {
            debug!(plugin_id = %id, "Plugin status -> {}", plugin.status);
            let _ = self.events.send(HostEvent::PluginStatusChanged {
                plugin_id: id.to_string(),
                status: plugin.status.clone(),
            });
        }
        Some(plugin)
    }

    fn set_status(&self, id: &str, status: PluginStatus) -> Option<Plugin> {
        self.update(id, |plugin| plugin.status = status)
    }

    /// Ask the worker to enumerate every manifest on the search paths
    pub async fn discover(&self) -> Result<DiscoveryReport> {
        self.discover_excluding(Vec::new()).await
    }

    /// Discovery limited to manifests the registry has not seen yet
    pub async fn scan(&self) -> Result<DiscoveryReport> {
        let known = self
            .inner
            .read()
            .plugins
            .values()
            .map(|p| PathBuf::from(&p.path))
            .collect();
        self.discover_excluding(known).await
    }

    async fn discover_excluding(&self, exclude: Vec<PathBuf>) -> Result<DiscoveryReport> {
        let transport = self.supervisor.transport()?;
        let params = DiscoverParams {
            search_paths: self.search_paths.clone(),
            exclude,
        };
        let reply = transport
            .send(methods::DISCOVER, serde_json::to_value(&params)?, None)
            .await?;
        let result: DiscoverResult = serde_json::from_value(reply)?;

        let mut errors: Vec<ManifestIssue> = result
            .errors
            .into_iter()
            .map(|issue| ManifestIssue {
                path: issue.path.display().to_string(),
                message: issue.message,
            })
            .collect();
        let mut added = Vec::new();

        {
            let mut inner = self.inner.write();
            for entry in result.manifests {
                let path = entry.path.display().to_string();
                let manifest = match PluginManifest::from_value(entry.manifest) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        errors.push(ManifestIssue {
                            path,
                            message: e.to_string(),
                        });
                        continue;
                    }
                };
                let id = manifest.id.clone();
                if added.contains(&id) {
                    errors.push(ManifestIssue {
                        path,
                        message: format!("duplicate plugin id `{}`", id),
                    });
                    continue;
                }
                match inner.plugins.get_mut(&id) {
                    // Known plugin: refresh metadata, keep its status
                    Some(existing) => {
                        existing.manifest = manifest;
                        existing.path = path;
                    }
                    None => {
                        inner.plugins.insert(id.clone(), Plugin::discovered(manifest, path));
                        added.push(id);
                    }
                }
            }
        }

        for id in &added {
            let _ = self.events.send(HostEvent::PluginStatusChanged {
                plugin_id: id.clone(),
                status: PluginStatus::Discovered,
            });
        }
        for issue in &errors {
            warn!(path = %issue.path, "Skipping manifest: {}", issue.message);
        }
        info!(added = added.len(), errors = errors.len(), "Discovery complete");

        Ok(DiscoveryReport {
            added,
            errors,
            plugins: self.list(None),
        })
    }

    pub async fn load(&self, id: &str) -> Result<Plugin> {
        let guard = self.begin(
            id,
            "load",
            |s| matches!(s, PluginStatus::Discovered | PluginStatus::Errored(_)),
            "discovered or errored",
        )?;
        self.load_guarded(&guard).await
    }

    pub(crate) async fn load_guarded(&self, guard: &TransitionGuard<'_>) -> Result<Plugin> {
        let id = guard.id();
        let transport = self.supervisor.transport()?;
        let path = self
            .set_status(id, PluginStatus::Loading)
            .map(|p| p.path)
            .ok_or_else(|| HostError::PluginNotFound(id.to_string()))?;

        let params = LoadParams {
            plugin_id: id.to_string(),
            path: PathBuf::from(path),
        };
        let outcome = match serde_json::to_value(&params) {
            Ok(params) => transport
                .send(methods::LOAD, params, None)
                .await
                .and_then(|reply| serde_json::from_value::<LoadResult>(reply).map_err(Into::into)),
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(loaded) => {
                info!(plugin_id = %id, methods = loaded.methods.len(), "Plugin loaded");
                self.update(id, |plugin| {
                    plugin.methods = loaded.methods;
                    plugin.config = loaded.config;
                    plugin.error_message = None;
                    plugin.status = PluginStatus::Active;
                })
                .ok_or_else(|| HostError::PluginNotFound(id.to_string()))
            }
            Err(e) => {
                warn!(plugin_id = %id, error = %e, "Plugin failed to load");
                let message = e.to_string();
                self.update(id, |plugin| {
                    plugin.methods.clear();
                    plugin.config.clear();
                    plugin.error_message = Some(message.clone());
                    plugin.status = PluginStatus::Errored(message);
                });
                Err(e)
            }
        }
    }

    pub async fn unload(&self, id: &str) -> Result<Plugin> {
        let guard = self.begin(
            id,
            "unload",
            |s| {
                matches!(
                    s,
                    PluginStatus::Active | PluginStatus::Loading | PluginStatus::Errored(_)
                )
            },
            "active, loading or errored",
        )?;
        self.unload_guarded(&guard).await
    }

    /// Always ends in `Discovered`; worker-side failures are only logged
    pub(crate) async fn unload_guarded(&self, guard: &TransitionGuard<'_>) -> Result<Plugin> {
        let id = guard.id();
        let before = self.set_status(id, PluginStatus::Unloading);

        match self.supervisor.transport() {
            Ok(transport) => {
                let params = UnloadParams {
                    plugin_id: id.to_string(),
                };
                let sent = match serde_json::to_value(&params) {
                    Ok(params) => transport.send(methods::UNLOAD, params, None).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    warn!(plugin_id = %id, error = %e, "Worker-side unload failed");
                }
            }
            Err(e) => warn!(plugin_id = %id, error = %e, "Unloading without a worker"),
        }

        let unloaded = self.update(id, |plugin| {
            plugin.methods.clear();
            plugin.config.clear();
            plugin.error_message = None;
            plugin.swap_peer = None;
            plugin.health = HealthStatus::default();
            plugin.status = PluginStatus::Discovered;
        });
        info!(plugin_id = %id, "Plugin unloaded");
        unloaded
            .or(before)
            .ok_or_else(|| HostError::PluginNotFound(id.to_string()))
    }

    /// Set a configuration value on an active plugin
    pub async fn configure(&self, id: &str, key: &str, value: Value) -> Result<PluginConfigOption> {
        let guard = self.begin(id, "configure", |s| *s == PluginStatus::Active, "active")?;
        let option = {
            let inner = self.inner.read();
            let plugin = inner
                .plugins
                .get(guard.id())
                .ok_or_else(|| HostError::PluginNotFound(id.to_string()))?;
            plugin
                .config
                .iter()
                .find(|o| o.key == key)
                .cloned()
                .ok_or_else(|| HostError::InvalidParams(format!("unknown config key `{}`", key)))?
        };
        option
            .validate(&value)
            .map_err(|e| HostError::InvalidParams(format!("{}: {}", key, e)))?;

        let transport = self.supervisor.transport()?;
        let params = ConfigureParams {
            plugin_id: id.to_string(),
            key: key.to_string(),
            value: value.clone(),
        };
        transport
            .send(methods::CONFIGURE, serde_json::to_value(&params)?, None)
            .await?;

        let mut updated = option;
        updated.value = value;
        self.update(id, |plugin| {
            if let Some(slot) = plugin.config.iter_mut().find(|o| o.key == key) {
                *slot = updated.clone();
            }
        });
        debug!(plugin_id = %id, key, "Plugin configured");
        Ok(updated)
    }

    /// Reload plugins that were active on the previous worker
    pub async fn restore_after_respawn(&self) -> Vec<(String, Result<Plugin>)> {
        let mut restored = Vec::new();
        for id in self.active_ids() {
            let outcome = match self.begin(&id, "restore", |s| *s == PluginStatus::Active, "active") {
                Ok(guard) => self.load_guarded(&guard).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                warn!(plugin_id = %id, error = %e, "Could not restore plugin after respawn");
            }
            restored.push((id, outcome));
        }
        restored
    }

    pub fn get(&self, id: &str) -> Result<Plugin> {
        self.inner
            .read()
            .plugins
            .get(id)
            .cloned()
            .ok_or_else(|| HostError::PluginNotFound(id.to_string()))
    }

    /// Snapshot of every plugin whose id matches `pattern` (`*` and `?`), by id
    pub fn list(&self, pattern: Option<&str>) -> Vec<Plugin> {
        let matcher = pattern.map(WildMatch::new);
        let mut plugins: Vec<Plugin> = self
            .inner
            .read()
            .plugins
            .values()
            .filter(|p| matcher.as_ref().is_none_or(|m| m.matches(p.id())))
            .cloned()
            .collect();
        plugins.sort_by(|a, b| a.id().cmp(b.id()));
        plugins
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .plugins
            .values()
            .filter(|p| p.is_active())
            .map(|p| p.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.inner.read().in_flight.contains(id)
    }

    /// Store a probe result for one plugin
    pub(crate) fn record_health(
        &self,
        id: &str,
        probe: std::result::Result<Duration, String>,
    ) -> Option<HealthStatus> {
        let health = {
            let mut inner = self.inner.write();
            let plugin = inner.plugins.get_mut(id)?;
            match probe {
                Ok(latency) => plugin.health.record_success(latency),
                Err(e) => {
                    plugin.health.record_failure(e);
                }
            }
            plugin.health.clone()
        };
        let _ = self.events.send(HostEvent::HealthChanged {
            plugin_id: Some(id.to_string()),
            health: health.clone(),
        });
        Some(health)
    }

    /// Link the two sides of a hot-swap, starting the incoming load
    pub(crate) fn begin_swap(&self, old_id: &str, new_id: &str) {
        let (old, new) = {
            let mut inner = self.inner.write();
            if let Some(old) = inner.plugins.get_mut(old_id) {
                old.swap_peer = Some(new_id.to_string());
            }
            if let Some(new) = inner.plugins.get_mut(new_id) {
                new.swap_peer = Some(old_id.to_string());
                new.status = PluginStatus::Loading;
            }
            (inner.plugins.get(old_id).cloned(), inner.plugins.get(new_id).cloned())
        };
        for plugin in [old, new].into_iter().flatten() {
            let _ = self.events.send(HostEvent::PluginStatusChanged {
                plugin_id: plugin.id().to_string(),
                status: plugin.status,
            });
        }
    }

    /// Mark a failed swap's incoming side errored if it never reached the
    /// worker. The swap links go when the transition guards are released.
    pub(crate) fn abort_swap(&self, new_id: &str, error: &HostError) {
        let message = error.to_string();
        self.update(new_id, |plugin| {
            if plugin.status == PluginStatus::Loading {
                plugin.error_message = Some(message.clone());
                plugin.status = PluginStatus::Errored(message);
            }
        });
    }
}
