//! Host Manager
//!
//! Owns one of each component and is the only thing the command surface
//! talks to. Respawn requests from the transport and the health monitor are
//! funnelled through a single recovery loop, so they are handled one at a
//! time.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use atelier_protocol::methods;
use atelier_protocol::wire::CallParams;
use atelier_protocol::PluginConfigOption;

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::health::HealthMonitor;
use crate::registry::{DiscoveryReport, PluginRegistry};
use crate::supervisor::{ProcessLauncher, RecoveryRequest, Supervisor, WorkerLauncher};
use crate::swap::HotSwapCoordinator;
use crate::tracker::InvocationTracker;
use crate::types::{
    BatchRequest, BatchResult, CallOptions, HealthStatus, HostEvent, HostStatus, InvocationRecord,
    ManagerState, Plugin, PluginStatus, SwapResult,
};

const EVENT_CAPACITY: usize = 256;

pub struct HostManager {
    config: HostConfig,
    supervisor: Arc<Supervisor>,
    registry: Arc<PluginRegistry>,
    monitor: Arc<HealthMonitor>,
    tracker: InvocationTracker,
    swapper: HotSwapCoordinator,
    events: broadcast::Sender<HostEvent>,
    monitor_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    recovery_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    recovery_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<RecoveryRequest>>>,
}

impl HostManager {
    /// Manager that spawns the configured worker executable
    pub fn new(config: HostConfig) -> Arc<Self> {
        let launcher = Arc::new(ProcessLauncher::new(config.worker.clone()));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: HostConfig, launcher: Arc<dyn WorkerLauncher>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(Supervisor::new(
            launcher,
            &config,
            events.clone(),
            recovery_tx.clone(),
        ));
        let registry = Arc::new(PluginRegistry::new(
            Arc::clone(&supervisor),
            config.worker.search_paths.clone(),
            events.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&supervisor),
            Arc::clone(&registry),
            config.health.clone(),
            events.clone(),
            recovery_tx,
        ));

        Arc::new(Self {
            tracker: InvocationTracker::new(config.tracker.capacity),
            swapper: HotSwapCoordinator::new(Arc::clone(&registry)),
            config,
            supervisor,
            registry,
            monitor,
            events,
            monitor_task: parking_lot::Mutex::new(None),
            recovery_task: parking_lot::Mutex::new(None),
            recovery_rx: parking_lot::Mutex::new(Some(recovery_rx)),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &InvocationTracker {
        &self.tracker
    }

    pub fn state(&self) -> ManagerState {
        self.supervisor.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Start the worker, the health monitor and the recovery loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_recovery_loop();
        self.supervisor.start().await?;

        let mut task = self.monitor_task.lock();
        if task.as_ref().is_none_or(|t| t.is_finished()) {
            *task = Some(self.monitor.spawn());
        }
        Ok(())
    }

    /// Stop monitoring and shut the worker down
    pub async fn stop(&self) {
        if let Some(task) = self.monitor_task.lock().take() {
            task.abort();
        }
        self.supervisor.stop().await;
        info!("Plugin host stopped");
    }

    fn ensure_recovery_loop(self: &Arc<Self>) {
        let Some(mut rx) = self.recovery_rx.lock().take() else {
            return;
        };
        let manager: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.recover(request).await;
            }
        });
        *self.recovery_task.lock() = Some(handle);
    }

    async fn recover(&self, request: RecoveryRequest) {
        match self
            .supervisor
            .respawn(request.generation, &request.reason)
            .await
        {
            Ok(true) => {
                let restored = self.registry.restore_after_respawn().await;
                let ok = restored.iter().filter(|(_, r)| r.is_ok()).count();
                info!(
                    respawn_count = self.supervisor.respawn_count(),
                    restored = ok,
                    failed = restored.len() - ok,
                    "Worker respawned"
                );
            }
            Ok(false) => {}
            Err(e) => error!(error = %e, "Worker recovery failed"),
        }
    }

    pub fn status(&self) -> HostStatus {
        let stats = self.supervisor.stats().snapshot();
        HostStatus {
            lifecycle_state: self.supervisor.state(),
            health_status: self.monitor.status(),
            total_requests: stats.total,
            successful_requests: stats.successful,
            failed_requests: stats.failed,
            avg_response_time_ms: stats.avg_response_time_ms,
            uptime_seconds: self.supervisor.uptime().as_secs(),
            respawn_count: self.supervisor.respawn_count(),
        }
    }

    /// Raw request to the worker
    pub async fn request(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        self.supervisor
            .transport()?
            .send(method, params, timeout)
            .await
    }

    /// Check a plugin call against registry state and build its wire params.
    /// Nothing is sent when this fails.
    fn prepare_call(&self, plugin_id: &str, method: &str, params: Value) -> Result<Value> {
        let plugin = self.registry.get(plugin_id)?;
        if plugin.status != PluginStatus::Active {
            return Err(HostError::PluginStatus {
                id: plugin_id.to_string(),
                operation: "call".into(),
                status: plugin.status.name().to_string(),
                expected: "active".into(),
            });
        }

        let params = if plugin.methods.is_empty() {
            params
        } else {
            let declared = plugin.method(method).ok_or_else(|| {
                HostError::InvalidParams(format!(
                    "plugin `{}` has no method `{}`",
                    plugin_id, method
                ))
            })?;
            declared.bind(&params).map_err(HostError::InvalidParams)?
        };

        let call = CallParams {
            plugin_id: plugin_id.to_string(),
            method: method.to_string(),
            params,
        };
        Ok(serde_json::to_value(&call)?)
    }

    /// Invoke a method on an active plugin
    pub async fn call(
        &self,
        plugin_id: &str,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value> {
        let started = Instant::now();
        let outcome = self.dispatch_call(plugin_id, method, params, options.timeout).await;
        if options.track_history {
            self.tracker
                .record(plugin_id, method, &outcome, started.elapsed());
        }
        outcome
    }

    async fn dispatch_call(
        &self,
        plugin_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let transport = self.supervisor.transport()?;
        let params = self.prepare_call(plugin_id, method, params)?;
        transport.send(methods::CALL, params, timeout).await
    }

    /// Run every request concurrently; results keep request order
    pub async fn batch(&self, requests: Vec<BatchRequest>, timeout: Option<Duration>) -> Vec<BatchResult> {
        // Members rejected before dispatch took no time
        let mut outcomes: Vec<(Result<Value>, Duration)> = Vec::with_capacity(requests.len());

        match self.supervisor.transport() {
            Err(e) => outcomes.extend(requests.iter().map(|_| (Err(e.clone()), Duration::ZERO))),
            Ok(transport) => {
                let mut positions = Vec::new();
                let mut wire = Vec::new();
                for (index, request) in requests.iter().enumerate() {
                    let prepared = match &request.plugin_id {
                        Some(plugin_id) => self
                            .prepare_call(plugin_id, &request.method, request.params.clone())
                            .map(|params| (methods::CALL.to_string(), params)),
                        None => Ok((request.method.clone(), request.params.clone())),
                    };
                    match prepared {
                        Ok(message) => {
                            positions.push(index);
                            wire.push(message);
                            outcomes.push((
                                Err(HostError::Protocol("batch member got no result".into())),
                                Duration::ZERO,
                            ));
                        }
                        Err(e) => outcomes.push((Err(e), Duration::ZERO)),
                    }
                }
                let results = transport.send_batch(wire, timeout).await;
                for (index, timed) in positions.into_iter().zip(results) {
                    outcomes[index] = timed;
                }
            }
        }

        requests
            .iter()
            .zip(outcomes)
            .map(|(request, (outcome, elapsed))| {
                if let Some(plugin_id) = &request.plugin_id {
                    self.tracker.record(plugin_id, &request.method, &outcome, elapsed);
                }
                BatchResult::from(outcome)
            })
            .collect()
    }

    pub async fn discover(&self) -> Result<DiscoveryReport> {
        self.registry.discover().await
    }

    pub async fn scan(&self) -> Result<DiscoveryReport> {
        self.registry.scan().await
    }

    pub fn list(&self, pattern: Option<&str>) -> Vec<Plugin> {
        self.registry.list(pattern)
    }

    pub async fn load(&self, plugin_id: &str) -> Result<Plugin> {
        self.registry.load(plugin_id).await
    }

    pub async fn unload(&self, plugin_id: &str) -> Result<Plugin> {
        self.registry.unload(plugin_id).await
    }

    pub async fn swap(&self, old_id: &str, new_id: &str) -> SwapResult {
        self.swapper.swap(old_id, new_id).await
    }

    pub async fn configure(&self, plugin_id: &str, key: &str, value: Value) -> Result<PluginConfigOption> {
        self.registry.configure(plugin_id, key, value).await
    }

    /// Probe the worker and return its health record
    pub async fn ping(&self) -> Result<Duration> {
        self.monitor.ping().await
    }

    /// Worker health after a fresh probe, or one plugin's health
    pub async fn health_check(&self, plugin_id: Option<&str>) -> Result<HealthStatus> {
        match plugin_id {
            Some(id) => self.monitor.check_health(id).await,
            None => {
                // A failed probe is still a result: it lands in the health record
                if let Err(e) = self.monitor.ping().await {
                    if matches!(e, HostError::NotConnected(_)) {
                        return Err(e);
                    }
                }
                Ok(self.monitor.status())
            }
        }
    }

    pub fn history(&self, plugin_id: Option<&str>, limit: Option<usize>) -> Vec<InvocationRecord> {
        self.tracker.recent(plugin_id, limit)
    }
}

impl Drop for HostManager {
    fn drop(&mut self) {
        for task in [self.monitor_task.lock().take(), self.recovery_task.lock().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}
