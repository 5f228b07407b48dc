//! Health Monitor
//!
//! Periodic liveness probes. Worker-level failures count toward the respawn
//! threshold; plugin-level failures only touch that plugin's health record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use atelier_protocol::methods;
use atelier_protocol::wire::HealthResult;

use crate::config::HealthConfig;
use crate::error::{HostError, Result};
use crate::registry::PluginRegistry;
use crate::supervisor::{RecoveryRequest, Supervisor};
use crate::types::{HealthStatus, HostEvent, PluginStatus};

/// Worker health, tied to the session it was measured on
#[derive(Default)]
struct WorkerHealth {
    generation: u64,
    status: HealthStatus,
}

pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    registry: Arc<PluginRegistry>,
    config: HealthConfig,
    worker: Mutex<WorkerHealth>,
    events: broadcast::Sender<HostEvent>,
    recovery_tx: mpsc::UnboundedSender<RecoveryRequest>,
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<Supervisor>,
        registry: Arc<PluginRegistry>,
        config: HealthConfig,
        events: broadcast::Sender<HostEvent>,
        recovery_tx: mpsc::UnboundedSender<RecoveryRequest>,
    ) -> Self {
        Self {
            supervisor,
            registry,
            config,
            worker: Mutex::new(WorkerHealth::default()),
            events,
            recovery_tx,
        }
    }

    /// Latest worker-level health
    pub fn status(&self) -> HealthStatus {
        self.worker.lock().status.clone()
    }

    /// Probe the worker once
    pub async fn ping(&self) -> Result<Duration> {
        let transport = self.supervisor.transport()?;
        let generation = self.supervisor.generation();
        let started = Instant::now();

        match transport
            .send(methods::PING, Value::Null, Some(self.config.probe_timeout()))
            .await
        {
            Ok(_) => {
                let latency = started.elapsed();
                self.record(generation, Ok(latency));
                Ok(latency)
            }
            Err(e) => {
                self.record(generation, Err(e.to_string()));
                Err(e)
            }
        }
    }

    fn record(&self, generation: u64, probe: std::result::Result<Duration, String>) {
        let (health, crossed) = {
            let mut worker = self.worker.lock();
            if worker.generation != generation {
                // New worker, clean slate
                *worker = WorkerHealth {
                    generation,
                    status: HealthStatus::default(),
                };
            }
            let crossed = match probe {
                Ok(latency) => {
                    worker.status.record_success(latency);
                    false
                }
                Err(e) => worker.status.record_failure(e) == self.config.failure_threshold,
            };
            (worker.status.clone(), crossed)
        };

        let failures = health.failure_count;
        let _ = self.events.send(HostEvent::HealthChanged {
            plugin_id: None,
            health,
        });

        if crossed {
            warn!(failures, generation, "Worker failed its health checks, requesting respawn");
            let _ = self.recovery_tx.send(RecoveryRequest {
                generation,
                reason: format!("{} consecutive failed health checks", failures),
            });
        }
    }

    /// Probe one active plugin
    pub async fn check_health(&self, plugin_id: &str) -> Result<HealthStatus> {
        let plugin = self.registry.get(plugin_id)?;
        if plugin.status != PluginStatus::Active {
            return Err(HostError::PluginStatus {
                id: plugin_id.to_string(),
                operation: "health_check".into(),
                status: plugin.status.name().to_string(),
                expected: "active".into(),
            });
        }
        let transport = self.supervisor.transport()?;

        let started = Instant::now();
        let probe = match transport
            .send(
                methods::HEALTH,
                json!({ "plugin_id": plugin_id }),
                Some(self.config.probe_timeout()),
            )
            .await
        {
            Ok(reply) => match serde_json::from_value::<HealthResult>(reply) {
                Ok(result) if result.healthy => Ok(started.elapsed()),
                Ok(result) => Err(result
                    .message
                    .unwrap_or_else(|| "plugin reported unhealthy".into())),
                Err(e) => Err(format!("unexpected health reply: {}", e)),
            },
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = &probe {
            debug!(plugin_id, error = %e, "Plugin health probe failed");
        }
        self.registry
            .record_health(plugin_id, probe)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))
    }

    /// One monitoring pass; does nothing unless the worker is running
    pub async fn tick(&self) {
        if !self.supervisor.state().is_running() {
            return;
        }
        if let Err(e) = self.ping().await {
            debug!(error = %e, "Worker ping failed");
        }
        if self.config.probe_plugins {
            let ids = self.registry.active_ids();
            join_all(ids.iter().map(|id| self.check_health(id))).await;
        }
    }

    /// Run [`HealthMonitor::tick`] every interval until aborted
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; the worker was just checked by its handshake
            interval.tick().await;
            loop {
                interval.tick().await;
                monitor.tick().await;
            }
        })
    }
}
