//! Process Supervisor
//!
//! Owns the worker process and the transport to it. `ManagerState` is held
//! in a `watch` channel and only written here, under the lifecycle mutex.

mod backoff;
mod launcher;

pub use backoff::{RespawnBudget, RestartPolicy};
pub use launcher::{ProcessLauncher, WorkerIo, WorkerLauncher};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use atelier_protocol::methods;
use atelier_protocol::wire::PingResult;

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::transport::{RequestStats, Transport, TransportOptions};
use crate::types::{HostEvent, ManagerState};

/// Ask the recovery loop to replace the worker of session `generation`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub generation: u64,
    pub reason: String,
}

/// One worker process lifetime
struct WorkerSession {
    child: Option<Child>,
    transport: Arc<Transport>,
    fault_watch: JoinHandle<()>,
}

pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    handshake_timeout: Duration,
    shutdown_timeout: Duration,
    transport_options: TransportOptions,
    state_tx: watch::Sender<ManagerState>,
    lifecycle: Mutex<Option<WorkerSession>>,
    transport: parking_lot::RwLock<Option<Arc<Transport>>>,
    generation: AtomicU64,
    respawn_count: AtomicU32,
    stop_requested: AtomicBool,
    restarts: parking_lot::Mutex<RespawnBudget>,
    started_at: parking_lot::Mutex<Option<Instant>>,
    stats: Arc<RequestStats>,
    events: broadcast::Sender<HostEvent>,
    recovery_tx: mpsc::UnboundedSender<RecoveryRequest>,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        config: &HostConfig,
        events: broadcast::Sender<HostEvent>,
        recovery_tx: mpsc::UnboundedSender<RecoveryRequest>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ManagerState::Uninitialized);
        Self {
            launcher,
            handshake_timeout: config.worker.handshake_timeout(),
            shutdown_timeout: config.worker.shutdown_timeout(),
            transport_options: TransportOptions {
                default_timeout: config.transport.default_timeout(),
                max_frame_bytes: config.transport.max_frame_bytes,
            },
            state_tx,
            lifecycle: Mutex::new(None),
            transport: parking_lot::RwLock::new(None),
            generation: AtomicU64::new(0),
            respawn_count: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
            restarts: parking_lot::Mutex::new(RespawnBudget::new(config.restart.policy())),
            started_at: parking_lot::Mutex::new(None),
            stats: Arc::new(RequestStats::default()),
            events,
            recovery_tx,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state_tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn respawn_count(&self) -> u32 {
        self.respawn_count.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    pub fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    /// Transport to the running worker, or `NotConnected`
    pub fn transport(&self) -> Result<Arc<Transport>> {
        let state = self.state();
        if !state.is_running() {
            return Err(HostError::NotConnected(state.to_string()));
        }
        self.transport
            .read()
            .clone()
            .ok_or_else(|| HostError::NotConnected(state.to_string()))
    }

    fn set_state(&self, state: ManagerState) {
        debug!("Manager state -> {}", state);
        self.state_tx.send_replace(state.clone());
        let _ = self.events.send(HostEvent::StateChanged { state });
    }

    /// Launch the worker and wait for its handshake
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.lifecycle.lock().await;
        self.stop_requested.store(false, Ordering::SeqCst);
        self.start_locked(&mut slot).await
    }

    async fn start_locked(&self, slot: &mut Option<WorkerSession>) -> Result<()> {
        if matches!(self.state(), ManagerState::Running | ManagerState::Starting) {
            return Ok(());
        }
        self.set_state(ManagerState::Starting);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match self.launch_session(generation).await {
            Ok(session) => {
                *self.transport.write() = Some(Arc::clone(&session.transport));
                *slot = Some(session);
                *self.started_at.lock() = Some(Instant::now());
                self.restarts.lock().session_started(generation);
                self.set_state(ManagerState::Running);
                info!(generation, "Worker running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Worker failed to start");
                self.set_state(ManagerState::Errored(e.to_string()));
                Err(e)
            }
        }
    }

    async fn launch_session(&self, generation: u64) -> Result<WorkerSession> {
        let WorkerIo {
            reader,
            writer,
            mut child,
        } = self.launcher.launch().await?;

        let (transport, fault_rx) = Transport::new(
            reader,
            writer,
            self.transport_options,
            Arc::clone(&self.stats),
        );
        let transport = Arc::new(transport);

        match transport
            .send(methods::PING, Value::Null, Some(self.handshake_timeout))
            .await
        {
            Ok(reply) => {
                if let Ok(ping) = serde_json::from_value::<PingResult>(reply) {
                    info!(version = %ping.version, "Worker handshake complete");
                }
            }
            Err(e) => {
                transport.shutdown();
                if let Some(child) = child.as_mut() {
                    if let Err(kill_err) = child.kill().await {
                        warn!(error = %kill_err, "Failed to kill worker after handshake failure");
                    }
                }
                return Err(HostError::Process(format!("worker handshake failed: {}", e)));
            }
        }

        let recovery_tx = self.recovery_tx.clone();
        let fault_watch = tokio::spawn(async move {
            if let Ok(fault) = fault_rx.await {
                let _ = recovery_tx.send(RecoveryRequest {
                    generation,
                    reason: fault.reason,
                });
            }
        });

        Ok(WorkerSession {
            child,
            transport,
            fault_watch,
        })
    }

    /// Stop the worker. Pending requests fail with `ShuttingDown`.
    pub async fn stop(&self) {
        let mut slot = self.lifecycle.lock().await;
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_locked(&mut slot).await;
    }

    async fn stop_locked(&self, slot: &mut Option<WorkerSession>) {
        if matches!(self.state(), ManagerState::Stopped | ManagerState::Stopping) {
            return;
        }
        self.set_state(ManagerState::Stopping);
        self.transport.write().take();

        if let Some(session) = slot.take() {
            self.shutdown_session(session).await;
        }

        *self.started_at.lock() = None;
        self.set_state(ManagerState::Stopped);
    }

    async fn shutdown_session(&self, session: WorkerSession) {
        let WorkerSession {
            child,
            transport,
            fault_watch,
        } = session;
        fault_watch.abort();
        transport.shutdown();

        match tokio::time::timeout(self.shutdown_timeout, transport.send_stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Could not deliver stop frame"),
            Err(_) => debug!("Timed out delivering stop frame"),
        }

        if let Some(mut child) = child {
            match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "Worker exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for worker"),
                Err(_) => {
                    warn!("Worker did not exit in time, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill worker");
                    }
                }
            }
        }
    }

    /// Replace the worker of session `generation`.
    ///
    /// Returns `Ok(false)` when the request is stale: the session already
    /// ended, or the host was stopped on purpose. Launch failures are retried
    /// with backoff until the restart budget runs out.
    pub async fn respawn(&self, generation: u64, reason: &str) -> Result<bool> {
        {
            let mut slot = self.lifecycle.lock().await;
            if generation != self.generation() || !self.state().is_running() {
                debug!(generation, reason, "Ignoring stale respawn request");
                return Ok(false);
            }
            warn!(generation, reason, "Respawning worker");
            self.stop_locked(&mut slot).await;
        }

        loop {
            let delay = self.restarts.lock().next_attempt(generation);
            let Some(delay) = delay else {
                let message = "restart limit exhausted".to_string();
                error!("Giving up on worker: {}", message);
                self.set_state(ManagerState::Errored(message.clone()));
                return Err(HostError::Process(message));
            };
            tokio::time::sleep(delay).await;

            let mut slot = self.lifecycle.lock().await;
            if self.stop_requested.load(Ordering::SeqCst) {
                debug!("Host stopped during respawn backoff");
                return Ok(false);
            }
            if self.state().is_running() {
                // Somebody else already brought a worker up
                return Ok(false);
            }

            let respawn_count = self.respawn_count.fetch_add(1, Ordering::SeqCst) + 1;
            match self.start_locked(&mut slot).await {
                Ok(()) => {
                    let _ = self.events.send(HostEvent::Respawned {
                        respawn_count,
                        reason: reason.to_string(),
                    });
                    return Ok(true);
                }
                Err(e) => warn!(error = %e, respawn_count, "Respawn attempt failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, FakeWorker, PingMode};

    fn supervisor(
        worker: &FakeWorker,
        config: &HostConfig,
    ) -> (Supervisor, mpsc::UnboundedReceiver<RecoveryRequest>) {
        let (events, _) = broadcast::channel(64);
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();
        (
            Supervisor::new(worker.launcher(), config, events, recovery_tx),
            recovery_rx,
        )
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let worker = FakeWorker::new();
        let (sup, _rx) = supervisor(&worker, &test_config());
        assert_eq!(sup.state(), ManagerState::Uninitialized);
        assert!(matches!(sup.transport(), Err(HostError::NotConnected(_))));

        sup.start().await.unwrap();
        assert_eq!(sup.state(), ManagerState::Running);
        assert_eq!(sup.generation(), 1);

        // Starting twice is a no-op
        sup.start().await.unwrap();
        assert_eq!(worker.launches(), 1);

        sup.stop().await;
        assert_eq!(sup.state(), ManagerState::Stopped);
        assert!(matches!(sup.transport(), Err(HostError::NotConnected(_))));

        // So is stopping twice
        sup.stop().await;
        assert_eq!(sup.state(), ManagerState::Stopped);
    }

    #[tokio::test]
    async fn test_handshake_failure_leaves_errored() {
        let worker = FakeWorker::new();
        worker.set_ping(PingMode::Silent);
        let mut config = test_config();
        config.worker.handshake_timeout_ms = 50;
        let (sup, _rx) = supervisor(&worker, &config);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, HostError::Process(_)));
        assert!(matches!(sup.state(), ManagerState::Errored(_)));

        // Errored may be started again
        worker.set_ping(PingMode::Respond);
        sup.start().await.unwrap();
        assert!(sup.state().is_running());
    }

    #[tokio::test]
    async fn test_crash_reports_fault_with_generation() {
        let worker = FakeWorker::new();
        let (sup, mut rx) = supervisor(&worker, &test_config());
        sup.start().await.unwrap();

        worker.crash();
        let request = rx.recv().await.unwrap();
        assert_eq!(request.generation, 1);

        assert!(sup.respawn(request.generation, &request.reason).await.unwrap());
        assert!(sup.state().is_running());
        assert_eq!(sup.respawn_count(), 1);
        assert_eq!(sup.generation(), 2);
        assert_eq!(worker.launches(), 2);

        // Second report for the same dead worker is ignored
        assert!(!sup.respawn(1, "duplicate").await.unwrap());
        assert_eq!(worker.launches(), 2);
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion() {
        let worker = FakeWorker::new();
        let mut config = test_config();
        config.restart.max_restarts = 1;
        let (sup, _rx) = supervisor(&worker, &config);
        sup.start().await.unwrap();

        assert!(sup.respawn(1, "first").await.unwrap());
        let err = sup.respawn(2, "second").await.unwrap_err();
        assert!(matches!(err, HostError::Process(_)));
        assert_eq!(
            sup.state(),
            ManagerState::Errored("restart limit exhausted".into())
        );
    }

    #[tokio::test]
    async fn test_stop_fails_pending_requests() {
        let worker = FakeWorker::new();
        worker.set_delay("slow", Duration::from_secs(10));
        let (sup, _rx) = supervisor(&worker, &test_config());
        sup.start().await.unwrap();

        let transport = sup.transport().unwrap();
        let pending = tokio::spawn(async move { transport.send("slow", Value::Null, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        sup.stop().await;
        assert_eq!(pending.await.unwrap().unwrap_err(), HostError::ShuttingDown);
    }
}
