//! In-process fake worker for tests
//!
//! Speaks the real frame codec over `tokio::io::duplex`, so everything above
//! the launcher runs exactly as it does against a spawned process.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{DuplexStream, WriteHalf};
use tokio::sync::oneshot;

use atelier_protocol::wire::{
    error_codes, CallParams, DiscoverParams, DiscoverResult, DiscoveryIssue, HealthParams,
    LoadParams, LoadResult, ManifestEntry, ReadyMessage, UnloadParams,
};
use atelier_protocol::{
    methods, FrameReader, FrameWriter, MessageType, PluginConfigOption, PluginMethod, Request,
    Response,
};

use crate::config::HostConfig;
use crate::error::Result;
use crate::supervisor::{WorkerIo, WorkerLauncher};

/// How the fake answers `ping`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingMode {
    Respond,
    Fail,
    Silent,
}

struct FakePlugin {
    path: PathBuf,
    manifest: Value,
    methods: Vec<PluginMethod>,
    config: Vec<PluginConfigOption>,
    healthy: bool,
}

struct FakeState {
    plugins: Mutex<Vec<FakePlugin>>,
    broken: Mutex<Vec<DiscoveryIssue>>,
    loaded: Mutex<HashSet<String>>,
    failing_loads: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    ping: Mutex<PingMode>,
    heal_on_launch: AtomicBool,
    received: Mutex<Vec<Request>>,
    launches: AtomicUsize,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

#[derive(Clone)]
pub(crate) struct FakeWorker {
    state: Arc<FakeState>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState {
                plugins: Mutex::new(Vec::new()),
                broken: Mutex::new(Vec::new()),
                loaded: Mutex::new(HashSet::new()),
                failing_loads: Mutex::new(HashSet::new()),
                delays: Mutex::new(HashMap::new()),
                ping: Mutex::new(PingMode::Respond),
                heal_on_launch: AtomicBool::new(false),
                received: Mutex::new(Vec::new()),
                launches: AtomicUsize::new(0),
                kill: Mutex::new(None),
            }),
        }
    }

    pub fn with_plugin(self, manifest: Value) -> Self {
        self.add_plugin(manifest);
        self
    }

    /// Make a plugin discoverable; its manifest lives at `/plugins/<id>/plugin.json`
    pub fn add_plugin(&self, manifest: Value) {
        let id = manifest["id"].as_str().unwrap_or("unnamed").to_string();
        self.state.plugins.lock().push(FakePlugin {
            path: PathBuf::from(format!("/plugins/{}/plugin.json", id)),
            manifest,
            methods: Vec::new(),
            config: Vec::new(),
            healthy: true,
        });
    }

    pub fn with_methods(self, id: &str, methods: Vec<PluginMethod>) -> Self {
        self.edit(id, |p| p.methods = methods);
        self
    }

    pub fn with_config(self, id: &str, config: Vec<PluginConfigOption>) -> Self {
        self.edit(id, |p| p.config = config);
        self
    }

    pub fn add_broken_manifest(&self, path: &str, message: &str) {
        self.state.broken.lock().push(DiscoveryIssue {
            path: PathBuf::from(path),
            message: message.to_string(),
        });
    }

    pub fn fail_load(&self, id: &str) {
        self.state.failing_loads.lock().insert(id.to_string());
    }

    pub fn set_ping(&self, mode: PingMode) {
        *self.state.ping.lock() = mode;
    }

    /// Stop answering pings until the next launch, like a hung process
    pub fn hang_until_restart(&self) {
        self.state.heal_on_launch.store(true, Ordering::SeqCst);
        self.set_ping(PingMode::Silent);
    }

    pub fn set_delay(&self, method: &str, delay: Duration) {
        self.state.delays.lock().insert(method.to_string(), delay);
    }

    pub fn set_plugin_health(&self, id: &str, healthy: bool) {
        self.edit(id, |p| p.healthy = healthy);
    }

    /// Kill the current session as if the process died
    pub fn crash(&self) {
        if let Some(kill) = self.state.kill.lock().take() {
            let _ = kill.send(());
        }
    }

    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Requests received for `method` across all sessions
    pub fn count(&self, method: &str) -> usize {
        self.state
            .received
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    pub fn total_requests(&self) -> usize {
        self.state.received.lock().len()
    }

    /// Params of every `plugin.call` received, in arrival order
    pub fn calls(&self) -> Vec<CallParams> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|r| r.method == methods::CALL)
            .filter_map(|r| serde_json::from_value(r.params.clone()).ok())
            .collect()
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.state.loaded.lock().contains(id)
    }

    pub fn launcher(&self) -> Arc<dyn WorkerLauncher> {
        Arc::new(FakeLauncher {
            state: Arc::clone(&self.state),
        })
    }

    fn edit(&self, id: &str, f: impl FnOnce(&mut FakePlugin)) {
        let mut plugins = self.state.plugins.lock();
        if let Some(plugin) = plugins.iter_mut().find(|p| p.manifest["id"] == id) {
            f(plugin);
        }
    }
}

/// Configuration with short timings and no background probing
pub(crate) fn test_config() -> HostConfig {
    let mut config = HostConfig::default();
    config.worker.handshake_timeout_ms = 1_000;
    config.worker.shutdown_timeout_ms = 200;
    config.transport.default_timeout_ms = 1_000;
    config.health.interval_ms = 3_600_000;
    config.health.probe_timeout_ms = 100;
    config.restart.initial_backoff_ms = 10;
    config.restart.max_backoff_ms = 50;
    config
}

/// Manifest JSON for a plugin with only an id and name
pub(crate) fn manifest(id: &str) -> Value {
    json!({ "id": id, "name": id })
}

struct FakeLauncher {
    state: Arc<FakeState>,
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self) -> Result<WorkerIo> {
        // A fresh process starts with nothing loaded
        self.state.loaded.lock().clear();
        if self.state.heal_on_launch.swap(false, Ordering::SeqCst) {
            *self.state.ping.lock() = PingMode::Respond;
        }
        self.state.launches.fetch_add(1, Ordering::SeqCst);

        let (host, worker) = tokio::io::duplex(1024 * 1024);
        let (kill_tx, kill_rx) = oneshot::channel();
        *self.state.kill.lock() = Some(kill_tx);
        tokio::spawn(serve(Arc::clone(&self.state), worker, kill_rx));

        let (reader, writer) = tokio::io::split(host);
        Ok(WorkerIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        })
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<FrameWriter<WriteHalf<DuplexStream>>>>;

async fn serve(state: Arc<FakeState>, stream: DuplexStream, mut kill: oneshot::Receiver<()>) {
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FrameReader::new(reader);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(FrameWriter::new(writer)));

    let ready = ReadyMessage {
        version: "fake".into(),
        pid: 0,
    };
    let _ = writer.lock().await.send_json(MessageType::Ready, &ready).await;

    loop {
        let frame = tokio::select! {
            _ = &mut kill => return,
            frame = reader.recv() => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            _ => return,
        };
        match frame.msg_type {
            MessageType::Stop => return,
            MessageType::Request => {
                let Ok(request) = frame.parse_json::<Request>() else {
                    continue;
                };
                state.received.lock().push(request.clone());
                let delay = state.delays.lock().get(&request.method).copied();
                let state = Arc::clone(&state);
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    if let Some(response) = handle(&state, request) {
                        let _ = writer
                            .lock()
                            .await
                            .send_json(MessageType::Response, &response)
                            .await;
                    }
                });
            }
            _ => {}
        }
    }
}

fn handle(state: &FakeState, request: Request) -> Option<Response> {
    let id = request.id;
    let params = request.params;
    let response = match request.method.as_str() {
        methods::PING => match *state.ping.lock() {
            PingMode::Respond => Response::ok(id, json!({"version": "fake", "uptime_ms": 0})),
            PingMode::Fail => Response::err(id, error_codes::INTERNAL, "worker unhealthy"),
            PingMode::Silent => return None,
        },
        methods::DISCOVER => {
            let params: DiscoverParams = serde_json::from_value(params).unwrap_or_default();
            let manifests = state
                .plugins
                .lock()
                .iter()
                .filter(|p| !params.exclude.contains(&p.path))
                .map(|p| ManifestEntry {
                    path: p.path.clone(),
                    manifest: p.manifest.clone(),
                })
                .collect();
            let result = DiscoverResult {
                manifests,
                errors: state.broken.lock().clone(),
            };
            Response::ok(id, serde_json::to_value(result).unwrap())
        }
        methods::LOAD => {
            let params: LoadParams = serde_json::from_value(params).unwrap();
            if state.failing_loads.lock().contains(&params.plugin_id) {
                Response::err(id, error_codes::LOAD_FAILED, "entry point crashed")
            } else {
                let plugins = state.plugins.lock();
                match plugins.iter().find(|p| p.manifest["id"] == params.plugin_id.as_str()) {
                    Some(plugin) => {
                        state.loaded.lock().insert(params.plugin_id.clone());
                        let result = LoadResult {
                            methods: plugin.methods.clone(),
                            config: plugin.config.clone(),
                        };
                        Response::ok(id, serde_json::to_value(result).unwrap())
                    }
                    None => Response::err(id, error_codes::NOT_FOUND, "no such plugin"),
                }
            }
        }
        methods::UNLOAD => {
            let params: UnloadParams = serde_json::from_value(params).unwrap();
            state.loaded.lock().remove(&params.plugin_id);
            Response::ok(id, Value::Null)
        }
        methods::CALL => {
            let params: CallParams = serde_json::from_value(params).unwrap();
            if state.loaded.lock().contains(&params.plugin_id) {
                Response::ok(
                    id,
                    json!({
                        "plugin_id": params.plugin_id,
                        "method": params.method,
                        "params": params.params,
                    }),
                )
            } else {
                Response::err(id, error_codes::NOT_LOADED, "plugin is not loaded")
            }
        }
        methods::HEALTH => {
            let params: HealthParams = serde_json::from_value(params).unwrap();
            let healthy = state
                .plugins
                .lock()
                .iter()
                .find(|p| p.manifest["id"] == params.plugin_id.as_str())
                .map(|p| p.healthy)
                .unwrap_or(false);
            Response::ok(id, json!({ "healthy": healthy }))
        }
        methods::CONFIGURE => Response::ok(id, Value::Null),
        "echo" => Response::ok(id, params),
        "slow" => Response::ok(id, json!("slow")),
        other => Response::err(
            id,
            error_codes::UNKNOWN_METHOD,
            format!("unknown method `{}`", other),
        ),
    };
    Some(response)
}
