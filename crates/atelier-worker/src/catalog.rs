//! Plugin catalog held by the worker
//!
//! Finds manifests on disk and keeps the set of loaded plugins. Plugin
//! bodies are opaque here: a call is answered with an echo of what was
//! asked, plus the plugin's current configuration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use atelier_protocol::wire::{
    error_codes, CallParams, ConfigureParams, DiscoverParams, DiscoverResult, DiscoveryIssue,
    HealthParams, HealthResult, LoadParams, LoadResult, LogMessage, ManifestEntry, PingResult,
    UnloadParams,
};
use atelier_protocol::{
    methods, PluginConfigOption, PluginMethod, Request, Response, MANIFEST_FILE_NAME,
};

struct LoadedPlugin {
    path: PathBuf,
    methods: Vec<PluginMethod>,
    options: Vec<PluginConfigOption>,
    values: BTreeMap<String, Value>,
}

pub struct Catalog {
    search_paths: Vec<PathBuf>,
    loaded: HashMap<String, LoadedPlugin>,
    started: Instant,
    /// Log lines to forward to the host
    notes: Vec<LogMessage>,
}

impl Catalog {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            loaded: HashMap::new(),
            started: Instant::now(),
            notes: Vec::new(),
        }
    }

    /// Log lines produced since the last drain
    pub fn drain_notes(&mut self) -> Vec<LogMessage> {
        std::mem::take(&mut self.notes)
    }

    pub async fn handle(&mut self, request: Request) -> Response {
        let id = request.id;
        debug!(id, method = %request.method, "Handling request");
        let result = match request.method.as_str() {
            methods::PING => Ok(to_value(PingResult {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            })),
            methods::DISCOVER => match parse(request.params) {
                Ok(params) => Ok(to_value(self.discover(params).await)),
                Err(e) => Err(e),
            },
            methods::LOAD => match parse(request.params) {
                Ok(params) => self.load(params).await.map(to_value),
                Err(e) => Err(e),
            },
            methods::UNLOAD => parse(request.params).map(|params| self.unload(params)),
            methods::CALL => parse(request.params).and_then(|params| self.call(params)),
            methods::HEALTH => parse(request.params).map(|params| to_value(self.health(params))),
            methods::CONFIGURE => parse(request.params).and_then(|params| self.configure(params)),
            other => Err((
                error_codes::UNKNOWN_METHOD,
                format!("unknown method `{}`", other),
            )),
        };
        match result {
            Ok(value) => Response::ok(id, value),
            Err((code, message)) => Response::err(id, code, message),
        }
    }

    /// Manifests in the immediate subdirectories of every search path
    async fn discover(&self, params: DiscoverParams) -> DiscoverResult {
        let exclude: HashSet<PathBuf> = params.exclude.into_iter().collect();
        let mut roots = self.search_paths.clone();
        for path in params.search_paths {
            if !roots.contains(&path) {
                roots.push(path);
            }
        }

        let mut result = DiscoverResult::default();
        for root in &roots {
            for path in manifest_candidates(root).await {
                if exclude.contains(&path) {
                    continue;
                }
                match read_manifest(&path).await {
                    Ok(manifest) => result.manifests.push(ManifestEntry { path, manifest }),
                    Err(message) => {
                        warn!("Skipping {}: {}", path.display(), message);
                        result.errors.push(DiscoveryIssue { path, message });
                    }
                }
            }
        }
        info!(
            "Discovered {} manifest(s), {} error(s)",
            result.manifests.len(),
            result.errors.len()
        );
        result
    }

    async fn load(&mut self, params: LoadParams) -> Result<LoadResult, (&'static str, String)> {
        let manifest = read_manifest(&params.path)
            .await
            .map_err(|message| (error_codes::LOAD_FAILED, message))?;
        let declared_id = manifest.get("id").and_then(Value::as_str).map(str::trim);
        if declared_id != Some(params.plugin_id.as_str()) {
            return Err((
                error_codes::INVALID_PARAMS,
                format!(
                    "{} does not describe plugin {}",
                    params.path.display(),
                    params.plugin_id
                ),
            ));
        }

        let methods: Vec<PluginMethod> = declared(&manifest, "methods")
            .map_err(|message| (error_codes::LOAD_FAILED, message))?;
        let options: Vec<PluginConfigOption> = declared(&manifest, "config")
            .map_err(|message| (error_codes::LOAD_FAILED, message))?;

        let values = options
            .iter()
            .map(|option| {
                let value = if option.value.is_null() {
                    option.default_value.clone()
                } else {
                    option.value.clone()
                };
                (option.key.clone(), value)
            })
            .collect();

        let result = LoadResult {
            methods: methods.clone(),
            config: options.clone(),
        };
        self.loaded.insert(
            params.plugin_id.clone(),
            LoadedPlugin {
                path: params.path,
                methods,
                options,
                values,
            },
        );
        self.note("info", format!("Loaded plugin {}", params.plugin_id));
        Ok(result)
    }

    /// Idempotent: unloading an unknown plugin succeeds
    fn unload(&mut self, params: UnloadParams) -> Value {
        if let Some(plugin) = self.loaded.remove(&params.plugin_id) {
            self.note(
                "info",
                format!("Unloaded plugin {} ({})", params.plugin_id, plugin.path.display()),
            );
        }
        Value::Null
    }

    fn call(&self, params: CallParams) -> Result<Value, (&'static str, String)> {
        let plugin = self.loaded_plugin(&params.plugin_id)?;
        if !plugin.methods.is_empty() && !plugin.methods.iter().any(|m| m.name == params.method) {
            return Err((
                error_codes::UNKNOWN_METHOD,
                format!("plugin {} has no method `{}`", params.plugin_id, params.method),
            ));
        }
        Ok(json!({
            "plugin_id": params.plugin_id,
            "method": params.method,
            "params": params.params,
            "config": plugin.values,
        }))
    }

    fn health(&self, params: HealthParams) -> HealthResult {
        match self.loaded.get(&params.plugin_id) {
            Some(_) => HealthResult {
                healthy: true,
                message: None,
            },
            None => HealthResult {
                healthy: false,
                message: Some(format!("plugin {} is not loaded", params.plugin_id)),
            },
        }
    }

    fn configure(&mut self, params: ConfigureParams) -> Result<Value, (&'static str, String)> {
        let plugin = self.loaded.get_mut(&params.plugin_id).ok_or_else(|| {
            (
                error_codes::NOT_LOADED,
                format!("plugin {} is not loaded", params.plugin_id),
            )
        })?;
        if let Some(option) = plugin.options.iter().find(|o| o.key == params.key) {
            option
                .validate(&params.value)
                .map_err(|message| (error_codes::INVALID_PARAMS, message))?;
        }
        plugin.values.insert(params.key, params.value);
        Ok(Value::Null)
    }

    fn loaded_plugin(&self, plugin_id: &str) -> Result<&LoadedPlugin, (&'static str, String)> {
        self.loaded.get(plugin_id).ok_or_else(|| {
            (
                error_codes::NOT_LOADED,
                format!("plugin {} is not loaded", plugin_id),
            )
        })
    }

    fn note(&mut self, level: &str, message: String) {
        info!("{}", message);
        self.notes.push(LogMessage {
            level: level.to_string(),
            message,
        });
    }
}

/// `<root>/<dir>/plugin.json` for every subdirectory, sorted
async fn manifest_candidates(root: &Path) -> Vec<PathBuf> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot read search path {}: {}", root.display(), e);
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let candidate = entry.path().join(MANIFEST_FILE_NAME);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            found.push(candidate);
        }
    }
    found.sort();
    found
}

async fn read_manifest(path: &Path) -> Result<Value, String> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read manifest: {}", e))?;
    let manifest: Value =
        serde_json::from_str(&content).map_err(|e| format!("invalid JSON: {}", e))?;
    if !manifest.is_object() {
        return Err("manifest must be a JSON object".to_string());
    }
    Ok(manifest)
}

/// Optional list under `key`; absent means empty
fn declared<T: serde::de::DeserializeOwned>(manifest: &Value, key: &str) -> Result<Vec<T>, String> {
    match manifest.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| format!("invalid `{}` declaration: {}", key, e)),
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, (&'static str, String)> {
    serde_json::from_value(params).map_err(|e| (error_codes::INVALID_PARAMS, e.to_string()))
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
