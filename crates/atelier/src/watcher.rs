//! Plugin Directory Watcher
//!
//! Watches the search paths and rescans when a manifest appears or changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use atelier_protocol::MANIFEST_FILE_NAME;

use crate::manager::HostManager;

/// Quiet period before a burst of file events triggers one rescan
const SETTLE_DELAY: Duration = Duration::from_millis(250);

pub struct PluginWatcher {
    manager: Arc<HostManager>,
    rx: mpsc::Receiver<PathBuf>,
    /// Kept alive for the lifetime of the loop
    _watcher: RecommendedWatcher,
}

impl PluginWatcher {
    /// Watch every search path that exists; missing ones are skipped
    pub fn new(search_paths: &[PathBuf], manager: Arc<HostManager>) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if let Some(path) = manifest_change(&event) {
                        let _ = tx.blocking_send(path);
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            }
        })?;

        for path in search_paths {
            if !path.is_dir() {
                warn!("Not watching missing search path: {}", path.display());
                continue;
            }
            watcher.watch(path, RecursiveMode::Recursive)?;
            info!("Watching plugin directory: {}", path.display());
        }

        Ok(Self {
            manager,
            rx,
            _watcher: watcher,
        })
    }

    /// Run the watcher loop
    pub async fn run(mut self) {
        while let Some(path) = self.rx.recv().await {
            debug!("Manifest changed: {}", path.display());

            // Coalesce the rest of the burst
            while let Ok(Some(_)) = tokio::time::timeout(SETTLE_DELAY, self.rx.recv()).await {}

            if !self.manager.state().is_running() {
                debug!("Worker not running, skipping rescan");
                continue;
            }
            match self.manager.scan().await {
                Ok(report) if !report.added.is_empty() => {
                    info!("Rescan found {} new plugin(s)", report.added.len());
                }
                Ok(_) => {}
                Err(e) => warn!("Rescan failed: {}", e),
            }
        }
        info!("Plugin watcher loop ended");
    }
}

/// The manifest path touched by `event`, if any
fn manifest_change(event: &Event) -> Option<PathBuf> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => {}
        _ => return None,
    }
    event
        .paths
        .iter()
        .find(|path| is_manifest(path))
        .cloned()
}

fn is_manifest(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == MANIFEST_FILE_NAME)
}
