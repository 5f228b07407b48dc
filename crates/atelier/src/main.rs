//! Atelier Server
//!
//! Plugin host with an HTTP command API and WebSocket event stream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use atelier::server::{create_router, AppState};
use atelier::watcher::PluginWatcher;
use atelier::{HostConfig, HostManager};

/// Atelier Plugin Host
#[derive(Parser, Debug)]
#[command(name = "atelier")]
#[command(about = "Atelier Plugin Host", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./atelier.toml")]
    config: PathBuf,

    /// Server host address (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Worker executable (overrides the config file)
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Plugin search path; may be repeated, replaces the configured list
    #[arg(long = "search-path")]
    search_paths: Vec<PathBuf>,

    /// Rescan when manifests appear on the search paths
    #[arg(long)]
    watch: bool,

    /// Don't start the worker until an `ipc_start` command arrives
    #[arg(long)]
    no_autostart: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("atelier=info,worker=info,tower_http=debug"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Atelier v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let manager = HostManager::new(config.clone());

    if !args.no_autostart {
        // The API stays up even if the worker can't start; clients can retry
        if let Err(e) = manager.start().await {
            error!("Failed to start worker: {}", e);
        } else {
            match manager.discover().await {
                Ok(report) => info!("Discovered {} plugin(s)", report.plugins.len()),
                Err(e) => warn!("Initial discovery failed: {}", e),
            }
        }
    }

    if args.watch || config.server.watch_plugins {
        match PluginWatcher::new(&config.worker.search_paths, Arc::clone(&manager)) {
            Ok(watcher) => {
                tokio::spawn(watcher.run());
            }
            Err(e) => error!("Failed to start plugin watcher: {}", e),
        }
    }

    let app = create_router(AppState::new(Arc::clone(&manager)));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping worker...");
    manager.stop().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Config file if present, then command line overrides
async fn load_config(args: &Args) -> Result<HostConfig> {
    let mut config = if args.config.exists() {
        info!("Loading configuration from {}", args.config.display());
        HostConfig::load(&args.config)
            .await
            .with_context(|| format!("invalid configuration in {}", args.config.display()))?
    } else {
        info!("No configuration at {}, using defaults", args.config.display());
        HostConfig::default()
    };

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(worker) = &args.worker {
        config.worker.program = worker.clone();
    }
    if !args.search_paths.is_empty() {
        config.worker.search_paths = args.search_paths.clone();
    }
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received terminate signal, shutting down..."),
    }
}
