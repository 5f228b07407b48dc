//! Worker launching
//!
//! The supervisor never spawns processes itself; it asks a
//! [`WorkerLauncher`] for a byte stream to the next worker. Production uses
//! [`ProcessLauncher`], tests substitute an in-process fake.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::info;

use crate::config::WorkerConfig;
use crate::error::{HostError, Result};
use crate::transport::{BoxedReader, BoxedWriter};

/// Streams to a freshly launched worker
pub struct WorkerIo {
    /// Worker output (its stdout)
    pub reader: BoxedReader,
    /// Worker input (its stdin)
    pub writer: BoxedWriter,
    /// OS process, when there is one to reap
    pub child: Option<Child>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self) -> Result<WorkerIo>;
}

/// Spawns the worker executable with piped stdio
pub struct ProcessLauncher {
    config: WorkerConfig,
}

impl ProcessLauncher {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Resolve a bare program name next to our own executable, then PATH
    fn program_path(&self) -> PathBuf {
        let program = &self.config.program;
        if program.components().count() > 1 {
            return program.clone();
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let sibling = dir.join(program);
                if sibling.exists() {
                    return sibling;
                }
            }
        }
        program.clone()
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<WorkerIo> {
        let program = self.program_path();
        info!("Spawning worker process: {}", program.display());

        let mut cmd = Command::new(&program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Worker diagnostics go straight to our stderr
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            HostError::Process(format!("failed to spawn {}: {}", program.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Process("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Process("worker stdout unavailable".into()))?;

        Ok(WorkerIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}
