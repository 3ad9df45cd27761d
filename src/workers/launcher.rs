//! How the orchestrator obtains worker handles.

use crate::config::FleetConfig;
use crate::error::{SpawnFailure, SpawnFailureReason};
use crate::workers::process::{EventSender, SpawnOptions, WorkerHandle, WorkerProcess};
use crate::workers::protocol::WorkerId;
use async_trait::async_trait;
use std::ffi::OsString;

/// Starts workers on behalf of the orchestrator.
///
/// A launched worker reports through `events` and must eventually send
/// `worker/ready`, or fail.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        worker_id: WorkerId,
        name: &str,
        events: EventSender,
    ) -> Result<WorkerHandle, SpawnFailure>;
}

/// Launches this crate's own binary in worker mode.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: FleetConfig,
}

impl ProcessLauncher {
    pub fn new(config: FleetConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Full command line for worker `worker_id`.
    pub fn argv(&self, worker_id: WorkerId) -> Result<Vec<OsString>, SpawnFailure> {
        let binary = self
            .config
            .worker_binary()
            .map_err(|e| SpawnFailure::new(worker_id, SpawnFailureReason::Io(e.to_string())))?;

        let mut argv: Vec<OsString> = vec![
            binary.into(),
            "--worker-id".into(),
            worker_id.to_string().into(),
            "--cache-path".into(),
            self.config.cache_path.clone().into(),
            "--tool".into(),
            self.config.tool.clone().into(),
            "--progress-every".into(),
            self.config.progress_every.to_string().into(),
        ];
        // `=` keeps hyphenated tool arguments from parsing as our own flags.
        for arg in &self.config.tool_args {
            argv.push(format!("--tool-arg={}", arg).into());
        }
        Ok(argv)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        worker_id: WorkerId,
        name: &str,
        events: EventSender,
    ) -> Result<WorkerHandle, SpawnFailure> {
        let argv = self.argv(worker_id)?;
        let options = SpawnOptions {
            env: vec![("RGFLEET_WORKER_NAME".to_string(), name.to_string())],
            stderr_tail_lines: self.config.stderr_tail_lines,
        };
        WorkerProcess::spawn(worker_id, &argv, &options, events)
    }
}
