//! Fleet configuration.

use crate::error::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings shared by the orchestrator and the worker processes it launches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Executable started in worker mode. `None` means the current executable.
    pub worker_binary: Option<PathBuf>,
    /// Search tool invoked by each worker (`<tool> --json <query> <path>`).
    pub tool: String,
    /// Extra arguments placed before the query.
    pub tool_args: Vec<String>,
    /// Directory searched by the workers.
    pub cache_path: PathBuf,
    /// How long a new worker has to send its ready handshake.
    pub init_timeout_ms: u64,
    /// How long shutdown waits for a graceful exit before killing.
    pub shutdown_timeout_ms: u64,
    /// Workers report progress after this many matches.
    pub progress_every: u64,
    /// Number of stderr lines kept for abnormal exit reports.
    pub stderr_tail_lines: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            worker_binary: None,
            tool: "rg".to_string(),
            tool_args: Vec::new(),
            cache_path: PathBuf::from("."),
            init_timeout_ms: 5_000,
            shutdown_timeout_ms: 2_000,
            progress_every: 50,
            stderr_tail_lines: 20,
        }
    }
}

impl FleetConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: FleetConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.tool.trim().is_empty() {
            return Err(FleetError::Config("tool must not be empty".to_string()));
        }
        if self.progress_every == 0 {
            return Err(FleetError::Config(
                "progress_every must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Resolve the worker executable, falling back to the running binary.
    pub fn worker_binary(&self) -> FleetResult<PathBuf> {
        match &self.worker_binary {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    pub fn with_worker_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_binary = Some(path.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = path.into();
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_progress_every(mut self, every: u64) -> Self {
        self.progress_every = every;
        self
    }
}
