//! Error types shared across the fleet.
//!
//! Per-worker failures never reach the caller as `FleetError`; the orchestrator
//! absorbs them into worker state and its diagnostics list. `FleetError` is what
//! remains for the caller: a dead orchestrator or a fleet with no workers.

use std::path::PathBuf;

/// Result alias used by the public API.
pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("no workers registered")]
    NoWorkersRegistered,

    #[error("orchestrator is no longer running")]
    OrchestratorClosed,

    #[error("worker {0} channel is closed")]
    WorkerUnavailable(u32),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a worker process could not be started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnFailureReason {
    #[error("binary not found: {binary} ({message})")]
    BinaryNotFound { binary: PathBuf, message: String },

    #[error("empty argv")]
    EmptyArgv,

    #[error("failed to spawn: {0}")]
    Io(String),

    #[error("child stdio not captured: {0}")]
    MissingPipe(&'static str),
}

/// Returned by the process wrapper instead of a handle when spawning fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("worker {worker_id} failed to spawn: {reason}")]
pub struct SpawnFailure {
    pub worker_id: u32,
    pub reason: SpawnFailureReason,
}

impl SpawnFailure {
    pub fn new(worker_id: u32, reason: SpawnFailureReason) -> Self {
        Self { worker_id, reason }
    }

    pub fn is_binary_not_found(&self) -> bool {
        matches!(self.reason, SpawnFailureReason::BinaryNotFound { .. })
    }
}

/// Framing errors on an IPC channel.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected Content-Length header, got: {0}")]
    MissingHeader(String),

    #[error("invalid Content-Length: {0}")]
    InvalidLength(String),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("frame body is not valid UTF-8")]
    InvalidUtf8,
}

/// Failures while running the external search tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("search tool not found: {binary} ({message})")]
    BinaryNotFound { binary: PathBuf, message: String },

    #[error("failed to spawn search tool: {0}")]
    SpawnFailed(std::io::Error),

    #[error("search tool stdout not available")]
    StdoutNotAvailable,

    #[error("failed to read search tool output: {0}")]
    ReadFailed(std::io::Error),

    #[error("failed to wait for search tool: {0}")]
    WaitFailed(std::io::Error),
}
