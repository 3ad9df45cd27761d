//! Per-worker failures absorbed by the orchestrator.

use crate::workers::protocol::WorkerId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerFault {
    /// The launcher could not start a worker; it was never registered.
    SpawnFailed { name: String, reason: String },
    AbnormalExit {
        worker_id: WorkerId,
        code: Option<i32>,
        signal: Option<i32>,
        stderr_tail: Vec<String>,
    },
    SearchError {
        worker_id: WorkerId,
        request_id: Option<u64>,
        message: String,
    },
    InitTimeout { worker_id: WorkerId },
    ShutdownTimeout { worker_id: WorkerId },
    MalformedMessage { worker_id: WorkerId, reason: String },
}

impl WorkerFault {
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            Self::SpawnFailed { .. } => None,
            Self::AbnormalExit { worker_id, .. }
            | Self::SearchError { worker_id, .. }
            | Self::InitTimeout { worker_id }
            | Self::ShutdownTimeout { worker_id }
            | Self::MalformedMessage { worker_id, .. } => Some(*worker_id),
        }
    }
}

impl std::fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpawnFailed { name, reason } => write!(f, "worker '{}' failed to spawn: {}", name, reason),
            Self::AbnormalExit {
                worker_id,
                code,
                signal,
                ..
            } => match (code, signal) {
                (Some(code), _) => write!(f, "worker {} exited with code {}", worker_id, code),
                (None, Some(signal)) => write!(f, "worker {} killed by signal {}", worker_id, signal),
                (None, None) => write!(f, "worker {} exited abnormally", worker_id),
            },
            Self::SearchError {
                worker_id, message, ..
            } => write!(f, "worker {} search failed: {}", worker_id, message),
            Self::InitTimeout { worker_id } => write!(f, "worker {} never became ready", worker_id),
            Self::ShutdownTimeout { worker_id } => {
                write!(f, "worker {} did not exit in time and was killed", worker_id)
            }
            Self::MalformedMessage { worker_id, reason } => {
                write!(f, "worker {} sent a malformed message: {}", worker_id, reason)
            }
        }
    }
}
