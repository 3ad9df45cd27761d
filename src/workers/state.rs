//! Per-worker bookkeeping owned by the orchestrator.

use crate::workers::protocol::WorkerId;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Spawning,
    Ready,
    Searching,
    Completed,
    Failed,
    Terminated,
}

impl WorkerStatus {
    /// `Failed` and `Terminated` are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    /// Whether a worker in this state can take a new search.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Ready | Self::Completed)
    }

    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        match (self, next) {
            (Failed | Terminated, _) => false,
            (_, Failed | Terminated) => true,
            (Spawning, Ready) => true,
            (Ready | Completed, Searching) => true,
            (Searching, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Searching => "searching",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerState {
    pub id: WorkerId,
    pub name: String,
    pub status: WorkerStatus,
    pub matches_found: u64,
    pub bytes_processed: u64,
    pub records_seen: u64,
    pub elapsed_ms: f64,
    pub last_update: DateTime<Utc>,
    /// Request currently running on the worker.
    pub current_request: Option<u64>,
    pub last_error: Option<String>,
}

impl WorkerState {
    pub fn new(id: WorkerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: WorkerStatus::Spawning,
            matches_found: 0,
            bytes_processed: 0,
            records_seen: 0,
            elapsed_ms: 0.0,
            last_update: Utc::now(),
            current_request: None,
            last_error: None,
        }
    }

    /// Move to `next` if the state machine allows it. Illegal moves are
    /// logged and ignored.
    pub fn transition(&mut self, next: WorkerStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            log::warn!(
                "Worker {} ignoring illegal transition {} -> {}",
                self.id,
                self.status,
                next
            );
            return false;
        }
        log::debug!("Worker {}: {} -> {}", self.id, self.status, next);
        self.status = next;
        self.touch();
        true
    }

    /// Start a new search: counters describe the latest search only.
    pub fn begin_search(&mut self, request_id: u64) -> bool {
        if !self.transition(WorkerStatus::Searching) {
            return false;
        }
        self.current_request = Some(request_id);
        self.matches_found = 0;
        self.bytes_processed = 0;
        self.records_seen = 0;
        self.elapsed_ms = 0.0;
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.transition(WorkerStatus::Failed) {
            self.current_request = None;
        }
        self.last_error = Some(message);
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}
