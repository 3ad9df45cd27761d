//! Orchestrator ↔ worker process protocol.
//!
//! Every message is a `{"method": .., "payload": ..}` object carried in one
//! IPC frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Orchestrator-assigned worker identifier.
pub type WorkerId = u32;

/// One search, addressed to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub request_id: u64,
    pub timestamp: DateTime<Utc>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, request_id: u64) -> Self {
        Self {
            query: query.into(),
            request_id,
            timestamp: Utc::now(),
        }
    }
}

/// Orchestrator → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload")]
pub enum OrchestratorMessage {
    /// method: search/request
    #[serde(rename = "search/request")]
    Search(SearchRequest),

    /// method: worker/terminate
    #[serde(rename = "worker/terminate")]
    Terminate,
}

/// Worker → orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload")]
pub enum SearchResponse {
    /// method: worker/ready
    #[serde(rename = "worker/ready")]
    Ready { worker_id: WorkerId },

    /// method: search/progress
    #[serde(rename = "search/progress")]
    Progress {
        worker_id: WorkerId,
        request_id: u64,
        records_so_far: u64,
        matches_so_far: u64,
        bytes_processed: u64,
    },

    /// method: search/complete
    #[serde(rename = "search/complete")]
    Complete {
        worker_id: WorkerId,
        request_id: u64,
        matches_found: u64,
        bytes_processed: u64,
        elapsed_ms: f64,
    },

    /// method: search/error
    #[serde(rename = "search/error")]
    Error {
        worker_id: WorkerId,
        request_id: Option<u64>,
        message: String,
    },
}

impl SearchResponse {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            Self::Ready { worker_id }
            | Self::Progress { worker_id, .. }
            | Self::Complete { worker_id, .. }
            | Self::Error { worker_id, .. } => *worker_id,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "worker/ready",
            Self::Progress { .. } => "search/progress",
            Self::Complete { .. } => "search/complete",
            Self::Error { .. } => "search/error",
        }
    }
}

impl OrchestratorMessage {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Search(_) => "search/request",
            Self::Terminate => "worker/terminate",
        }
    }
}
