pub mod config;
pub mod error;
pub mod orchestrator;
pub mod parsers;
pub mod searchers;
pub mod workers;

// 公開API
pub use config::FleetConfig;
pub use error::{FleetError, FleetResult, IpcError, SpawnFailure, SpawnFailureReason, ToolError};
pub use orchestrator::{aggregate, AggregatedReport, SearchOrchestrator, SearchTicket, WorkerFault, WorkerStats};
pub use parsers::{LineRecordParser, ParseDiagnostic, ParseEvent, Record, StreamDecoder};
pub use searchers::SearchTool;
pub use workers::{ProcessLauncher, WorkerLauncher, WorkerState, WorkerStatus};
