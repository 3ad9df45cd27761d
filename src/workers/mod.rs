//! ワーカープロセス
//!
//! 各ワーカーは独立したプロセスとして動作し、stdin/stdout上のフレーム化JSONで
//! オーケストレーターと通信する。

pub mod ipc;
pub mod launcher;
pub mod process;
pub mod protocol;
pub mod search_worker;
pub mod state;

pub use launcher::{ProcessLauncher, WorkerLauncher};
pub use process::{
    EventSender, KillSignal, SpawnOptions, WorkerEvent, WorkerExit, WorkerHandle, WorkerProcess,
};
pub use protocol::{OrchestratorMessage, SearchRequest, SearchResponse, WorkerId};
pub use search_worker::{run_worker, WorkerSettings};
pub use state::{WorkerState, WorkerStatus};
