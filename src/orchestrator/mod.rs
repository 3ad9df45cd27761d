//! 検索オーケストレーター
//!
//! 複数のワーカープロセスを起動・管理し、検索リクエストを配信して結果を集計する。
//! ワーカー単位の障害はここで吸収され、呼び出し側に見えるのはワーカーが一つも
//! 登録されていない場合のエラーだけ。

pub mod aggregator;
pub mod fault;
pub mod search_orchestrator;

pub use aggregator::{aggregate, AggregatedReport, WorkerStats};
pub use fault::WorkerFault;
pub use search_orchestrator::{SearchOrchestrator, SearchTicket};
