//! 集計レポート
//!
//! ワーカー状態のスナップショットから毎回計算し直す。キャッシュは持たない。

use crate::workers::protocol::WorkerId;
use crate::workers::state::{WorkerState, WorkerStatus};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub matches_found: u64,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedReport {
    pub total_matches: u64,
    pub stats: Vec<WorkerStats>,
}

/// Fold worker states into a report. Failed workers are listed in `stats`
/// but contribute nothing to `total_matches`.
pub fn aggregate<'a, I>(workers: I) -> AggregatedReport
where
    I: IntoIterator<Item = &'a WorkerState>,
{
    let mut report = AggregatedReport::default();
    for worker in workers {
        if worker.status != WorkerStatus::Failed {
            report.total_matches += worker.matches_found;
        }
        report.stats.push(WorkerStats {
            worker_id: worker.id,
            matches_found: worker.matches_found,
            elapsed_ms: worker.elapsed_ms,
        });
    }
    report
}
