//! Result types reported by each pass.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Why a worker stopped before draining its shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RetireReason {
    /// The credential's quota is spent for today.
    QuotaExhausted(String),
    /// The credential or backend was rejected outright.
    Fatal(String),
}

impl std::fmt::Display for RetireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetireReason::QuotaExhausted(d) => write!(f, "quota exhausted ({d})"),
            RetireReason::Fatal(d) => write!(f, "credential rejected ({d})"),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerEnd {
    /// Every unit of the shard was attempted.
    Finished,
    /// Stopped early; the rest of the shard stays pending for a later run.
    Retired { reason: RetireReason },
    /// The worker task panicked. Siblings were unaffected.
    Crashed { detail: String },
}

/// Per-worker tallies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub assigned: usize,
    /// Artifacts written by this worker.
    pub completed: usize,
    /// Units found already complete when their turn came.
    pub skipped: usize,
    /// Units that failed transiently and remain pending.
    pub failed: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub end: WorkerEnd,
}

impl WorkerReport {
    pub fn new(worker_id: usize, assigned: usize) -> Self {
        Self {
            worker_id,
            assigned,
            completed: 0,
            skipped: 0,
            failed: 0,
            input_tokens: 0,
            output_tokens: 0,
            end: WorkerEnd::Finished,
        }
    }

    pub fn retired_early(&self) -> bool {
        matches!(self.end, WorkerEnd::Retired { .. })
    }
}

/// Summary of one transcription run over the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub pending: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub retired_workers: usize,
    pub crashed_workers: usize,
    pub duration_ms: u64,
    pub workers: Vec<WorkerReport>,
}

impl RunSummary {
    pub fn from_workers(pending: usize, workers: Vec<WorkerReport>, duration_ms: u64) -> Self {
        Self {
            pending,
            completed: workers.iter().map(|w| w.completed).sum(),
            skipped: workers.iter().map(|w| w.skipped).sum(),
            failed: workers.iter().map(|w| w.failed).sum(),
            retired_workers: workers.iter().filter(|w| w.retired_early()).count(),
            crashed_workers: workers
                .iter()
                .filter(|w| matches!(w.end, WorkerEnd::Crashed { .. }))
                .count(),
            duration_ms,
            workers,
        }
    }

    /// Units still without an artifact after this run.
    pub fn remaining(&self) -> usize {
        self.pending.saturating_sub(self.completed + self.skipped)
    }
}

/// Summary of the orientation pass over all books.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub books: usize,
    /// Images already judged by an earlier run.
    pub cached: usize,
    pub checked_ok: usize,
    pub rotated: usize,
    pub skipped_error: usize,
    /// Ledgers rewritten because new entries were added.
    pub ledgers_written: usize,
}

impl AuditSummary {
    pub fn examined(&self) -> usize {
        self.checked_ok + self.rotated + self.skipped_error
    }
}

/// Summary of PDF ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub documents: usize,
    pub already_ingested: usize,
    pub pages_written: usize,
    pub failed: Vec<String>,
}

/// Summary of the coordinate-overlay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySummary {
    pub pending: usize,
    pub written: usize,
    pub failed: usize,
}

/// Everything one `run_all` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub ingest: IngestSummary,
    pub transcription: RunSummary,
    /// `None` when the orientation probe was unavailable.
    pub audit: Option<AuditSummary>,
    pub books: usize,
    pub pages: usize,
    pub index_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_aggregates_workers() {
        let mut a = WorkerReport::new(1, 4);
        a.completed = 4;
        let mut b = WorkerReport::new(2, 3);
        b.completed = 1;
        b.end = WorkerEnd::Retired {
            reason: RetireReason::QuotaExhausted("429".into()),
        };
        let mut c = WorkerReport::new(3, 3);
        c.completed = 2;
        c.failed = 1;

        let s = RunSummary::from_workers(10, vec![a, b, c], 1200);
        assert_eq!(s.completed, 7);
        assert_eq!(s.failed, 1);
        assert_eq!(s.retired_workers, 1);
        assert_eq!(s.remaining(), 3);
    }

    #[test]
    fn retire_reason_serialises_tagged() {
        let end = WorkerEnd::Retired {
            reason: RetireReason::QuotaExhausted("HTTP 429".into()),
        };
        let v = serde_json::to_value(&end).unwrap();
        assert_eq!(v["state"], "retired");
        assert_eq!(v["reason"]["kind"], "quota_exhausted");
    }
}
