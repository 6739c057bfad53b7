//! Progress snapshots delivered once per completed batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobOutcome;

/// Report for one completed batch.
#[derive(Debug)]
pub struct Progress<T, E> {
    /// 1-based sequence number of the batch.
    pub batch: u64,
    /// Batches still to run, computed from the queue after this batch's removal.
    pub batches_remaining: usize,
    /// Jobs still queued.
    pub items_remaining: usize,
    /// Outcomes in dispatch order, regardless of settlement order.
    pub completed: Vec<JobOutcome<T, E>>,
    /// When the last job of the batch settled.
    pub finished_at: DateTime<Utc>,
}

impl<T, E> Progress<T, E> {
    pub fn succeeded(&self) -> usize {
        self.completed.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.completed.len() - self.succeeded()
    }

    /// No work left in the queue after this batch.
    pub fn is_final(&self) -> bool {
        self.items_remaining == 0
    }

    /// Counts-only view, independent of the job value types.
    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            batch: self.batch,
            batches_remaining: self.batches_remaining,
            items_remaining: self.items_remaining,
            succeeded: self.succeeded(),
            failed: self.failed(),
            finished_at: self.finished_at,
        }
    }
}

/// Serializable summary of a [`Progress`] report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub batch: u64,
    pub batches_remaining: usize,
    pub items_remaining: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub finished_at: DateTime<Utc>,
}
