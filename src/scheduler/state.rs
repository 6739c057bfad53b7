//! Scheduler state machine.
//!
//! `QueueState` holds everything the engine mutates: the pending queue, the
//! in-flight batch's result slots, the fail-fast latch and the phase. It is
//! only ever touched behind the scheduler's mutex, and never across an await.

use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::job::{Job, JobOutcome};
use super::progress::Progress;

/// Coarse state of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    /// No batch running; `add` will dispatch.
    Idle,
    /// A batch is running or its progress report is being delivered.
    BatchInFlight,
    /// Fail-fast fired. No batch will ever be dispatched again.
    Stopped,
}

impl SchedulerPhase {
    /// Check if this phase allows transitioning to another phase.
    pub fn can_transition_to(&self, target: SchedulerPhase) -> bool {
        use SchedulerPhase::*;

        matches!(
            (self, target),
            (Idle, BatchInFlight)
                | (BatchInFlight, BatchInFlight)
                | (BatchInFlight, Idle)
                | (BatchInFlight, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::BatchInFlight)
    }
}

impl std::fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::BatchInFlight => "batch_in_flight",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Mutable engine state.
pub(crate) struct QueueState<T, E> {
    batch_size: usize,
    break_when_error: bool,
    pending: VecDeque<Job<T, E>>,
    slots: Vec<Option<JobOutcome<T, E>>>,
    active_count: usize,
    stop_processing: bool,
    batches_completed: u64,
    phase: SchedulerPhase,
    phase_tx: watch::Sender<SchedulerPhase>,
}

impl<T, E> QueueState<T, E> {
    pub(crate) fn new(batch_size: usize, break_when_error: bool) -> Self {
        let (phase_tx, _rx) = watch::channel(SchedulerPhase::Idle);
        Self {
            batch_size,
            break_when_error,
            pending: VecDeque::new(),
            slots: Vec::new(),
            active_count: 0,
            stop_processing: false,
            batches_completed: 0,
            phase: SchedulerPhase::Idle,
            phase_tx,
        }
    }

    pub(crate) fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SchedulerPhase> {
        self.phase_tx.subscribe()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active_count
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop_processing
    }

    /// Append jobs to the tail of the queue. Stored even after fail-fast.
    pub(crate) fn enqueue(&mut self, jobs: impl IntoIterator<Item = Job<T, E>>) {
        self.pending.extend(jobs);
    }

    /// Drop every undispatched job. Returns how many were discarded.
    pub(crate) fn clear_pending(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    /// Dispatch entry point for callers outside the driver loop: refuses while
    /// a batch (or its report) is in flight.
    pub(crate) fn try_dispatch(&mut self) -> Option<Vec<Job<T, E>>> {
        if self.phase.is_busy() {
            return None;
        }
        let batch = self.take_batch()?;
        self.transition_to(SchedulerPhase::BatchInFlight);
        Some(batch)
    }

    /// Dispatch entry point for the driver after a batch report has been
    /// delivered. Settles the phase to `Idle`/`Stopped` when nothing is taken.
    pub(crate) fn next_batch(&mut self) -> Option<Vec<Job<T, E>>> {
        match self.take_batch() {
            Some(batch) => {
                self.transition_to(SchedulerPhase::BatchInFlight);
                Some(batch)
            }
            None => {
                let target = if self.stop_processing {
                    SchedulerPhase::Stopped
                } else {
                    SchedulerPhase::Idle
                };
                self.transition_to(target);
                None
            }
        }
    }

    fn take_batch(&mut self) -> Option<Vec<Job<T, E>>> {
        if self.stop_processing || self.pending.is_empty() || self.active_count > 0 {
            return None;
        }

        let count = self.batch_size.min(self.pending.len());
        let batch: Vec<_> = self.pending.drain(..count).collect();
        self.active_count = batch.len();
        self.slots = std::iter::repeat_with(|| None).take(batch.len()).collect();
        Some(batch)
    }

    /// Record one job's settlement. Returns the batch's outcomes, in
    /// dispatch order, once the last slot is written.
    pub(crate) fn settle(
        &mut self,
        index: usize,
        outcome: JobOutcome<T, E>,
    ) -> Option<Vec<JobOutcome<T, E>>> {
        let failed = outcome.is_err();

        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(outcome);
                self.active_count -= 1;
            }
            _ => {
                tracing::error!(index, "Settlement for unknown or already written slot ignored");
                return None;
            }
        }

        // Every failure clears the queue, including jobs added after the latch.
        if failed && self.break_when_error {
            let first = !self.stop_processing;
            let discarded = self.clear_pending();
            self.stop_processing = true;
            if first {
                tracing::warn!(
                    index,
                    discarded,
                    "Job failed with break_when_error set; no further batches will run"
                );
            }
        }

        if self.active_count != 0 {
            return None;
        }

        Some(
            std::mem::take(&mut self.slots)
                .into_iter()
                .flatten()
                .collect(),
        )
    }

    /// Build the report for a completed batch from the queue as it stands now.
    pub(crate) fn progress(&mut self, completed: Vec<JobOutcome<T, E>>) -> Progress<T, E> {
        self.batches_completed += 1;
        Progress {
            batch: self.batches_completed,
            batches_remaining: self.pending.len().div_ceil(self.batch_size),
            items_remaining: self.pending.len(),
            completed,
            finished_at: Utc::now(),
        }
    }

    /// Drop a batch whose bookkeeping cannot complete and leave the in-flight
    /// phase, so later `add` calls can dispatch again.
    pub(crate) fn abandon_batch(&mut self) {
        self.slots.clear();
        self.active_count = 0;
        let target = if self.stop_processing {
            SchedulerPhase::Stopped
        } else {
            SchedulerPhase::Idle
        };
        if self.phase != target {
            self.transition_to(target);
        }
    }

    fn transition_to(&mut self, target: SchedulerPhase) {
        debug_assert!(
            self.phase.can_transition_to(target),
            "Cannot transition from {} to {}",
            self.phase,
            target
        );
        self.phase = target;
        self.phase_tx.send_replace(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobFailure;

    fn job(n: u32) -> Job<u32, String> {
        Job::new(move || async move { Ok(n) })
    }

    fn state_with(batch_size: usize, break_when_error: bool, jobs: u32) -> QueueState<u32, String> {
        let mut state = QueueState::new(batch_size, break_when_error);
        state.enqueue((0..jobs).map(job));
        state
    }

    fn fail(msg: &str) -> JobOutcome<u32, String> {
        Err(JobFailure::Failed(msg.to_string()))
    }

    /// Settle the last outstanding job and build the batch report.
    fn finish(state: &mut QueueState<u32, String>, index: usize, outcome: JobOutcome<u32, String>) -> Progress<u32, String> {
        let completed = state.settle(index, outcome).expect("batch should be complete");
        state.progress(completed)
    }

    #[test]
    fn phase_transitions_valid() {
        assert!(SchedulerPhase::Idle.can_transition_to(SchedulerPhase::BatchInFlight));
        assert!(SchedulerPhase::BatchInFlight.can_transition_to(SchedulerPhase::Idle));
        assert!(SchedulerPhase::BatchInFlight.can_transition_to(SchedulerPhase::BatchInFlight));
        assert!(SchedulerPhase::BatchInFlight.can_transition_to(SchedulerPhase::Stopped));
    }

    #[test]
    fn phase_transitions_invalid() {
        assert!(!SchedulerPhase::Idle.can_transition_to(SchedulerPhase::Stopped));
        assert!(!SchedulerPhase::Stopped.can_transition_to(SchedulerPhase::Idle));
        assert!(!SchedulerPhase::Stopped.can_transition_to(SchedulerPhase::BatchInFlight));
        assert!(SchedulerPhase::Stopped.is_terminal());
        assert!(!SchedulerPhase::Idle.is_busy());
    }

    #[test]
    fn phase_display_and_serde() {
        assert_eq!(SchedulerPhase::BatchInFlight.to_string(), "batch_in_flight");
        let json = serde_json::to_string(&SchedulerPhase::Stopped).unwrap();
        assert_eq!(json, "\"stopped\"");
        let parsed: SchedulerPhase = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, SchedulerPhase::Stopped);
    }

    #[test]
    fn dispatch_takes_prefix_up_to_batch_size() {
        let mut state = state_with(3, false, 7);
        let batch = state.try_dispatch().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(state.active_count(), 3);
        assert_eq!(state.pending_len(), 4);
        assert_eq!(state.phase(), SchedulerPhase::BatchInFlight);
    }

    #[test]
    fn dispatch_suppressed_while_in_flight() {
        let mut state = state_with(2, false, 5);
        assert!(state.try_dispatch().is_some());
        assert!(state.try_dispatch().is_none());
        assert_eq!(state.pending_len(), 3);
    }

    #[test]
    fn dispatch_on_empty_queue_is_noop() {
        let mut state = state_with(2, false, 0);
        assert!(state.try_dispatch().is_none());
        assert_eq!(state.phase(), SchedulerPhase::Idle);
    }

    #[test]
    fn report_only_after_last_slot() {
        let mut state = state_with(3, false, 7);
        state.try_dispatch().unwrap();

        assert!(state.settle(2, Ok(2)).is_none());
        assert!(state.settle(0, Ok(0)).is_none());
        let progress = finish(&mut state, 1, Ok(1));

        let values: Vec<u32> = progress.completed.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 1, 2]);
        assert_eq!(progress.batch, 1);
        assert_eq!(progress.items_remaining, 4);
        assert_eq!(progress.batches_remaining, 2);
        assert_eq!(state.active_count(), 0);
    }

    #[test]
    fn double_settle_ignored() {
        let mut state = state_with(2, false, 2);
        state.try_dispatch().unwrap();
        assert!(state.settle(0, Ok(0)).is_none());
        assert!(state.settle(0, Ok(9)).is_none());
        assert_eq!(state.active_count(), 1);
        assert!(state.settle(5, Ok(9)).is_none());
        let progress = finish(&mut state, 1, Ok(1));
        assert_eq!(progress.completed.len(), 2);
    }

    #[test]
    fn last_batch_may_be_short() {
        let mut state = state_with(3, false, 4);
        state.try_dispatch().unwrap();
        state.settle(0, Ok(0));
        state.settle(1, Ok(1));
        let first = finish(&mut state, 2, Ok(2));
        assert_eq!(first.items_remaining, 1);
        let batch = state.next_batch().unwrap();
        assert_eq!(batch.len(), 1);
        let progress = finish(&mut state, 0, Ok(3));
        assert_eq!(progress.batch, 2);
        assert_eq!(progress.items_remaining, 0);
        assert_eq!(progress.batches_remaining, 0);
        assert!(state.next_batch().is_none());
        assert_eq!(state.phase(), SchedulerPhase::Idle);
    }

    #[test]
    fn failure_without_fail_fast_keeps_queue() {
        let mut state = state_with(2, false, 4);
        state.try_dispatch().unwrap();
        state.settle(0, fail("nope"));
        let progress = finish(&mut state, 1, Ok(1));
        assert_eq!(progress.failed(), 1);
        assert_eq!(progress.items_remaining, 2);
        assert!(!state.is_stopped());
    }

    #[test]
    fn fail_fast_clears_queue_before_batch_finishes() {
        let mut state = state_with(2, true, 3);
        state.try_dispatch().unwrap();

        assert!(state.settle(1, fail("boom")).is_none());
        assert!(state.is_stopped());
        assert_eq!(state.pending_len(), 0);

        let progress = finish(&mut state, 0, Ok(0));
        assert!(progress.completed[0].is_ok());
        assert!(progress.completed[1].is_err());
        assert_eq!(progress.items_remaining, 0);
        assert_eq!(progress.batches_remaining, 0);

        assert!(state.next_batch().is_none());
        assert_eq!(state.phase(), SchedulerPhase::Stopped);
    }

    #[test]
    fn stopped_state_stores_but_never_dispatches() {
        let mut state = state_with(1, true, 1);
        state.try_dispatch().unwrap();
        finish(&mut state, 0, fail("boom"));
        state.next_batch();

        state.enqueue((0..2).map(job));
        assert_eq!(state.pending_len(), 2);
        assert!(state.try_dispatch().is_none());
        assert_eq!(state.phase(), SchedulerPhase::Stopped);
    }

    #[test]
    fn clear_pending_leaves_in_flight_batch() {
        let mut state = state_with(2, false, 5);
        state.try_dispatch().unwrap();
        assert_eq!(state.clear_pending(), 3);
        assert!(!state.is_stopped());

        state.settle(0, Ok(0));
        let progress = finish(&mut state, 1, Ok(1));
        assert_eq!(progress.items_remaining, 0);
        assert!(state.next_batch().is_none());
        assert_eq!(state.phase(), SchedulerPhase::Idle);
    }

    #[test]
    fn phase_changes_are_published() {
        let mut state = state_with(1, false, 1);
        let rx = state.subscribe();
        state.try_dispatch().unwrap();
        assert_eq!(*rx.borrow(), SchedulerPhase::BatchInFlight);
        finish(&mut state, 0, Ok(0));
        state.next_batch();
        assert_eq!(*rx.borrow(), SchedulerPhase::Idle);
    }

    #[test]
    fn fail_fast_clears_jobs_added_after_the_latch() {
        let mut state = state_with(3, true, 3);
        state.try_dispatch().unwrap();

        assert!(state.settle(0, fail("first")).is_none());
        assert!(state.is_stopped());

        // Added while the failing batch is still running.
        state.enqueue((10..12).map(job));
        assert_eq!(state.pending_len(), 2);

        assert!(state.settle(1, fail("second")).is_none());
        assert_eq!(state.pending_len(), 0);

        let progress = finish(&mut state, 2, Ok(2));
        assert_eq!(progress.items_remaining, 0);
        assert_eq!(progress.batches_remaining, 0);
    }

    #[test]
    fn report_counts_follow_queue_at_report_time() {
        let mut state = state_with(2, false, 6);
        state.try_dispatch().unwrap();
        state.settle(0, Ok(0));
        let completed = state.settle(1, Ok(1)).unwrap();

        // Queue changes between the last settlement and the report.
        assert_eq!(state.clear_pending(), 4);
        let progress = state.progress(completed);
        assert_eq!(progress.items_remaining, 0);
        assert_eq!(progress.batches_remaining, 0);
        assert_eq!(progress.completed.len(), 2);
    }

    #[test]
    fn abandoned_batch_returns_to_idle_and_can_dispatch_again() {
        let mut state = state_with(2, false, 4);
        state.try_dispatch().unwrap();
        state.settle(0, Ok(0));

        state.abandon_batch();
        assert_eq!(state.phase(), SchedulerPhase::Idle);
        assert_eq!(state.active_count(), 0);

        let batch = state.try_dispatch().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(state.phase(), SchedulerPhase::BatchInFlight);
    }

    #[test]
    fn abandoned_batch_after_fail_fast_is_stopped() {
        let mut state = state_with(2, true, 4);
        state.try_dispatch().unwrap();
        state.settle(0, fail("boom"));

        state.abandon_batch();
        assert_eq!(state.phase(), SchedulerPhase::Stopped);
        assert!(state.try_dispatch().is_none());
    }
}
