//! Scheduler system — bounded-concurrency batch execution.
//!
//! Core components:
//! - `job` — Job type and per-job outcome
//! - `state` — Phase state machine (Idle → BatchInFlight → Idle/Stopped) and queue bookkeeping
//! - `progress` — Per-batch progress snapshots
//! - `batch` — `BatchScheduler`: dispatch loop, completion routine, terminate

pub mod batch;
pub mod job;
pub mod progress;
pub mod state;

pub use batch::{BatchScheduler, ProgressCallback, SchedulerOptions};
pub use job::{Job, JobOutcome};
pub use progress::{Progress, ProgressSummary};
pub use state::SchedulerPhase;
