//! Batch scheduler — bounded-concurrency dispatch with per-batch progress.
//!
//! Jobs are dispatched in batches of at most `batch_size`. Every job of a
//! batch runs as its own tokio task; the next batch is only taken once the
//! whole batch has settled and its progress report has been delivered.
//! One driver task per run chains the batches; it exits when the queue is
//! empty or fail-fast has latched.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, JobFailure};
use crate::scheduler::job::{Job, JobOutcome};
use crate::scheduler::progress::Progress;
use crate::scheduler::state::{QueueState, SchedulerPhase};

/// Callback invoked once per completed batch.
///
/// Receives a handle to the scheduler so it can `add` or `terminate`.
pub type ProgressCallback<T, E> = Box<dyn Fn(Progress<T, E>, &BatchScheduler<T, E>) + Send + Sync>;

/// Construction options for [`BatchScheduler`].
pub struct SchedulerOptions<T, E> {
    config: SchedulerConfig,
    on_progress: Option<ProgressCallback<T, E>>,
}

impl<T, E> SchedulerOptions<T, E> {
    pub fn new() -> Self {
        Self::from_config(SchedulerConfig::default())
    }

    pub fn from_config(config: SchedulerConfig) -> Self {
        Self {
            config,
            on_progress: None,
        }
    }

    /// Maximum number of jobs running concurrently per batch.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Stop dispatching further batches after the first failure.
    pub fn break_when_error(mut self, break_when_error: bool) -> Self {
        self.config.break_when_error = break_when_error;
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(Progress<T, E>, &BatchScheduler<T, E>) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }
}

impl<T, E> Default for SchedulerOptions<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for SchedulerOptions<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerOptions")
            .field("config", &self.config)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

struct Shared<T, E> {
    config: SchedulerConfig,
    on_progress: Option<ProgressCallback<T, E>>,
    state: Mutex<QueueState<T, E>>,
    runtime: Handle,
}

/// Bounded-concurrency batch scheduler.
///
/// Cheap to clone; clones share the same queue.
pub struct BatchScheduler<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for BatchScheduler<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> BatchScheduler<T, E> {
    fn state(&self) -> MutexGuard<'_, QueueState<T, E>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, E> fmt::Debug for BatchScheduler<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("BatchScheduler")
            .field("config", &self.shared.config)
            .field("phase", &state.phase())
            .field("pending", &state.pending_len())
            .field("active", &state.active_count())
            .finish()
    }
}

impl<T, E> BatchScheduler<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create a scheduler. Must be called from within a tokio runtime.
    pub fn new(options: SchedulerOptions<T, E>) -> Result<Self, ConfigError> {
        let SchedulerOptions {
            config,
            on_progress,
        } = options;
        config.validate()?;

        let runtime = Handle::try_current().map_err(|_| ConfigError::MissingRuntime)?;

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::new(config.batch_size, config.break_when_error)),
                config,
                on_progress,
                runtime,
            }),
        })
    }

    /// Create a scheduler without a progress callback.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, ConfigError> {
        Self::new(SchedulerOptions::from_config(config))
    }

    /// Crate version string.
    pub fn version(&self) -> &'static str {
        crate::VERSION
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Enqueue jobs in order and dispatch a batch if the scheduler is idle.
    pub fn add<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = Job<T, E>>,
    {
        let batch = {
            let mut state = self.state();
            let before = state.pending_len();
            state.enqueue(jobs);
            let added = state.pending_len() - before;
            if added == 0 {
                return;
            }
            debug!(added, pending = state.pending_len(), phase = %state.phase(), "Jobs enqueued");
            state.try_dispatch()
        };

        if let Some(batch) = batch {
            let driver = self.clone();
            self.shared.runtime.spawn(driver.drive(batch));
        }
    }

    /// Enqueue a single job.
    pub fn add_one(&self, job: Job<T, E>) {
        self.add(std::iter::once(job));
    }

    /// Drop every job that has not been dispatched yet.
    ///
    /// The in-flight batch is left alone: it still completes and reports.
    /// Returns the number of discarded jobs.
    pub fn terminate(&self) -> usize {
        let discarded = self.state().clear_pending();
        if discarded > 0 {
            info!(discarded, "Terminated: pending jobs discarded");
        }
        discarded
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.state().phase()
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending_len()
    }

    /// Jobs of the current batch that have not settled yet.
    pub fn active_count(&self) -> usize {
        self.state().active_count()
    }

    /// Whether fail-fast has latched.
    pub fn is_stopped(&self) -> bool {
        self.state().is_stopped()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerPhase> {
        self.state().subscribe()
    }

    /// Wait until no batch is in flight. Returns the phase reached.
    pub async fn wait_idle(&self) -> SchedulerPhase {
        let mut rx = self.subscribe();
        match rx.wait_for(|phase| !phase.is_busy()).await {
            Ok(phase) => *phase,
            Err(_) => self.phase(),
        }
    }

    /// Driver loop: run a batch, report it, take the next one.
    async fn drive(self, mut batch: Vec<Job<T, E>>) {
        loop {
            let Some(completed) = self.run_batch(batch).await else {
                let mut state = self.state();
                state.abandon_batch();
                error!(phase = %state.phase(), "Batch finished without a complete report; batch abandoned");
                return;
            };

            // Counts are taken from the queue as it stands right before the callback.
            let progress = self.state().progress(completed);
            self.report(progress);

            let next = self.state().next_batch();
            match next {
                Some(next) => batch = next,
                None => {
                    debug!(phase = %self.phase(), "Queue drained");
                    return;
                }
            }
        }
    }

    /// Launch every job of the batch concurrently and wait for all to settle.
    /// Returns the outcomes in dispatch order.
    async fn run_batch(&self, batch: Vec<Job<T, E>>) -> Option<Vec<JobOutcome<T, E>>> {
        debug!(size = batch.len(), "Dispatching batch");

        let settlements = batch.into_iter().enumerate().map(|(index, job)| {
            let job_id = job.id();
            let handle = self.shared.runtime.spawn(async move { job.start().await });

            async move {
                let outcome = settled_outcome(job_id, handle.await);

                if outcome.is_err() {
                    warn!(job_id = %job_id, index, "Job failed");
                } else {
                    debug!(job_id = %job_id, index, "Job settled");
                }

                self.state().settle(index, outcome)
            }
        });

        join_all(settlements).await.into_iter().flatten().next()
    }

    fn report(&self, progress: Progress<T, E>) {
        info!(
            batch = progress.batch,
            succeeded = progress.succeeded(),
            failed = progress.failed(),
            batches_remaining = progress.batches_remaining,
            items_remaining = progress.items_remaining,
            "Batch complete"
        );

        let Some(callback) = self.shared.on_progress.as_ref() else {
            return;
        };

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(progress, self)));
        if let Err(payload) = result {
            error!(message = %panic_message(payload), "Progress callback panicked");
        }
    }
}

/// Convert a job task's join result into the outcome recorded in its slot.
fn settled_outcome<T, E>(job_id: Uuid, joined: Result<Result<T, E>, JoinError>) -> JobOutcome<T, E> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(JobFailure::Failed(e)),
        Err(join_err) if join_err.is_panic() => Err(JobFailure::Panicked {
            job_id,
            message: panic_message(join_err.into_panic()),
        }),
        Err(_) => Err(JobFailure::Cancelled { job_id }),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
