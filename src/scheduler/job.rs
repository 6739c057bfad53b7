//! Job type: an opaque zero-argument async operation.

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::JobFailure;

/// The settled result of a job, as reported in a batch snapshot.
pub type JobOutcome<T, E> = Result<T, JobFailure<E>>;

type JobFn<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;

/// A unit of work handed to the scheduler.
///
/// The closure is not invoked until the job's batch is dispatched.
pub struct Job<T, E> {
    id: Uuid,
    run: JobFn<T, E>,
}

impl<T, E> Job<T, E> {
    /// Wrap an async closure as a job.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            run: Box::new(move || Box::pin(f())),
        }
    }

    /// Identifier used in logs and panic reports.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Consume the job and start its operation.
    pub(crate) fn start(self) -> BoxFuture<'static, Result<T, E>> {
        (self.run)()
    }
}

impl<T, E> fmt::Debug for Job<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish_non_exhaustive()
    }
}
