//! Error types for qpass.

use uuid::Uuid;

/// Configuration-related errors.
///
/// Returned synchronously from construction; nothing is partially applied.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("BatchScheduler must be created inside a tokio runtime")]
    MissingRuntime,
}

/// Why a job did not produce a value.
///
/// Job failures never propagate out of the scheduler. They are captured
/// into the batch's `completed` snapshot.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure<E> {
    /// The job resolved with its own error.
    #[error("{0}")]
    Failed(E),

    /// The job body panicked before settling.
    #[error("Job {job_id} panicked: {message}")]
    Panicked { job_id: Uuid, message: String },

    /// The job's task was cancelled before settling, e.g. at runtime shutdown.
    #[error("Job {job_id} was cancelled")]
    Cancelled { job_id: Uuid },
}

impl<E> JobFailure<E> {
    /// The job's own error, if it returned one.
    pub fn as_failed(&self) -> Option<&E> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Panicked { .. } | Self::Cancelled { .. } => None,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }
}
