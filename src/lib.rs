//! qpass — bounded-concurrency batch job scheduler.

pub mod config;
pub mod error;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{ConfigError, JobFailure};
pub use scheduler::{
    BatchScheduler, Job, JobOutcome, Progress, ProgressSummary, SchedulerOptions, SchedulerPhase,
};

/// Crate version, set at build time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
