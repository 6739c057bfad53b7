//! Configuration types.

use crate::error::ConfigError;

/// Environment variable overriding `batch_size`.
pub const ENV_BATCH_SIZE: &str = "QPASS_BATCH_SIZE";
/// Environment variable overriding `break_when_error`.
pub const ENV_BREAK_WHEN_ERROR: &str = "QPASS_BREAK_WHEN_ERROR";

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of jobs dispatched together (must be at least 1).
    pub batch_size: usize,
    /// Stop dispatching further batches after the first job failure.
    pub break_when_error: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            break_when_error: false,
        }
    }
}

impl SchedulerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_break_when_error(mut self, break_when_error: bool) -> Self {
        self.break_when_error = break_when_error;
        self
    }

    /// Check the configuration before a scheduler is built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size < 1 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Overlay `QPASS_BATCH_SIZE` / `QPASS_BREAK_WHEN_ERROR` from the process
    /// environment onto this config.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup. Unset keys keep their current value.
    pub fn apply_vars<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = raw.trim().parse().map_err(|e| {
                ConfigError::ParseError(format!("{ENV_BATCH_SIZE}={raw:?}: {e}"))
            })?;
        }

        if let Some(raw) = lookup(ENV_BREAK_WHEN_ERROR) {
            self.break_when_error = parse_bool(&raw).ok_or_else(|| {
                ConfigError::ParseError(format!(
                    "{ENV_BREAK_WHEN_ERROR}={raw:?}: expected true/false"
                ))
            })?;
        }

        self.validate()?;
        Ok(self)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
