//! Error types for the scheduler module

use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Cron expression could not be parsed
    InvalidCron {
        job: String,
        expression: String,
        reason: String,
    },

    /// Job index outside of the job list
    UnknownJob {
        index: usize,
        len: usize,
    },

    /// Tick configuration error
    TickConfigError {
        field: String,
        reason: String,
    },

    /// Pool size of zero passed to partitioning
    EmptyPool,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCron {
                job,
                expression,
                reason,
            } => {
                write!(
                    f,
                    "Invalid cron expression '{}' for job '{}': {}",
                    expression, job, reason
                )
            }
            Self::UnknownJob { index, len } => {
                write!(f, "Unknown job index {} (job list has {} entries)", index, len)
            }
            Self::TickConfigError { field, reason } => {
                write!(f, "Tick config error in '{}': {}", field, reason)
            }
            Self::EmptyPool => write!(f, "Cannot partition work across an empty pool"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    /// Create an invalid cron error
    pub fn invalid_cron(
        job: impl Into<String>,
        expression: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidCron {
            job: job.into(),
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown job error
    pub fn unknown_job(index: usize, len: usize) -> Self {
        Self::UnknownJob { index, len }
    }

    /// Create a tick config error
    pub fn tick_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TickConfigError {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    ///
    /// Only a stray job index is survivable; everything else is a startup error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownJob { .. })
    }
}
