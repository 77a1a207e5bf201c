//! Unified error handling for the forkline crate
//!
//! This module provides a unified error type that consolidates the
//! domain-specific errors into a single `Error` enum, while keeping the
//! domain errors usable on their own.
//!
//! # Architecture
//!
//! - [`ForklineErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use forkline::error::{Error, ForklineErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = err.category().description(), "{err}");
//!     } else {
//!         tracing::error!("Fatal error: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::ipc::IpcError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::supervisor::error::SupervisorError;

/// Common trait for forkline error types
pub trait ForklineErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration and validation errors
    Config,
    /// Master/worker channel errors
    Ipc,
    /// Worker process lifecycle errors
    Process,
    /// Job list and trigger errors
    Scheduler,
    /// Filesystem and socket errors
    Io,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Human-readable category name
    pub fn description(&self) -> &'static str {
        match self {
            Self::Config => "configuration error",
            Self::Ipc => "IPC error",
            Self::Process => "process error",
            Self::Scheduler => "scheduler error",
            Self::Io => "I/O error",
            Self::Other => "other error",
        }
    }
}

/// Unified error type for the forkline crate
#[derive(Error, Debug)]
pub enum Error {
    /// Scheduler errors (cron parsing, job lookup)
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Master/worker channel errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Supervisor errors (run dir, launch, restart budget)
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ForklineErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Supervisor(e) => e.is_recoverable(),
            Self::Ipc(IpcError::Decode { .. }) => true, // the line is skipped
            Self::Ipc(_) => false,
            Self::Io(_) => true,
            Self::Json(_) | Self::Toml(_) | Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Ipc(_) => ErrorCategory::Ipc,
            Self::Supervisor(e) => match e {
                SupervisorError::RunDirNotDirectory { .. }
                | SupervisorError::RunDirCreate { .. }
                | SupervisorError::PidFile { .. }
                | SupervisorError::InvalidPid { .. } => ErrorCategory::Io,
                _ => ErrorCategory::Process,
            },
            Self::Io(_) => ErrorCategory::Io,
            Self::Json(_) => ErrorCategory::Ipc,
            Self::Toml(_) | Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: format!("{err:#}"),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_error_category() {
        let err = Error::Scheduler(SchedulerError::EmptyPool);
        assert_eq!(err.category(), ErrorCategory::Scheduler);

        let err = Error::Supervisor(SupervisorError::RunDirNotDirectory {
            path: PathBuf::from("run"),
        });
        assert_eq!(err.category(), ErrorCategory::Io);

        let err = Error::Supervisor(SupervisorError::RestartBudgetExhausted { failures: 10 });
        assert_eq!(err.category(), ErrorCategory::Process);
    }

    #[test]
    fn test_is_recoverable() {
        let err = Error::Supervisor(SupervisorError::launch(1, "fork failed"));
        assert!(err.is_recoverable());

        let err = Error::Scheduler(SchedulerError::invalid_cron("a", "x", "bad"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let unified: Error = SupervisorError::NotRunning.into();
        assert!(matches!(unified, Error::Supervisor(_)));

        let unified: Error = io::Error::new(io::ErrorKind::AddrInUse, "busy").into();
        assert_eq!(unified.category(), ErrorCategory::Io);
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("worker_num must be greater than 0");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(!err.is_recoverable());
        assert_eq!(err.category().description(), "configuration error");
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err: Error = anyhow::anyhow!("inner").context("outer").into();
        assert_eq!(err.to_string(), "outer: inner");
    }
}
