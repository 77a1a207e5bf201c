//! Error types for the supervisor module

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Supervisor-specific errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Run directory path is occupied by something other than a directory
    #[error("Run directory {} exists and is not a directory", path.display())]
    RunDirNotDirectory { path: PathBuf },

    /// Run directory could not be created
    #[error("Failed to create run directory {}: {source}", path.display())]
    RunDirCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Pid file could not be written, read or removed
    #[error("Pid file error at {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Pid file content is not a pid
    #[error("Invalid pid file {}: {content:?}", path.display())]
    InvalidPid { path: PathBuf, content: String },

    /// Worker could not be started
    #[error("Failed to launch worker {id}: {reason}")]
    Launch { id: u64, reason: String },

    /// Too many consecutive unexpected worker exits
    #[error("Restart budget exhausted after {failures} consecutive worker failures")]
    RestartBudgetExhausted { failures: u32 },

    /// Signal handler could not be installed
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] io::Error),

    /// Signal could not be delivered to the master
    #[error("Failed to signal master pid {pid}: {reason}")]
    Notify { pid: i32, reason: String },

    /// Control loop is gone
    #[error("Supervisor is not running")]
    NotRunning,
}

impl SupervisorError {
    /// Create a launch error
    pub fn launch(id: u64, reason: impl Into<String>) -> Self {
        Self::Launch {
            id,
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    ///
    /// A failed launch is retried through the restart backoff; everything
    /// else is fatal for the master.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Launch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_dir_error_message() {
        let err = SupervisorError::RunDirNotDirectory {
            path: PathBuf::from("run"),
        };
        assert_eq!(err.to_string(), "Run directory run exists and is not a directory");
    }

    #[test]
    fn test_is_recoverable() {
        assert!(SupervisorError::launch(3, "spawn failed").is_recoverable());
        assert!(!SupervisorError::RestartBudgetExhausted { failures: 10 }.is_recoverable());
        assert!(!SupervisorError::NotRunning.is_recoverable());
    }
}
