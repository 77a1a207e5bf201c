//! Wire messages between master and workers

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Master → worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    /// Execute these job indices now
    Tasks { indices: Vec<usize> },

    /// Begin graceful shutdown
    Stop,
}

impl MasterMessage {
    /// Short tag for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tasks { .. } => "tasks",
            Self::Stop => "stop",
        }
    }
}

/// Worker → master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Listening resource bound; the worker may join the pool
    Ready {
        pid: u32,
        addr: Option<SocketAddr>,
    },

    /// Request counter crossed the overload threshold; replace me
    RequestLimited { requests: u64 },

    /// Periodic load report
    Heartbeat { requests: u64 },

    /// A dispatched batch finished
    BatchCompleted { report: BatchReport },
}

impl WorkerMessage {
    /// Short tag for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::RequestLimited { .. } => "request_limited",
            Self::Heartbeat { .. } => "heartbeat",
            Self::BatchCompleted { .. } => "batch_completed",
        }
    }
}

/// Outcome of one dispatched batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Indices as received
    pub indices: Vec<usize>,

    /// Jobs that returned `Ok`
    pub succeeded: Vec<usize>,

    /// Jobs that returned an error or panicked
    pub failed: Vec<JobFailure>,

    /// Jobs not started because an earlier invocation was still running
    pub skipped: Vec<usize>,

    /// Wall time from receipt to join
    pub elapsed_ms: u64,
}

impl BatchReport {
    /// No failures and nothing skipped
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// A single job failure inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub index: usize,

    /// `None` when the index is not in the worker's job list
    pub name: Option<String>,

    pub error: String,

    #[serde(default)]
    pub panicked: bool,
}
