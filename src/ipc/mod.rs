//! Master ↔ worker message channel
//!
//! Messages are typed enums serialized as one JSON object per line. A worker
//! process talks to the master over its stdin (master → worker) and stdout
//! (worker → master); an in-process worker gets a pair of plain channels with
//! the same message types.
//!
//! The channel closing is meaningful: when the worker's end goes away the
//! master treats it as the disconnect that acknowledges a drain, and when the
//! master's end goes away the worker drains on its own.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, spawn_reader, spawn_writer};
pub use message::{BatchReport, JobFailure, MasterMessage, WorkerMessage};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// IPC failures
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to encode IPC message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode IPC line {line:?}: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IPC stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// The master's side of one worker link
#[derive(Debug)]
pub struct MasterEndpoint {
    pub outbox: mpsc::UnboundedSender<MasterMessage>,
    pub inbox: mpsc::UnboundedReceiver<WorkerMessage>,
}

/// The worker's side of the link
#[derive(Debug)]
pub struct WorkerEndpoint {
    pub inbox: mpsc::UnboundedReceiver<MasterMessage>,
    pub outbox: mpsc::UnboundedSender<WorkerMessage>,
}

/// Connected in-process endpoints
pub fn channel() -> (MasterEndpoint, WorkerEndpoint) {
    let (master_tx, worker_rx) = mpsc::unbounded_channel();
    let (worker_tx, master_rx) = mpsc::unbounded_channel();

    (
        MasterEndpoint {
            outbox: master_tx,
            inbox: master_rx,
        },
        WorkerEndpoint {
            inbox: worker_rx,
            outbox: worker_tx,
        },
    )
}

/// Worker endpoint wired to this process's stdin and stdout.
///
/// Must be called from within a tokio runtime. Anything else written to
/// stdout would corrupt the stream, so workers log to stderr.
///
/// The returned writer finishes once every clone of the outbox is dropped
/// and the last line is flushed. The stdin reader sits in a blocking read
/// that never ends while the master holds the pipe open, so the runtime
/// hosting it must be shut down with a timeout rather than dropped.
pub fn stdio_endpoint() -> (WorkerEndpoint, JoinHandle<Result<(), IpcError>>) {
    let (in_tx, inbox) = mpsc::unbounded_channel();
    let (outbox, out_rx) = mpsc::unbounded_channel();

    spawn_reader(tokio::io::stdin(), in_tx);
    let writer = spawn_writer(tokio::io::stdout(), out_rx);

    (WorkerEndpoint { inbox, outbox }, writer)
}
