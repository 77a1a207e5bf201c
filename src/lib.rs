//! forkline - Pre-forking worker supervisor with cron fan-out
//!
//! A master process keeps a pool of workers listening on one shared endpoint,
//! replaces them without downtime on a rolling restart, swaps out a worker
//! once it has served too many requests, and fans cron-scheduled jobs out
//! across whichever workers are currently listening.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`cluster`] - Role selection and process entry point
//! - [`config`] - Configuration management and settings
//! - [`supervisor`] - Worker pool, rolling restarts, drain timers, signals
//! - [`worker`] - Worker runtime, job executor and request service
//! - [`scheduler`] - Job list, cron trigger map and chunk partitioning
//! - [`ipc`] - Typed master ↔ worker messages over newline-delimited JSON
//! - [`metrics`] - Prometheus counters and gauges
//! - [`logging`] - Tracing subscriber setup
//! - [`error`] - Unified error type
//!
//! # Example
//!
//! ```no_run
//! use forkline::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let jobs: Vec<Arc<dyn Job>> = vec![Arc::new(FnJob::cron(
//!         "heartbeat",
//!         "*/10 * * * * *",
//!         || async { Ok(()) },
//!     ))];
//!
//!     std::process::exit(Cluster::new(config, jobs).run().await);
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod metrics;
pub mod scheduler;
pub mod supervisor;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{Cluster, Role};
    pub use crate::config::{Config, Isolation};
    pub use crate::error::{Error, ErrorCategory, ForklineErrorTrait, Result};
    pub use crate::ipc::{BatchReport, MasterMessage, WorkerMessage};
    pub use crate::scheduler::{FnJob, Job, JobList};
    pub use crate::supervisor::{Supervisor, SupervisorEvent, SupervisorHandle, WorkerId};
    pub use crate::worker::{RequestContext, Service};
}

// Direct re-exports for convenience
pub use cluster::Cluster;
pub use config::Config;
