//! Worker side of the cluster
//!
//! A worker binds the shared listening endpoint, announces itself with
//! `Ready`, serves requests, runs the job batches the master sends it, and
//! drains when told to stop (or when the master goes away).
//!
//! # Modules
//!
//! - [`runtime`] - [`WorkerRuntime`] event loop and drain protocol
//! - [`executor`] - [`JobExecutor`] concurrent batch execution
//! - [`service`] - [`Service`] trait for accepted connections

pub mod executor;
pub mod runtime;
pub mod service;

pub use executor::JobExecutor;
pub use runtime::WorkerRuntime;
pub use service::{RequestContext, Service, StatusService};

/// Drained cleanly
pub const EXIT_SUCCESS: i32 = 0;

/// Startup failure or drain timeout
pub const EXIT_FAILURE: i32 = 1;
