//! Master process supervision
//!
//! The Supervisor keeps a pool of `worker_num` listening workers alive,
//! replaces them one epoch at a time on a rolling restart, swaps out any
//! worker that reports it has served too many requests, and drives the
//! cron fan-out from the [`crate::scheduler`] module.
//!
//! # Worker lifecycle
//!
//! ```text
//!   launch ──▶ Spawning ──Ready──▶ Listening ──Stop──▶ Draining ──disconnect──▶ Dead
//!                 │                    │                   │
//!                 └──── crash ─────────┴──── crash ────────┴──kill timer──▶ killed
//! ```
//!
//! An exit after a drain is expected and refilled right away. Any other exit
//! counts against the restart budget and is reforked after an exponential
//! backoff.
//!
//! # Modules
//!
//! - [`control`] - [`Supervisor`] control loop, [`SupervisorHandle`], events
//! - [`registry`] - [`WorkerHandle`] states and the ordered listening pool
//! - [`launcher`] - [`WorkerLauncher`] for child processes or in-process tasks
//! - [`restart`] - [`RestartBackoff`] for unexpected exits
//! - [`rundir`] - run directory and master pid file
//! - [`signals`] - SIGINT, SIGTERM and SIGUSR2 handling
//! - [`error`] - supervisor error type

pub mod control;
pub mod error;
pub mod launcher;
pub mod registry;
pub mod restart;
pub mod rundir;
pub mod signals;

pub use control::{Supervisor, SupervisorEvent, SupervisorHandle, SupervisorStatus};
pub use error::{SupervisorError, SupervisorResult};
pub use launcher::{ProcessLauncher, TaskLauncher, WorkerLauncher, WorkerLink};
pub use registry::{DrainReason, RegistryStats, WorkerHandle, WorkerId, WorkerRegistry, WorkerSnapshot, WorkerState};
pub use restart::{BackoffDecision, RestartBackoff};
pub use rundir::{read_master_pid, RunDir, PID_FILE};
pub use signals::{ignore_interrupts, notify_master, spawn_signal_listener, ControlSignal};
