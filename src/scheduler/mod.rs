//! Cron fan-out scheduling
//!
//! This module decides *which* jobs are due *when*, and how a due set is cut
//! up across the worker pool. It owns no timers and no processes; the
//! Supervisor drives it from its control loop.
//!
//! # Overview
//!
//! ```text
//!   maintenance tick (1s)            dispatch tick (1s)
//!          │                                │
//!          ▼                                ▼
//!   TriggerMap::maintain(now)        TriggerMap::take_due(now)
//!   second → {job indices}  ───────▶        │
//!                                           ▼
//!                                    partition(due, pool)
//!                                           │
//!                       ┌───────────────────┼───────────────────┐
//!                       ▼                   ▼                   ▼
//!                  Tasks [0]           Tasks [1]           Tasks []
//!                  worker #1           worker #2           worker #3
//! ```
//!
//! The two ticks are independent timers with no ordering guarantee between
//! them; a job registered in one tick is typically dispatched in the next.
//!
//! # Modules
//!
//! - [`job`] - [`Job`] trait, closure jobs, cron parsing, the indexed [`JobList`]
//! - [`trigger`] - [`TriggerMap`] and the tokio-driven [`SchedulerClock`]
//! - [`distribution`] - contiguous chunk partitioning and dispatch counters
//! - [`error`] - scheduler error type
//!
//! # Delivery semantics
//!
//! At most once, best effort. Due jobs found while the pool is empty are
//! dropped, occurrences whose second passes without a dispatch tick are
//! pruned, and nothing is persisted across master restarts.

pub mod distribution;
pub mod error;
pub mod job;
pub mod trigger;

// Re-export main types
pub use distribution::{assign, chunk_size, partition, DispatchStats};
pub use error::{SchedulerError, SchedulerResult};
pub use job::{CronSchedule, FnJob, Job, JobDescriptor, JobList};
pub use trigger::{SchedulerClock, TriggerMap};
