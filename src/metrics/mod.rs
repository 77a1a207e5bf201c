//! Prometheus metrics for the supervisor and workers
//!
//! This module provides metrics tracking for:
//! - Supervisor: forks, pool size, drains, forced kills, unexpected exits, rolling restarts
//! - Scheduler: jobs dispatched, dropped and pruned, job failures reported by workers
//! - Worker: batch duration, requests served
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.
//!
//! Each process has its own registry. With process isolation the worker
//! series stay inside the worker; with task isolation they share the master's.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all supervisor metrics
struct SupervisorMetrics {
    workers_spawned: Counter,
    pool_size: Gauge,
    drains: CounterVec,
    forced_kills: Counter,
    unexpected_exits: Counter,
    rolling_restarts: Counter,
    jobs_dispatched: Counter,
    jobs_dropped: Counter,
    triggers_pruned: Counter,
    job_failures: CounterVec,
}

/// Container for all worker metrics
struct WorkerMetrics {
    batch_duration: Histogram,
    requests_served: Counter,
}

/// Global storage for supervisor metrics
static SUPERVISOR_METRICS: OnceLock<SupervisorMetrics> = OnceLock::new();

/// Global storage for worker metrics
static WORKER_METRICS: OnceLock<WorkerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at process startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = forkline::metrics::init_metrics() {
///     tracing::warn!("Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let supervisor = SupervisorMetrics {
        workers_spawned: register_counter!(
            "forkline_workers_spawned_total",
            "Total number of workers launched"
        )?,
        pool_size: register_gauge!(
            "forkline_pool_size",
            "Number of workers currently in the listening pool"
        )?,
        drains: register_counter_vec!(
            "forkline_worker_drains_total",
            "Total number of drains started, by reason",
            &["reason"]
        )?,
        forced_kills: register_counter!(
            "forkline_worker_forced_kills_total",
            "Total number of workers killed after the drain timeout"
        )?,
        unexpected_exits: register_counter!(
            "forkline_worker_unexpected_exits_total",
            "Total number of workers that exited without being drained"
        )?,
        rolling_restarts: register_counter!(
            "forkline_rolling_restarts_total",
            "Total number of rolling restarts started"
        )?,
        jobs_dispatched: register_counter!(
            "forkline_jobs_dispatched_total",
            "Total job occurrences sent to workers"
        )?,
        jobs_dropped: register_counter!(
            "forkline_jobs_dropped_total",
            "Total job occurrences dropped because the pool was empty"
        )?,
        triggers_pruned: register_counter!(
            "forkline_triggers_pruned_total",
            "Total job occurrences pruned from the trigger map undispatched"
        )?,
        job_failures: register_counter_vec!(
            "forkline_job_failures_total",
            "Total job failures reported by workers",
            &["job"]
        )?,
    };

    let worker = WorkerMetrics {
        batch_duration: register_histogram!(
            "forkline_worker_batch_duration_seconds",
            "Time from receiving a Tasks batch to joining all its jobs",
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )?,
        requests_served: register_counter!(
            "forkline_worker_requests_total",
            "Total requests accepted by this process"
        )?,
    };

    SUPERVISOR_METRICS
        .set(supervisor)
        .map_err(|_| "Supervisor metrics already initialized")?;
    WORKER_METRICS
        .set(worker)
        .map_err(|_| "Worker metrics already initialized")?;

    tracing::debug!("Prometheus metrics initialized");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SUPERVISOR_METRICS.get().is_some() && WORKER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a worker launch
pub fn record_worker_spawned() {
    if let Some(m) = SUPERVISOR_METRICS.get() {
        m.workers_spawned.inc();
    }
}

/// Update the listening pool gauge
pub fn update_pool_size(size: usize) {
    if let Some(m) = SUPERVISOR_METRICS.get() {
        m.pool_size.set(size as f64);
    }
}

/// Record a drain (`restart`, `overload`, `shutdown`)
pub fn record_drain(reason: &str) {
    if let Some(m) = SUPERVISOR_METRICS.get() {
        m.drains.with_label_values(&[reason]).inc();
    }
}

/// Record a forced kill after drain timeout
pub fn record_forced_kill() {
    if let Some(m) = SUPERVISOR_METRICS.get() {
        m.forced_kills.inc();
    }
}

/// Record a worker exit that was not preceded by a drain
pub fn record_unexpected_exit() {
    if let Some(m) = SUPERVISOR_METRICS.get() {
        m.unexpected_exits.inc();
    }
}

/// Record the start of a rolling restart
pub fn record_rolling_restart() {
    if let Some(m) = SUPERVISOR_METRICS.get() {
        m.rolling_restarts.inc();
    }
}

/// Record the outcome of one dispatch tick
pub fn record_dispatch(dispatched: usize, dropped: usize) {
    let Some(m) = SUPERVISOR_METRICS.get() else {
        return;
    };

    if dispatched > 0 {
        m.jobs_dispatched.inc_by(dispatched as f64);
    }

    if dropped > 0 {
        m.jobs_dropped.inc_by(dropped as f64);
    }
}

/// Record pruned trigger entries
pub fn record_pruned(count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = SUPERVISOR_METRICS.get() {
        m.triggers_pruned.inc_by(count as f64);
    }
}

/// Record a job failure reported in a batch
pub fn record_job_failure(job: &str) {
    if let Some(m) = SUPERVISOR_METRICS.get() {
        m.job_failures.with_label_values(&[job]).inc();
    }
}

/// Record an accepted request
pub fn record_request() {
    if let Some(m) = WORKER_METRICS.get() {
        m.requests_served.inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a batch timer
pub fn start_batch_timer() -> MetricsTimer {
    match WORKER_METRICS.get() {
        Some(m) => MetricsTimer::new(m.batch_duration.start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
