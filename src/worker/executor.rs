//! Batch execution of dispatched job indices
//!
//! Every job in a batch runs as its own task on the worker's runtime. A job
//! that errors or panics is recorded and the rest of the batch carries on;
//! the batch completes when all of its jobs have been joined.

use futures::future::join_all;
use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

use crate::ipc::{BatchReport, JobFailure};
use crate::metrics;
use crate::scheduler::JobList;

// ============================================================================
// In-flight Guard
// ============================================================================

/// Marks a job index as running until dropped
struct InFlightGuard {
    index: usize,
    set: Arc<Mutex<HashSet<usize>>>,
}

impl InFlightGuard {
    /// `None` if the index is already running
    fn acquire(set: &Arc<Mutex<HashSet<usize>>>, index: usize) -> Option<Self> {
        let mut running = set.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(index) {
            return None;
        }
        Some(Self {
            index,
            set: Arc::clone(set),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut running = self.set.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.index);
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs batches of job indices against a [`JobList`]
#[derive(Clone)]
pub struct JobExecutor {
    jobs: Arc<JobList>,
    in_flight: Arc<Mutex<HashSet<usize>>>,
}

impl JobExecutor {
    /// Create an executor over the worker's job list
    pub fn new(jobs: Arc<JobList>) -> Self {
        Self {
            jobs,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Indices currently running
    pub fn running(&self) -> usize {
        self.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Run one batch to completion.
    ///
    /// An index still running from an earlier batch is skipped rather than
    /// started a second time. Unknown indices are reported as failures.
    pub async fn run_batch(&self, indices: Vec<usize>) -> BatchReport {
        let started = Instant::now();
        let _timer = metrics::start_batch_timer();

        let mut report = BatchReport {
            indices: indices.clone(),
            ..Default::default()
        };
        let mut tasks = Vec::with_capacity(indices.len());

        for index in indices {
            let descriptor = match self.jobs.get(index) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(index, error = %e, "Dispatched index is not in the job list");
                    report.failed.push(JobFailure {
                        index,
                        name: None,
                        error: e.to_string(),
                        panicked: false,
                    });
                    continue;
                }
            };

            let Some(guard) = InFlightGuard::acquire(&self.in_flight, index) else {
                warn!(index, job = descriptor.name(), "Job still running from an earlier tick, skipping");
                report.skipped.push(index);
                continue;
            };

            let job = descriptor.job();
            let name = descriptor.name().to_string();
            let handle = tokio::spawn(async move {
                let _guard = guard;
                job.invoke().await
            });
            tasks.push((index, name, handle));
        }

        let results = join_all(
            tasks
                .into_iter()
                .map(|(index, name, handle)| async move { (index, name, handle.await) }),
        )
        .await;

        for (index, name, result) in results {
            match result {
                Ok(Ok(())) => {
                    debug!(index, job = %name, "Job completed");
                    report.succeeded.push(index);
                }
                Ok(Err(e)) => {
                    warn!(index, job = %name, error = %format!("{e:#}"), "Job failed");
                    report.failed.push(JobFailure {
                        index,
                        name: Some(name),
                        error: format!("{e:#}"),
                        panicked: false,
                    });
                }
                Err(join_error) => {
                    let panicked = join_error.is_panic();
                    let error = if panicked {
                        panic_message(join_error.into_panic())
                    } else {
                        String::from("job task was cancelled")
                    };
                    warn!(index, job = %name, %error, panicked, "Job aborted");
                    report.failed.push(JobFailure {
                        index,
                        name: Some(name),
                        error,
                        panicked,
                    });
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        String::from("panicked")
    }
}
