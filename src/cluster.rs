//! Role selection
//!
//! The same binary runs as master or worker. A process started by a
//! [`ProcessLauncher`] finds [`WORKER_ID_ENV`] in its environment and becomes
//! a worker; anything else is the master.
//!
//! Both roles must build the same job list in the same order, since only
//! job indices cross the process boundary.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, Isolation, WORKER_EPOCH_ENV, WORKER_ID_ENV};
use crate::error::{Error, ForklineErrorTrait, Result};
use crate::ipc;
use crate::metrics;
use crate::scheduler::{Job, JobList};
use crate::supervisor::{
    ignore_interrupts, spawn_signal_listener, ProcessLauncher, RunDir, Supervisor, TaskLauncher,
    WorkerLauncher,
};
use crate::worker::{Service, StatusService, WorkerRuntime, EXIT_FAILURE};

/// How long a worker waits for its last IPC lines to drain to the master
const IPC_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side of the cluster this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker { id: u64, epoch: u64 },
}

impl Role {
    /// Detect the role from the environment
    pub fn detect() -> Result<Self> {
        let Ok(raw_id) = std::env::var(WORKER_ID_ENV) else {
            return Ok(Self::Master);
        };

        let id = raw_id
            .parse()
            .map_err(|_| Error::config(format!("Invalid {WORKER_ID_ENV}: {raw_id}")))?;
        let epoch = match std::env::var(WORKER_EPOCH_ENV) {
            Ok(raw) => raw
                .parse()
                .map_err(|_| Error::config(format!("Invalid {WORKER_EPOCH_ENV}: {raw}")))?,
            Err(_) => 0,
        };

        Ok(Self::Worker { id, epoch })
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }
}

/// A master-or-worker process
pub struct Cluster {
    config: Config,
    jobs: Vec<Arc<dyn Job>>,
    service: Arc<dyn Service>,
}

impl Cluster {
    /// Create a cluster running `jobs` on cron
    pub fn new(config: Config, jobs: Vec<Arc<dyn Job>>) -> Self {
        Self {
            config,
            jobs,
            service: Arc::new(StatusService),
        }
    }

    /// Replace the request handler used by workers
    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.service = service;
        self
    }

    /// Run this process's role to completion. Returns the exit code.
    pub async fn run(self) -> i32 {
        match Role::detect() {
            Ok(Role::Master) => self.run_master().await,
            Ok(Role::Worker { id, epoch }) => self.run_worker(id, epoch).await,
            Err(e) => {
                error!(error = %e, "Cannot determine process role");
                EXIT_FAILURE
            }
        }
    }

    async fn run_worker(self, id: u64, epoch: u64) -> i32 {
        // Prefer the master's settings over our own environment
        let config = match Config::from_worker_env() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Using local configuration");
                self.config
            }
        };

        let jobs = match JobList::new(self.jobs) {
            Ok(jobs) => Arc::new(jobs),
            Err(e) => {
                error!(error = %e, "Invalid job list");
                return EXIT_FAILURE;
            }
        };

        if let Err(e) = ignore_interrupts() {
            warn!(error = %e, "Failed to install SIGINT handler");
        }

        let _ = metrics::init_metrics();

        let (endpoint, writer) = ipc::stdio_endpoint();
        let code = WorkerRuntime::new(id, epoch, config.worker, jobs)
            .with_service(self.service)
            .run(endpoint)
            .await;

        // Let the final report reach the master before the process exits
        match tokio::time::timeout(IPC_FLUSH_TIMEOUT, writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Failed to flush IPC to master"),
            Ok(Err(e)) => warn!(error = %e, "IPC writer task failed"),
            Err(_) => warn!(timeout = ?IPC_FLUSH_TIMEOUT, "Timed out flushing IPC to master"),
        }
        code
    }

    async fn run_master(self) -> i32 {
        if let Err(e) = metrics::init_metrics() {
            warn!(error = %e, "Metrics initialization failed");
        }

        match self.start_master().await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, category = e.category().description(), "Master failed to start");
                EXIT_FAILURE
            }
        }
    }

    async fn start_master(self) -> Result<i32> {
        let Cluster {
            config,
            jobs,
            service,
        } = self;

        let jobs = Arc::new(JobList::new(jobs)?);
        let run_dir = RunDir::prepare(&config.supervisor.run_dir)?;
        run_dir.write_pid(std::process::id())?;

        let launcher: Arc<dyn WorkerLauncher> = match config.supervisor.isolation {
            Isolation::Process => Arc::new(ProcessLauncher::current(&config)?),
            Isolation::Task => Arc::new(
                TaskLauncher::new(config.worker.clone(), Arc::clone(&jobs)).with_service(service),
            ),
        };

        info!(
            pid = std::process::id(),
            run_dir = %run_dir.path().display(),
            listen = %config.worker.listen_addr,
            "Master started"
        );

        let supervisor = Supervisor::new(config, jobs, launcher);
        let signals = match spawn_signal_listener(supervisor.handle()) {
            Ok(signals) => signals,
            Err(e) => {
                run_dir.remove_pid();
                return Err(e.into());
            }
        };

        let code = supervisor.run().await;

        signals.abort();
        run_dir.remove_pid();
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_role_defaults_to_master() {
        std::env::remove_var(WORKER_ID_ENV);
        assert_eq!(Role::detect().unwrap(), Role::Master);
        assert!(Role::detect().unwrap().is_master());
    }

    #[test]
    #[serial]
    fn test_role_reads_worker_env() {
        std::env::set_var(WORKER_ID_ENV, "4");
        std::env::set_var(WORKER_EPOCH_ENV, "2");
        let role = Role::detect();
        std::env::remove_var(WORKER_ID_ENV);
        std::env::remove_var(WORKER_EPOCH_ENV);

        assert_eq!(role.unwrap(), Role::Worker { id: 4, epoch: 2 });
    }

    #[test]
    #[serial]
    fn test_role_rejects_garbage_id() {
        std::env::set_var(WORKER_ID_ENV, "abc");
        let role = Role::detect();
        std::env::remove_var(WORKER_ID_ENV);

        assert!(role.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_master_fails_on_blocked_run_dir() {
        std::env::remove_var(WORKER_ID_ENV);
        let tmp = tempfile::tempdir().unwrap();
        let blocked = tmp.path().join("run");
        std::fs::write(&blocked, "file").unwrap();

        let mut config = Config::default();
        config.supervisor.run_dir = blocked;
        config.supervisor.isolation = Isolation::Task;

        assert_eq!(Cluster::new(config, Vec::new()).run().await, EXIT_FAILURE);
    }
}
