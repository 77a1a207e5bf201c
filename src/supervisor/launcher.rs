//! Starting workers
//!
//! A [`WorkerLauncher`] turns a worker id and epoch into a running worker
//! plus the master's end of its channel. Two launchers ship with the crate:
//!
//! - [`ProcessLauncher`] re-executes the current binary as a child process.
//!   The child's stdin and stdout carry the IPC stream and stderr is
//!   inherited for logs. A crash in a job or handler cannot take the master
//!   down with it.
//! - [`TaskLauncher`] runs [`WorkerRuntime`] on a task inside the master.
//!   Workers share the master's address space, so a forced kill aborts the
//!   task instead of signalling a process.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::error::{SupervisorError, SupervisorResult};
use super::registry::WorkerId;
use crate::config::{Config, WorkerConfig, WORKER_CONFIG_ENV, WORKER_EPOCH_ENV, WORKER_ID_ENV};
use crate::ipc::{self, MasterEndpoint};
use crate::scheduler::JobList;
use crate::worker::{Service, StatusService, WorkerRuntime};

/// Everything the Supervisor needs to drive one launched worker
#[derive(Debug)]
pub struct WorkerLink {
    /// OS process id, if the worker is a process
    pub pid: Option<u32>,

    /// Master's end of the channel; the inbox closes when the worker goes away
    pub endpoint: MasterEndpoint,

    /// Resolves with the exit code once the worker is gone
    pub exit: oneshot::Receiver<Option<i32>>,

    /// Fire to force-kill the worker
    pub kill: oneshot::Sender<()>,
}

/// Starts workers
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Start worker `id` in restart epoch `epoch`. Must be called inside a tokio runtime.
    fn launch(&self, id: WorkerId, epoch: u64) -> SupervisorResult<WorkerLink>;
}

// ============================================================================
// Process Launcher
// ============================================================================

/// Launches workers as child processes of the current executable
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    config_json: String,
}

impl ProcessLauncher {
    /// Launch `program args...` with the worker environment set
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, config: &Config) -> SupervisorResult<Self> {
        let config_json = serde_json::to_string(config)
            .map_err(|e| SupervisorError::launch(0, format!("cannot encode worker config: {e}")))?;

        Ok(Self {
            program: program.into(),
            args,
            config_json,
        })
    }

    /// Re-execute the running binary with the same arguments
    pub fn current(config: &Config) -> SupervisorResult<Self> {
        let program = std::env::current_exe()
            .map_err(|e| SupervisorError::launch(0, format!("cannot resolve current executable: {e}")))?;
        let args = std::env::args_os().skip(1).collect();
        Self::new(program, args, config)
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, id: WorkerId, epoch: u64) -> SupervisorResult<WorkerLink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ID_ENV, id.0.to_string())
            .env(WORKER_EPOCH_ENV, epoch.to_string())
            .env(WORKER_CONFIG_ENV, &self.config_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::launch(id.0, format!("spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::launch(id.0, "stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::launch(id.0, "stdout was not captured"))?;
        let pid = child.id();

        let (outbox, to_worker) = mpsc::unbounded_channel();
        let (from_worker, inbox) = mpsc::unbounded_channel();
        ipc::spawn_writer(stdin, to_worker);
        ipc::spawn_reader(stdout, from_worker);

        let (kill, kill_rx) = oneshot::channel();
        let (exit_tx, exit) = oneshot::channel();
        tokio::spawn(wait_child(id, child, kill_rx, exit_tx));

        debug!(worker = %id, ?pid, epoch, "Worker process started");

        Ok(WorkerLink {
            pid,
            endpoint: MasterEndpoint { outbox, inbox },
            exit,
            kill,
        })
    }
}

async fn wait_child(
    id: WorkerId,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<Option<i32>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(worker = %id, error = %e, "Failed to kill worker process");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(worker = %id, error = %e, "Failed to wait for worker process");
            None
        }
    };

    let _ = exit_tx.send(code);
}

// ============================================================================
// Task Launcher
// ============================================================================

/// Launches workers as tasks on the master's runtime
#[derive(Clone)]
pub struct TaskLauncher {
    config: WorkerConfig,
    jobs: Arc<JobList>,
    service: Arc<dyn Service>,
}

impl TaskLauncher {
    /// Create a launcher whose workers serve [`StatusService`]
    pub fn new(config: WorkerConfig, jobs: Arc<JobList>) -> Self {
        Self {
            config,
            jobs,
            service: Arc::new(StatusService),
        }
    }

    /// Replace the request handler
    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.service = service;
        self
    }
}

impl WorkerLauncher for TaskLauncher {
    fn launch(&self, id: WorkerId, epoch: u64) -> SupervisorResult<WorkerLink> {
        let (endpoint, worker_end) = ipc::channel();
        let runtime = WorkerRuntime::new(id.0, epoch, self.config.clone(), Arc::clone(&self.jobs))
            .with_service(Arc::clone(&self.service));

        let mut task = tokio::spawn(runtime.run(worker_end));
        let (kill, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit) = oneshot::channel();

        tokio::spawn(async move {
            let code = tokio::select! {
                joined = &mut task => joined.ok(),
                Ok(()) = &mut kill_rx => {
                    task.abort();
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(WorkerLink {
            pid: None,
            endpoint,
            exit,
            kill,
        })
    }
}
