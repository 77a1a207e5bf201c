//! Common test utilities
//!
//! [`ScriptedLauncher`] stands in for real workers: each fake worker follows
//! a [`WorkerScript`] (when to send `Ready`, whether to obey `Stop`, when to
//! crash) and records what the master sent it. Everything runs on tokio
//! timers, so tests can use a paused clock.

#![allow(dead_code)]

use forkline::config::Config;
use forkline::ipc::{self, MasterMessage, WorkerEndpoint, WorkerMessage};
use forkline::scheduler::{FnJob, Job, JobList};
use forkline::supervisor::{
    Supervisor, SupervisorEvent, SupervisorHandle, SupervisorResult, WorkerId, WorkerLauncher,
    WorkerLink,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

/// How a fake worker behaves
#[derive(Debug, Clone)]
pub struct WorkerScript {
    /// Delay before `Ready`; `None` never becomes ready
    pub ready_after: Option<Duration>,

    /// Exit after `Stop`
    pub honor_stop: bool,

    /// Time spent finishing in-flight work after `Stop`
    pub stop_delay: Duration,

    /// Exit with code 1 this long after launch
    pub crash_after: Option<Duration>,
}

impl Default for WorkerScript {
    fn default() -> Self {
        Self {
            ready_after: Some(Duration::from_millis(100)),
            honor_stop: true,
            stop_delay: Duration::ZERO,
            crash_after: None,
        }
    }
}

impl WorkerScript {
    pub fn stubborn() -> Self {
        Self {
            honor_stop: false,
            ..Default::default()
        }
    }

    pub fn crashing(after: Duration) -> Self {
        Self {
            ready_after: None,
            crash_after: Some(after),
            ..Default::default()
        }
    }
}

/// One recorded launch
#[derive(Debug, Clone)]
pub struct Launch {
    pub id: WorkerId,
    pub epoch: u64,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct Record {
    launches: Vec<Launch>,
    tasks: Vec<(WorkerId, Vec<usize>)>,
    stops: Vec<(WorkerId, Instant)>,
    injectors: HashMap<WorkerId, mpsc::UnboundedSender<WorkerMessage>>,
}

type ScriptFn = dyn Fn(WorkerId, u64) -> WorkerScript + Send + Sync;

/// Launcher whose workers are scripted tasks
pub struct ScriptedLauncher {
    script: Box<ScriptFn>,
    record: Arc<Mutex<Record>>,
}

impl ScriptedLauncher {
    /// Every worker follows `script`
    pub fn new(script: WorkerScript) -> Arc<Self> {
        Self::with(move |_, _| script.clone())
    }

    /// Choose a script per worker id and epoch
    pub fn with(script: impl Fn(WorkerId, u64) -> WorkerScript + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            record: Arc::new(Mutex::new(Record::default())),
        })
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.record.lock().unwrap().launches.clone()
    }

    pub fn tasks(&self) -> Vec<(WorkerId, Vec<usize>)> {
        self.record.lock().unwrap().tasks.clone()
    }

    pub fn stops(&self) -> Vec<(WorkerId, Instant)> {
        self.record.lock().unwrap().stops.clone()
    }

    /// Make worker `id` send `message` to the master
    pub fn inject(&self, id: WorkerId, message: WorkerMessage) -> bool {
        match self.record.lock().unwrap().injectors.get(&id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, id: WorkerId, epoch: u64) -> SupervisorResult<WorkerLink> {
        let script = (self.script)(id, epoch);
        let (endpoint, worker_end) = ipc::channel();
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();

        {
            let mut record = self.record.lock().unwrap();
            record.launches.push(Launch {
                id,
                epoch,
                at: Instant::now(),
            });
            record.injectors.insert(id, inject_tx);
        }

        let mut task = tokio::spawn(fake_worker(
            id,
            script,
            worker_end,
            inject_rx,
            Arc::clone(&self.record),
        ));
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

async fn fake_worker(
    id: WorkerId,
    script: WorkerScript,
    endpoint: WorkerEndpoint,
    mut inject: mpsc::UnboundedReceiver<WorkerMessage>,
    record: Arc<Mutex<Record>>,
) -> i32 {
    let WorkerEndpoint { mut inbox, outbox } = endpoint;

    let crash = async {
        match script.crash_after {
            Some(after) => sleep(after).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(crash);

    let ready = async {
        match script.ready_after {
            Some(after) => sleep(after).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = ready => {
            let _ = outbox.send(WorkerMessage::Ready {
                pid: 10_000 + id.0 as u32,
                addr: None,
            });
        }
        _ = &mut crash => return 1,
    }

    loop {
        tokio::select! {
            message = inbox.recv() => match message {
                Some(MasterMessage::Tasks { indices }) => {
                    record.lock().unwrap().tasks.push((id, indices));
                }
                Some(MasterMessage::Stop) => {
                    record.lock().unwrap().stops.push((id, Instant::now()));
                    if script.honor_stop {
                        sleep(script.stop_delay).await;
                        return 0;
                    }
                }
                None => return 0,
            },
            Some(message) = inject.recv() => {
                let _ = outbox.send(message);
            }
            _ = &mut crash => return 1,
        }
    }
}

/// Supervisor settings for scripted tests
pub fn test_config(workers: usize) -> Config {
    let mut config = Config::default();
    config.supervisor.worker_num = workers;
    config.supervisor.drain_timeout_secs = 15;
    config.supervisor.kill_grace_ms = 500;
    config.supervisor.restart_backoff_base_ms = 100;
    config.supervisor.restart_backoff_max_ms = 1_000;
    config.supervisor.max_consecutive_failures = 3;
    config.scheduler.tick_interval_ms = 1_000;
    config
}

/// Jobs that run every second and do nothing
pub fn every_second_jobs(count: usize) -> Arc<JobList> {
    let jobs: Vec<Arc<dyn Job>> = (0..count)
        .map(|i| {
            Arc::new(FnJob::cron(format!("job_{i}"), "* * * * * *", || async { Ok(()) }))
                as Arc<dyn Job>
        })
        .collect();
    Arc::new(JobList::new(jobs).unwrap())
}

/// A running Supervisor under test
pub struct Running {
    pub handle: SupervisorHandle,
    pub events: broadcast::Receiver<SupervisorEvent>,
    pub task: JoinHandle<i32>,
}

/// Start `supervisor`, subscribing before the first event
pub fn start(supervisor: Supervisor) -> Running {
    let handle = supervisor.handle();
    let events = handle.subscribe();
    let task = tokio::spawn(supervisor.run());
    Running {
        handle,
        events,
        task,
    }
}

/// Start a Supervisor over `launcher`
pub fn start_with(config: Config, jobs: Arc<JobList>, launcher: Arc<ScriptedLauncher>) -> Running {
    start(Supervisor::new(config, jobs, launcher))
}

impl Running {
    /// Next event matching `pred`, within a minute of (virtual) time
    pub async fn wait_for(&mut self, pred: impl Fn(&SupervisorEvent) -> bool) -> SupervisorEvent {
        let events = &mut self.events;
        timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => {}
                    Err(e) => panic!("event stream failed: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for supervisor event")
    }

    /// Events seen until `pred` matches, including the match
    pub async fn collect_until(&mut self, pred: impl Fn(&SupervisorEvent) -> bool) -> Vec<SupervisorEvent> {
        let events = &mut self.events;
        timeout(Duration::from_secs(60), async {
            let mut seen = Vec::new();
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let done = pred(&event);
                        seen.push(event);
                        if done {
                            return seen;
                        }
                    }
                    Err(e) => panic!("event stream failed: {e}"),
                }
            }
        })
        .await
        .expect("timed out collecting supervisor events")
    }

    /// Wait until `count` workers have reported Listening
    pub async fn wait_listening(&mut self, count: usize) -> Vec<WorkerId> {
        let mut ids = Vec::new();
        while ids.len() < count {
            if let SupervisorEvent::WorkerListening { id, .. } =
                self.wait_for(|e| matches!(e, SupervisorEvent::WorkerListening { .. })).await
            {
                ids.push(id);
            }
        }
        ids
    }

    /// Terminate and return the exit code
    pub async fn shutdown(self) -> i32 {
        let _ = self.handle.terminate();
        timeout(Duration::from_secs(60), self.task)
            .await
            .expect("supervisor did not stop")
            .expect("supervisor task panicked")
    }
}
