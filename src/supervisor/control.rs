//! The Supervisor control loop
//!
//! Every piece of master state (worker registry, trigger map, restart
//! bookkeeping) lives in [`SupervisorState`] and is touched only from the
//! single loop in [`Supervisor::run`]. Worker I/O, timers and OS signals run
//! elsewhere and reach the loop as [`WorkerEvent`]s or [`Command`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::error::{SupervisorError, SupervisorResult};
use super::launcher::{WorkerLauncher, WorkerLink};
use super::registry::{DrainReason, RegistryStats, WorkerHandle, WorkerId, WorkerRegistry, WorkerSnapshot, WorkerState};
use super::restart::{BackoffDecision, RestartBackoff};
use crate::config::Config;
use crate::ipc::{JobFailure, MasterEndpoint, MasterMessage, WorkerMessage};
use crate::metrics;
use crate::scheduler::{assign, DispatchStats, JobList, SchedulerClock, TriggerMap};

const EVENT_CAPACITY: usize = 1024;

// ============================================================================
// Events and Commands
// ============================================================================

/// Internal input to the control loop
#[derive(Debug)]
enum WorkerEvent {
    /// A worker sent a message
    Message { id: WorkerId, message: WorkerMessage },

    /// A worker's channel closed
    Disconnected { id: WorkerId },

    /// A worker is gone
    Exited { id: WorkerId, code: Option<i32> },

    /// A drain kill timer fired
    DrainExpired { id: WorkerId },

    /// A backoff delay elapsed
    Respawn,
}

/// External requests, sent through a [`SupervisorHandle`]
#[derive(Debug)]
enum Command {
    Restart,
    Terminate,
    Status(oneshot::Sender<SupervisorStatus>),
}

/// Observable supervisor activity
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    WorkerSpawned { id: WorkerId, epoch: u64 },
    WorkerListening { id: WorkerId, epoch: u64, pool_size: usize },
    WorkerDraining { id: WorkerId, reason: DrainReason },
    WorkerKilled { id: WorkerId },
    WorkerExited { id: WorkerId, code: Option<i32>, expected: bool },
    Dispatched { second: i64, chunks: Vec<(WorkerId, Vec<usize>)> },
    DispatchDropped { second: i64, jobs: Vec<usize> },
    BatchFailed { id: WorkerId, failures: Vec<JobFailure> },
    RestartStarted { epoch: u64 },
    RestartCompleted { epoch: u64 },
    ShutdownComplete { exit_code: i32 },
}

/// Point-in-time view of the Supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub epoch: u64,
    pub target: usize,
    pub pool: Vec<WorkerId>,
    pub workers: Vec<WorkerSnapshot>,
    pub registry: RegistryStats,
    pub restarting: bool,
    pub shutting_down: bool,
    pub pending_respawns: usize,
    pub consecutive_failures: u32,
    pub forced_kills: u64,
    pub dispatch: DispatchStats,
    pub reported_at: DateTime<Utc>,
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable control surface for a running Supervisor
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorHandle {
    /// Start a rolling restart
    pub fn restart(&self) -> SupervisorResult<()> {
        self.commands
            .send(Command::Restart)
            .map_err(|_| SupervisorError::NotRunning)
    }

    /// Drain every worker and stop
    pub fn terminate(&self) -> SupervisorResult<()> {
        self.commands
            .send(Command::Terminate)
            .map_err(|_| SupervisorError::NotRunning)
    }

    /// Current status
    pub async fn status(&self) -> SupervisorResult<SupervisorStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .map_err(|_| SupervisorError::NotRunning)?;
        rx.await.map_err(|_| SupervisorError::NotRunning)
    }

    /// Receive [`SupervisorEvent`]s from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Master process: owns the pool, the trigger map and the restart policy
pub struct Supervisor {
    state: SupervisorState,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    handle: SupervisorHandle,
}

impl Supervisor {
    /// Create a Supervisor; nothing starts until [`run`](Self::run)
    pub fn new(config: Config, jobs: Arc<JobList>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let state = SupervisorState {
            backoff: RestartBackoff::from_config(&config.supervisor),
            target: config.supervisor.worker_num,
            config,
            jobs,
            launcher,
            registry: WorkerRegistry::new(),
            triggers: TriggerMap::new(),
            clock: SchedulerClock::new(),
            dispatch: DispatchStats::default(),
            epoch: 0,
            restarting: false,
            pending_respawns: 0,
            shutting_down: false,
            budget_exhausted: false,
            straggler_killed: false,
            forced_kills: 0,
            ticking: false,
            events_tx,
            broadcast: broadcast_tx.clone(),
        };

        Self {
            state,
            events_rx,
            commands_rx,
            handle: SupervisorHandle {
                commands: commands_tx,
                events: broadcast_tx,
            },
        }
    }

    /// Anchor the scheduler's wall clock at a fixed time
    pub fn with_clock(mut self, clock: SchedulerClock) -> Self {
        self.state.clock = clock;
        self
    }

    /// Control handle
    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Run until shutdown completes. Returns the master exit code.
    pub async fn run(self) -> i32 {
        let Supervisor {
            mut state,
            mut events_rx,
            mut commands_rx,
            handle,
        } = self;
        // Dropping our own handle lets the command channel close with the last external one
        drop(handle);

        let mut maintenance: Option<Interval> = None;
        let mut dispatch: Option<Interval> = None;

        state.start();

        while !state.finished() {
            tokio::select! {
                Some(event) = events_rx.recv() => state.on_event(event),
                Some(command) = commands_rx.recv() => state.on_command(command),
                _ = tick(&mut maintenance) => state.maintenance_tick(),
                _ = tick(&mut dispatch) => state.dispatch_tick(),
            }

            // Cron ticks begin once the first worker is listening
            if state.ticking && maintenance.is_none() {
                let period = state.config.scheduler.tick_interval();
                maintenance = Some(ticker(period));
                dispatch = Some(ticker(period));
                info!(period = ?period, jobs = state.jobs.len(), "Cron ticks started");
            }
        }

        state.shutdown_complete()
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// State
// ============================================================================

struct SupervisorState {
    config: Config,
    jobs: Arc<JobList>,
    launcher: Arc<dyn WorkerLauncher>,
    registry: WorkerRegistry,
    triggers: TriggerMap,
    clock: SchedulerClock,
    dispatch: DispatchStats,
    backoff: RestartBackoff,
    target: usize,
    epoch: u64,
    restarting: bool,
    pending_respawns: usize,
    shutting_down: bool,
    budget_exhausted: bool,
    straggler_killed: bool,
    forced_kills: u64,
    ticking: bool,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    broadcast: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorState {
    fn emit(&self, event: SupervisorEvent) {
        let _ = self.broadcast.send(event);
    }

    fn start(&mut self) {
        info!(
            workers = self.target,
            isolation = %self.config.supervisor.isolation,
            jobs = self.jobs.len(),
            "Supervisor starting"
        );
        for _ in 0..self.target {
            self.spawn_worker();
        }
    }

    fn finished(&self) -> bool {
        self.shutting_down && self.registry.is_empty()
    }

    fn shutdown_complete(&self) -> i32 {
        let exit_code = if self.budget_exhausted || self.straggler_killed { 1 } else { 0 };

        if let Ok(text) = metrics::gather_metrics() {
            debug!(metrics = %text, "Final metrics");
        }

        info!(exit_code, forced_kills = self.forced_kills, "Supervisor stopped");
        self.emit(SupervisorEvent::ShutdownComplete { exit_code });
        exit_code
    }

    // ------------------------------------------------------------------------
    // Spawning
    // ------------------------------------------------------------------------

    /// Workers missing from the target.
    ///
    /// Counts every live worker, draining ones included, so orderly drains
    /// never trigger a refork. While a rolling restart is in progress the
    /// current epoch must also reach the target on its own.
    fn deficit(&self) -> usize {
        let live = self.registry.live_count() + self.pending_respawns;
        let mut missing = self.target.saturating_sub(live);

        if self.restarting {
            let current = self.registry.active_in_epoch(self.epoch) + self.pending_respawns;
            missing = missing.max(self.target.saturating_sub(current));
        }

        missing
    }

    fn spawn_worker(&mut self) {
        let id = self.registry.next_id();
        let epoch = self.epoch;

        let link = match self.launcher.launch(id, epoch) {
            Ok(link) => link,
            Err(e) => {
                error!(worker = %id, error = %e, "Failed to launch worker");
                self.on_failure();
                return;
            }
        };

        let WorkerLink {
            pid,
            endpoint,
            exit,
            kill,
        } = link;
        let MasterEndpoint { outbox, mut inbox } = endpoint;

        self.registry
            .insert(WorkerHandle::new(id, epoch, pid, outbox, kill));

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if events.send(WorkerEvent::Message { id, message }).is_err() {
                    return;
                }
            }
            let _ = events.send(WorkerEvent::Disconnected { id });
            let code = exit.await.ok().flatten();
            let _ = events.send(WorkerEvent::Exited { id, code });
        });

        metrics::record_worker_spawned();
        info!(worker = %id, ?pid, epoch, "Worker spawned");
        self.emit(SupervisorEvent::WorkerSpawned { id, epoch });
    }

    fn refill(&mut self) {
        if self.shutting_down {
            return;
        }
        for _ in 0..self.deficit() {
            self.spawn_worker();
        }
    }

    /// Unexpected exit or failed launch
    fn on_failure(&mut self) {
        match self.backoff.record_failure() {
            BackoffDecision::Retry(delay) => {
                if self.shutting_down || self.deficit() == 0 {
                    return;
                }
                self.pending_respawns += 1;
                warn!(
                    delay = ?delay,
                    failures = self.backoff.failures(),
                    "Reforking after backoff"
                );
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(WorkerEvent::Respawn);
                });
            }
            BackoffDecision::GiveUp { failures } => {
                let err = SupervisorError::RestartBudgetExhausted { failures };
                error!(error = %err, "Giving up on workers");
                self.budget_exhausted = true;
                self.begin_shutdown();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------------

    fn drain_worker(&mut self, id: WorkerId, reason: DrainReason) {
        if !self.registry.mark_draining(id, reason) {
            return;
        }

        let kill_after = self.config.supervisor.kill_after();
        let events = self.events_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(kill_after).await;
            let _ = events.send(WorkerEvent::DrainExpired { id });
        });

        if let Some(handle) = self.registry.get_mut(id) {
            if !handle.send(MasterMessage::Stop) {
                debug!(worker = %id, "Worker channel already closed");
            }
            handle.set_drain_timer(timer);
        }

        info!(worker = %id, reason = reason.as_str(), "Draining worker");
        metrics::record_drain(reason.as_str());
        metrics::update_pool_size(self.registry.pool_size());
        self.emit(SupervisorEvent::WorkerDraining { id, reason });
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.restarting = false;

        info!(workers = self.registry.live_count(), "Shutting down");
        for id in self.registry.undrained() {
            self.drain_worker(id, DrainReason::Shutdown);
        }
    }

    fn begin_restart(&mut self) {
        if self.shutting_down {
            warn!("Restart requested during shutdown, ignoring");
            return;
        }

        self.epoch += 1;
        self.restarting = true;
        info!(epoch = self.epoch, workers = self.target, "Rolling restart started");
        metrics::record_rolling_restart();
        self.emit(SupervisorEvent::RestartStarted { epoch: self.epoch });

        for _ in 0..self.target {
            self.spawn_worker();
        }
    }

    // ------------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Restart => self.begin_restart(),
            Command::Terminate => self.begin_shutdown(),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message { id, message } => self.on_message(id, message),
            WorkerEvent::Disconnected { id } => self.on_disconnected(id),
            WorkerEvent::Exited { id, code } => self.on_exited(id, code),
            WorkerEvent::DrainExpired { id } => self.on_drain_expired(id),
            WorkerEvent::Respawn => {
                self.pending_respawns = self.pending_respawns.saturating_sub(1);
                if !self.shutting_down && self.deficit() > 0 {
                    self.spawn_worker();
                }
            }
        }
    }

    fn on_message(&mut self, id: WorkerId, message: WorkerMessage) {
        match message {
            WorkerMessage::Ready { pid, addr } => self.on_listening(id, pid, addr),
            WorkerMessage::RequestLimited { requests } => self.on_request_limited(id, requests),
            WorkerMessage::Heartbeat { requests } => {
                if let Some(handle) = self.registry.get_mut(id) {
                    handle.last_heartbeat = Some(Utc::now());
                    handle.request_count = requests;
                }
                debug!(worker = %id, requests, "Heartbeat");
            }
            WorkerMessage::BatchCompleted { report } => {
                if report.failed.is_empty() {
                    debug!(worker = %id, succeeded = report.succeeded.len(), "Batch completed");
                    return;
                }
                for failure in &report.failed {
                    let job = failure.name.as_deref().unwrap_or("<unknown>");
                    warn!(
                        worker = %id,
                        index = failure.index,
                        job,
                        panicked = failure.panicked,
                        error = %failure.error,
                        "Job failed"
                    );
                    metrics::record_job_failure(job);
                }
                self.emit(SupervisorEvent::BatchFailed {
                    id,
                    failures: report.failed,
                });
            }
        }
    }

    fn on_listening(&mut self, id: WorkerId, pid: u32, addr: Option<std::net::SocketAddr>) {
        if !self.registry.mark_listening(id, addr) {
            debug!(worker = %id, "Ready from a worker that is no longer spawning");
            return;
        }

        let epoch = match self.registry.get_mut(id) {
            Some(handle) => {
                handle.pid.get_or_insert(pid);
                handle.epoch
            }
            None => return,
        };

        self.backoff.reset();
        self.ticking = true;

        let pool_size = self.registry.pool_size();
        metrics::update_pool_size(pool_size);
        info!(worker = %id, epoch, pool_size, ?addr, "Worker listening");
        self.emit(SupervisorEvent::WorkerListening { id, epoch, pool_size });

        if self.restarting && epoch == self.epoch {
            let listening = self.registry.listening_in_epoch(self.epoch);
            debug!(epoch, listening, target = self.target, "Restart progress");

            if listening >= self.target {
                for stale in self.registry.stale(self.epoch) {
                    self.drain_worker(stale, DrainReason::Restart);
                }
                self.restarting = false;
                info!(epoch, "Rolling restart completed");
                self.emit(SupervisorEvent::RestartCompleted { epoch });
            }
        }
    }

    fn on_request_limited(&mut self, id: WorkerId, requests: u64) {
        let Some(handle) = self.registry.get(id) else {
            return;
        };

        if self.shutting_down || handle.drain_reason().is_some() || handle.state() >= WorkerState::Draining {
            debug!(worker = %id, requests, "Request limit from a worker already leaving, ignoring");
            return;
        }

        // The epoch being rolled in already counts a replacement for every old worker
        if self.restarting && handle.epoch < self.epoch {
            warn!(worker = %id, requests, "Old-epoch worker over request limit, draining early");
        } else {
            warn!(worker = %id, requests, "Worker over request limit, replacing");
            self.spawn_worker();
        }
        self.drain_worker(id, DrainReason::Overload);
    }

    fn on_disconnected(&mut self, id: WorkerId) {
        let Some(handle) = self.registry.get(id) else {
            return;
        };

        if handle.state() == WorkerState::Draining {
            debug!(worker = %id, "Drain acknowledged");
        } else if handle.state() < WorkerState::Draining {
            warn!(worker = %id, state = %handle.state(), "Worker disconnected unexpectedly");
        }

        if self.registry.mark_dead(id) {
            metrics::update_pool_size(self.registry.pool_size());
        }
    }

    fn on_exited(&mut self, id: WorkerId, code: Option<i32>) {
        let Some(handle) = self.registry.remove(id) else {
            return;
        };
        let expected = handle.drain_reason().is_some();
        metrics::update_pool_size(self.registry.pool_size());

        self.emit(SupervisorEvent::WorkerExited { id, code, expected });

        if expected {
            info!(worker = %id, ?code, "Worker exited");
            self.refill();
        } else {
            warn!(worker = %id, ?code, epoch = handle.epoch, "Worker exited unexpectedly");
            metrics::record_unexpected_exit();
            self.on_failure();
        }
    }

    fn on_drain_expired(&mut self, id: WorkerId) {
        let shutting_down = self.shutting_down;
        let Some(handle) = self.registry.get_mut(id) else {
            return;
        };
        if handle.state() != WorkerState::Draining {
            return;
        }

        error!(
            worker = %id,
            timeout = ?self.config.supervisor.drain_timeout(),
            "Drain timed out, killing worker"
        );
        if handle.kill() {
            self.forced_kills += 1;
            if shutting_down {
                self.straggler_killed = true;
            }
            metrics::record_forced_kill();
            self.emit(SupervisorEvent::WorkerKilled { id });
        }
    }

    // ------------------------------------------------------------------------
    // Cron ticks
    // ------------------------------------------------------------------------

    fn maintenance_tick(&mut self) {
        if self.shutting_down {
            return;
        }
        let recorded = self.triggers.maintain(&self.jobs, self.clock.now());
        if recorded > 0 {
            debug!(recorded, pending = self.triggers.len(), "Trigger map maintained");
        }
    }

    fn dispatch_tick(&mut self) {
        if self.shutting_down {
            return;
        }

        let now = self.clock.now();
        let second = now.timestamp();
        let due = self.triggers.take_due(second);

        let pruned = self.triggers.prune_before(second);
        if pruned > 0 {
            debug!(pruned, "Pruned stale trigger entries");
            self.dispatch.record_pruned(pruned);
            metrics::record_pruned(pruned);
        }

        if due.is_empty() {
            return;
        }

        let pool = self.registry.pool().to_vec();
        if pool.is_empty() {
            warn!(second, jobs = ?due, "No listening workers, dropping due jobs");
            self.dispatch.record_dropped(due.len());
            metrics::record_dispatch(0, due.len());
            self.emit(SupervisorEvent::DispatchDropped { second, jobs: due });
            return;
        }

        let chunks = assign(&due, &pool);
        for (id, indices) in &chunks {
            if let Some(handle) = self.registry.get(*id) {
                if !handle.send(MasterMessage::Tasks {
                    indices: indices.clone(),
                }) {
                    warn!(worker = %id, ?indices, "Failed to send tasks, worker channel closed");
                }
            }
        }

        debug!(second, jobs = due.len(), workers = pool.len(), "Dispatched due jobs");
        self.dispatch.record_dispatch(due.len(), now);
        metrics::record_dispatch(due.len(), 0);
        self.emit(SupervisorEvent::Dispatched { second, chunks });
    }

    fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            epoch: self.epoch,
            target: self.target,
            pool: self.registry.pool().to_vec(),
            workers: self.registry.snapshots(),
            registry: self.registry.stats(),
            restarting: self.restarting,
            shutting_down: self.shutting_down,
            pending_respawns: self.pending_respawns,
            consecutive_failures: self.backoff.failures(),
            forced_kills: self.forced_kills,
            dispatch: self.dispatch.clone(),
            reported_at: Utc::now(),
        }
    }
}
