//! Worker handles and the listening pool
//!
//! The registry is owned by the Supervisor's control loop and never shared,
//! so it needs no locking. Pool order is the order in which workers reached
//! Listening; dispatch assigns chunks by that position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::ipc::MasterMessage;

// ============================================================================
// Identifiers and States
// ============================================================================

/// Supervisor-assigned worker identifier, unique for the master's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Worker lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Launched, not yet bound
    Spawning,

    /// Bound and part of the pool
    Listening,

    /// `Stop` sent, kill timer running
    Draining,

    /// Disconnected; terminal
    Dead,
}

impl WorkerState {
    /// Move to `next` if it is later in the lifecycle. Returns whether the state changed.
    pub fn advance(&mut self, next: WorkerState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    /// Not yet Dead
    pub fn is_live(&self) -> bool {
        *self != Self::Dead
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Spawning => "spawning",
            Self::Listening => "listening",
            Self::Draining => "draining",
            Self::Dead => "dead",
        };
        write!(f, "{label}")
    }
}

/// Why a worker is being drained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainReason {
    /// Replaced by a newer epoch
    Restart,

    /// Reported `RequestLimited`
    Overload,

    /// Master shutting down
    Shutdown,
}

impl DrainReason {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Overload => "overload",
            Self::Shutdown => "shutdown",
        }
    }
}

// ============================================================================
// Worker Handle
// ============================================================================

/// The Supervisor's view of one worker
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub epoch: u64,
    pub spawned_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub addr: Option<SocketAddr>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub request_count: u64,
    state: WorkerState,
    drain_reason: Option<DrainReason>,
    outbox: mpsc::UnboundedSender<MasterMessage>,
    kill: Option<oneshot::Sender<()>>,
    drain_timer: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Create a handle for a freshly launched worker
    pub fn new(
        id: WorkerId,
        epoch: u64,
        pid: Option<u32>,
        outbox: mpsc::UnboundedSender<MasterMessage>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            pid,
            epoch,
            spawned_at: Utc::now(),
            connected_at: None,
            addr: None,
            last_heartbeat: None,
            request_count: 0,
            state: WorkerState::Spawning,
            drain_reason: None,
            outbox,
            kill: Some(kill),
            drain_timer: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Set once the worker has been told to stop
    pub fn drain_reason(&self) -> Option<DrainReason> {
        self.drain_reason
    }

    /// Send a message. Returns `false` if the worker's channel is gone.
    pub fn send(&self, message: MasterMessage) -> bool {
        self.outbox.send(message).is_ok()
    }

    /// Request a forced kill. Returns `false` if one was already requested.
    pub fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }

    /// Attach the drain kill timer, replacing any previous one
    pub fn set_drain_timer(&mut self, timer: JoinHandle<()>) {
        self.cancel_drain_timer();
        self.drain_timer = Some(timer);
    }

    /// Abort the drain kill timer if one is running
    pub fn cancel_drain_timer(&mut self) {
        if let Some(timer) = self.drain_timer.take() {
            timer.abort();
        }
    }

    /// Serializable point-in-time view
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            pid: self.pid,
            epoch: self.epoch,
            state: self.state,
            drain_reason: self.drain_reason,
            spawned_at: self.spawned_at,
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
            request_count: self.request_count,
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel_drain_timer();
    }
}

/// Point-in-time copy of a [`WorkerHandle`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub epoch: u64,
    pub state: WorkerState,
    pub drain_reason: Option<DrainReason>,
    pub spawned_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub request_count: u64,
}

// ============================================================================
// Worker Registry
// ============================================================================

/// All known workers plus the ordered listening pool
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<WorkerId, WorkerHandle>,
    pool: Vec<WorkerId>,
    last_id: u64,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next worker id
    pub fn next_id(&mut self) -> WorkerId {
        self.last_id += 1;
        WorkerId(self.last_id)
    }

    /// Track a new handle
    pub fn insert(&mut self, handle: WorkerHandle) {
        self.workers.insert(handle.id, handle);
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(&id)
    }

    /// Forget a worker entirely
    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        self.pool.retain(|w| *w != id);
        self.workers.remove(&id)
    }

    /// Spawning → Listening; joins the pool at the end
    pub fn mark_listening(&mut self, id: WorkerId, addr: Option<SocketAddr>) -> bool {
        let Some(handle) = self.workers.get_mut(&id) else {
            return false;
        };
        if !handle.state.advance(WorkerState::Listening) {
            return false;
        }
        handle.connected_at = Some(Utc::now());
        handle.addr = addr;
        self.pool.push(id);
        true
    }

    /// → Draining; leaves the pool. `false` if already draining or dead.
    pub fn mark_draining(&mut self, id: WorkerId, reason: DrainReason) -> bool {
        let Some(handle) = self.workers.get_mut(&id) else {
            return false;
        };
        if !handle.state.advance(WorkerState::Draining) {
            return false;
        }
        handle.drain_reason = Some(reason);
        self.pool.retain(|w| *w != id);
        true
    }

    /// → Dead; leaves the pool and stops the kill timer. `true` only the first time.
    pub fn mark_dead(&mut self, id: WorkerId) -> bool {
        let Some(handle) = self.workers.get_mut(&id) else {
            return false;
        };
        if !handle.state.advance(WorkerState::Dead) {
            return false;
        }
        handle.cancel_drain_timer();
        self.pool.retain(|w| *w != id);
        true
    }

    /// Listening workers in pool order
    pub fn pool(&self) -> &[WorkerId] {
        &self.pool
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Workers not yet Dead, in any epoch
    pub fn live_count(&self) -> usize {
        self.workers.values().filter(|h| h.state.is_live()).count()
    }

    /// Workers of `epoch` that are neither draining nor dead
    pub fn active_in_epoch(&self, epoch: u64) -> usize {
        self.workers
            .values()
            .filter(|h| h.epoch == epoch && h.state < WorkerState::Draining)
            .count()
    }

    /// Listening workers of `epoch`
    pub fn listening_in_epoch(&self, epoch: u64) -> usize {
        self.workers
            .values()
            .filter(|h| h.epoch == epoch && h.state == WorkerState::Listening)
            .count()
    }

    /// Workers from epochs before `epoch` that have not been told to stop
    pub fn stale(&self, epoch: u64) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|h| h.epoch < epoch && h.state < WorkerState::Draining)
            .map(|h| h.id)
            .collect()
    }

    /// Workers that have not been told to stop
    pub fn undrained(&self) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|h| h.state < WorkerState::Draining)
            .map(|h| h.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Snapshots of every handle, by id
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers.values().map(WorkerHandle::snapshot).collect()
    }

    /// Count handles per state
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.workers.len(),
            ..Default::default()
        };

        for handle in self.workers.values() {
            match handle.state {
                WorkerState::Spawning => stats.spawning += 1,
                WorkerState::Listening => stats.listening += 1,
                WorkerState::Draining => stats.draining += 1,
                WorkerState::Dead => stats.dead += 1,
            }
        }

        stats
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub spawning: usize,
    pub listening: usize,
    pub draining: usize,
    pub dead: usize,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} workers ({} spawning, {} listening, {} draining, {} dead)",
            self.total, self.spawning, self.listening, self.draining, self.dead
        )
    }
}
