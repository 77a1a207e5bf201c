//! Fan-out of due jobs across the listening pool
//!
//! Assignment is static: the due-index array is cut into contiguous chunks
//! and chunk `i` goes to the worker at pool position `i`. It is not load
//! aware; a slow worker keeps receiving its share.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{SchedulerError, SchedulerResult};

// ============================================================================
// Partitioning
// ============================================================================

/// Largest chunk size for `len` items over `pool_size` workers (`ceil(len / pool_size)`)
pub fn chunk_size(len: usize, pool_size: usize) -> usize {
    if pool_size == 0 {
        0
    } else {
        len.div_ceil(pool_size)
    }
}

/// Split `due` into exactly `pool_size` contiguous chunks.
///
/// No chunk is larger than [`chunk_size`] and sizes differ by at most one;
/// trailing chunks may be empty when there are fewer jobs than workers.
/// Concatenating the chunks yields `due` unchanged.
///
/// Unlike fixed `chunk_size` slicing, which gives 4 jobs over 3 workers as
/// `[2, 2, 0]`, the remainder is spread one per chunk: `[2, 1, 1]`.
pub fn partition(due: &[usize], pool_size: usize) -> SchedulerResult<Vec<Vec<usize>>> {
    if pool_size == 0 {
        return Err(SchedulerError::EmptyPool);
    }

    let base = due.len() / pool_size;
    let extra = due.len() % pool_size;

    let chunks = (0..pool_size)
        .map(|i| {
            let start = i * base + i.min(extra);
            let len = base + usize::from(i < extra);
            due[start..start + len].to_vec()
        })
        .collect();

    Ok(chunks)
}

/// Pair each pool member with its chunk. An empty pool yields no assignments.
pub fn assign<W: Clone>(due: &[usize], pool: &[W]) -> Vec<(W, Vec<usize>)> {
    match partition(due, pool.len()) {
        Ok(chunks) => pool.iter().cloned().zip(chunks).collect(),
        Err(_) => Vec::new(),
    }
}

// ============================================================================
// Dispatch Statistics
// ============================================================================

/// Counters for the dispatch tick
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Dispatch ticks that found due jobs
    pub active_ticks: u64,

    /// Job occurrences sent to workers
    pub jobs_dispatched: u64,

    /// Job occurrences dropped because the pool was empty
    pub jobs_dropped: u64,

    /// Job occurrences pruned because their second passed undispatched
    pub jobs_pruned: u64,

    /// Last tick that sent work
    pub last_dispatch: Option<DateTime<Utc>>,
}

impl DispatchStats {
    /// Record a tick that sent `count` occurrences
    pub fn record_dispatch(&mut self, count: usize, at: DateTime<Utc>) {
        self.active_ticks += 1;
        self.jobs_dispatched += count as u64;
        self.last_dispatch = Some(at);
    }

    /// Record occurrences dropped for lack of workers
    pub fn record_dropped(&mut self, count: usize) {
        self.active_ticks += 1;
        self.jobs_dropped += count as u64;
    }

    /// Record occurrences pruned from the trigger map
    pub fn record_pruned(&mut self, count: usize) {
        self.jobs_pruned += count as u64;
    }
}
