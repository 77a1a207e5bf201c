//! Per-second trigger bookkeeping
//!
//! The [`TriggerMap`] maps an absolute unix second to the set of job indices
//! due in that second. It is filled by the maintenance tick and drained by the
//! dispatch tick; both ticks run on the Supervisor's control loop, so the map
//! is never shared across threads.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::time::Instant;

use super::job::JobList;

// ============================================================================
// Scheduler Clock
// ============================================================================

/// Wall clock anchored once and advanced by tokio's monotonic clock.
///
/// Cron occurrences are wall-clock seconds, but the ticks that look them up
/// are tokio timers. Deriving "now" from the tokio clock keeps the two in step
/// (including under `tokio::time::pause`) and makes the scheduler immune to
/// wall-clock jumps while the master runs.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerClock {
    wall: DateTime<Utc>,
    instant: Instant,
}

impl SchedulerClock {
    /// Anchor at the current wall-clock time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchor at a fixed wall-clock time
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            instant: Instant::now(),
        }
    }

    /// Current time
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.instant.elapsed()).unwrap_or_else(|_| TimeDelta::zero());
        self.wall + elapsed
    }
}

impl Default for SchedulerClock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Trigger Map
// ============================================================================

/// Absolute second → due job indices
#[derive(Debug, Default)]
pub struct TriggerMap {
    entries: BTreeMap<i64, BTreeSet<usize>>,

    /// Last occurrence recorded for each job
    cursors: HashMap<usize, i64>,
}

impl TriggerMap {
    /// Create an empty trigger map
    pub fn new() -> Self {
        Self::default()
    }

    /// Maintenance tick.
    ///
    /// Records the next occurrence of every scheduled job whose previously
    /// recorded occurrence is not still in the future. A job with a pending
    /// future entry is left untouched, so running this repeatedly before that
    /// second arrives changes nothing. Returns the number of new entries.
    pub fn maintain(&mut self, jobs: &JobList, now: DateTime<Utc>) -> usize {
        let now_sec = now.timestamp();
        let mut recorded = 0;

        for (index, schedule) in jobs.scheduled() {
            let cursor = self.cursors.get(&index).copied();
            if matches!(cursor, Some(second) if second > now_sec) {
                continue;
            }

            // Never look for an occurrence at or before the current second:
            // that second belongs to the dispatch tick.
            let from_sec = cursor.map_or(now_sec, |second| second.max(now_sec));
            let Some(from) = DateTime::from_timestamp(from_sec, 0) else {
                continue;
            };

            if let Some(next) = schedule.next_after(&from) {
                let second = next.timestamp();
                self.entries.entry(second).or_default().insert(index);
                self.cursors.insert(index, second);
                recorded += 1;
            }
        }

        recorded
    }

    /// Remove and return the job indices due in `second`, in index order
    pub fn take_due(&mut self, second: i64) -> Vec<usize> {
        self.entries
            .remove(&second)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop every entry older than `second`.
    ///
    /// Returns the number of job occurrences discarded. Those occurrences are
    /// lost for good: missed ticks are never replayed.
    pub fn prune_before(&mut self, second: i64) -> usize {
        let keep = self.entries.split_off(&second);
        let pruned = std::mem::replace(&mut self.entries, keep);
        pruned.values().map(BTreeSet::len).sum()
    }

    /// Indices recorded for `second`, without removing them
    pub fn due_at(&self, second: i64) -> Option<&BTreeSet<usize>> {
        self.entries.get(&second)
    }

    /// Last second recorded for a job
    pub fn scheduled_second(&self, index: usize) -> Option<i64> {
        self.cursors.get(&index).copied()
    }

    /// Number of distinct seconds with pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{FnJob, Job};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn jobs(exprs: &[Option<&str>]) -> JobList {
        let jobs = exprs
            .iter()
            .enumerate()
            .map(|(i, expr)| -> Arc<dyn Job> {
                let name = format!("job-{i}");
                match expr {
                    Some(e) => Arc::new(FnJob::cron(name, *e, || async { Ok(()) })),
                    None => Arc::new(FnJob::new(name, || async { Ok(()) })),
                }
            })
            .collect();
        JobList::new(jobs).unwrap()
    }

    fn at(h: u32, m: u32, s: u32, ms: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap() + TimeDelta::milliseconds(ms as i64)
    }

    #[test]
    fn test_maintain_records_next_second() {
        let list = jobs(&[Some("* * * * * *"), None]);
        let mut map = TriggerMap::new();

        let now = at(12, 0, 0, 300);
        assert_eq!(map.maintain(&list, now), 1);

        let next = now.timestamp() + 1;
        assert_eq!(map.due_at(next).unwrap().iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(map.scheduled_second(0), Some(next));
        assert_eq!(map.scheduled_second(1), None);
    }

    #[test]
    fn test_maintain_is_idempotent_before_due_second() {
        let list = jobs(&[Some("*/10 * * * * *"), Some("* * * * * *")]);
        let mut map = TriggerMap::new();

        map.maintain(&list, at(12, 0, 1, 0));
        let first_10s = map.scheduled_second(0);

        // Same second and a later second before the 10s boundary
        assert_eq!(map.maintain(&list, at(12, 0, 1, 500)), 0);
        assert_eq!(map.scheduled_second(0), first_10s);
        assert_eq!(map.due_at(first_10s.unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn test_per_second_job_never_skips_a_second() {
        let list = jobs(&[Some("* * * * * *")]);
        let mut map = TriggerMap::new();
        let mut dispatched = Vec::new();

        for s in 0..5 {
            let now = at(12, 0, s, 400);
            map.maintain(&list, now);
            if !map.take_due(now.timestamp()).is_empty() {
                dispatched.push(now.timestamp());
            }
        }

        let base = at(12, 0, 0, 0).timestamp();
        assert_eq!(dispatched, vec![base + 1, base + 2, base + 3, base + 4]);
    }

    #[test]
    fn test_take_due_removes_entry() {
        let list = jobs(&[Some("* * * * * *"), Some("* * * * * *")]);
        let mut map = TriggerMap::new();
        let now = at(8, 30, 0, 0);
        map.maintain(&list, now);

        let due = map.take_due(now.timestamp() + 1);
        assert_eq!(due, vec![0, 1]);
        assert!(map.take_due(now.timestamp() + 1).is_empty());
        assert!(map.is_empty());
    }

    #[test]
    fn test_prune_before_bounds_memory() {
        let list = jobs(&[Some("* * * * * *")]);
        let mut map = TriggerMap::new();

        // Maintenance keeps running while nothing dispatches
        for s in 0..10 {
            map.maintain(&list, at(12, 0, s, 0));
        }
        assert_eq!(map.len(), 10);

        let pruned = map.prune_before(at(12, 0, 9, 0).timestamp());
        assert_eq!(pruned, 8);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_resumes_after_gap_without_backfill() {
        let list = jobs(&[Some("* * * * * *")]);
        let mut map = TriggerMap::new();
        map.maintain(&list, at(12, 0, 0, 0));

        // Ten seconds with no maintenance: the stale entry is not replayed
        let now = at(12, 0, 10, 0);
        map.maintain(&list, now);
        assert_eq!(map.scheduled_second(0), Some(now.timestamp() + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_clock_follows_tokio_time() {
        let start = at(12, 0, 0, 0);
        let clock = SchedulerClock::starting_at(start);
        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        assert_eq!(clock.now().timestamp(), start.timestamp() + 3);
    }
}
