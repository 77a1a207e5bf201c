//! Integration tests for cron fan-out scheduling
//!
//! These tests verify the complete workflow of:
//! - Job list construction and cron validation
//! - Trigger map maintenance driven by the scheduler clock
//! - Dispatch and partitioning across a pool
//! - Pruning of missed seconds

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use forkline::scheduler::{
    assign, partition, FnJob, Job, JobList, SchedulerClock, SchedulerError, TriggerMap,
};
use std::sync::Arc;
use std::time::Duration;

fn job(name: &str, cron: &str) -> Arc<dyn Job> {
    Arc::new(FnJob::cron(name, cron, || async { Ok(()) }))
}

fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + TimeDelta::milliseconds(250)
}

// ============================================================================
// Job List Tests
// ============================================================================

#[test]
fn test_job_indices_follow_registration_order() {
    let jobs = JobList::new(vec![
        job("fetch_video", "* * * * * *"),
        job("notice_user", "*/5 * * * * *"),
        Arc::new(FnJob::new("manual", || async { Ok(()) })),
    ])
    .unwrap();

    assert_eq!(jobs.len(), 3);
    assert_eq!(jobs.get(0).unwrap().name(), "fetch_video");
    assert_eq!(jobs.get(1).unwrap().name(), "notice_user");
    assert!(jobs.get(2).unwrap().schedule().is_none());
    assert_eq!(jobs.scheduled().count(), 2);
}

#[test]
fn test_invalid_cron_fails_at_startup() {
    let err = JobList::new(vec![job("ok", "* * * * * *"), job("broken", "every minute")])
        .unwrap_err();

    assert!(matches!(err, SchedulerError::InvalidCron { ref job, .. } if job == "broken"));
}

// ============================================================================
// Tick Simulation Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_every_second_jobs_dispatch_each_second() {
    let jobs = JobList::new(vec![job("a", "* * * * * *"), job("b", "* * * * * *")]).unwrap();
    let clock = SchedulerClock::starting_at(anchor());
    let mut triggers = TriggerMap::new();
    let pool = ["w1", "w2", "w3"];

    let mut dispatched = Vec::new();
    for _ in 0..5 {
        triggers.maintain(&jobs, clock.now());
        tokio::time::advance(Duration::from_secs(1)).await;

        let second = clock.now().timestamp();
        let due = triggers.take_due(second);
        triggers.prune_before(second);
        dispatched.push(assign(&due, &pool));
    }

    for chunks in &dispatched {
        let sizes: Vec<usize> = chunks.iter().map(|(_, c)| c.len()).collect();
        assert_eq!(sizes, vec![1, 1, 0]);
        assert_eq!(chunks[0], ("w1", vec![0]));
        assert_eq!(chunks[1], ("w2", vec![1]));
    }
}

#[tokio::test(start_paused = true)]
async fn test_repeated_maintenance_is_idempotent() {
    let jobs = JobList::new(vec![job("every_ten", "*/10 * * * * *")]).unwrap();
    let clock = SchedulerClock::starting_at(anchor());
    let mut triggers = TriggerMap::new();

    assert_eq!(triggers.maintain(&jobs, clock.now()), 1);
    let scheduled = triggers.scheduled_second(0).unwrap();

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(triggers.maintain(&jobs, clock.now()), 0);
    }

    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers.scheduled_second(0), Some(scheduled));
    assert_eq!(scheduled % 10, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missed_seconds_are_pruned_not_replayed() {
    let jobs = JobList::new(vec![job("a", "* * * * * *")]).unwrap();
    let clock = SchedulerClock::starting_at(anchor());
    let mut triggers = TriggerMap::new();

    triggers.maintain(&jobs, clock.now());

    // The dispatch tick stalls for three seconds
    tokio::time::advance(Duration::from_secs(3)).await;
    let second = clock.now().timestamp();

    assert!(triggers.take_due(second).is_empty());
    assert_eq!(triggers.prune_before(second), 1);
    assert!(triggers.is_empty());

    // Maintenance resumes from the present
    triggers.maintain(&jobs, clock.now());
    assert_eq!(triggers.scheduled_second(0), Some(second + 1));
}

// ============================================================================
// Partition Tests
// ============================================================================

#[test]
fn test_partition_more_jobs_than_workers() {
    let due: Vec<usize> = (0..7).collect();
    let chunks = partition(&due, 3).unwrap();

    assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4], vec![5, 6]]);
    assert_eq!(chunks.concat(), due);
}

#[test]
fn test_partition_empty_pool_is_an_error() {
    assert_eq!(partition(&[0, 1], 0), Err(SchedulerError::EmptyPool));
    assert!(assign::<u64>(&[0, 1], &[]).is_empty());
}
