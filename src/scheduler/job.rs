//! Job descriptors and cron parsing
//!
//! A [`JobList`] is built once per process from the same job constructors in
//! both roles, so a job index means the same job in the master and in every
//! worker. Indices are the only thing that crosses the process boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use super::error::{SchedulerError, SchedulerResult};

// ============================================================================
// Job Trait
// ============================================================================

/// A unit of work the cluster can trigger.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Stable name used in logs and batch reports
    fn name(&self) -> &str;

    /// Cron expression (5, 6 or 7 fields). `None` means never scheduled.
    fn cron(&self) -> Option<&str> {
        None
    }

    /// Run the job once
    async fn invoke(&self) -> anyhow::Result<()>;
}

/// Closure-backed [`Job`]
pub struct FnJob<F> {
    name: String,
    cron: Option<String>,
    func: F,
}

impl<F, Fut> FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    /// Create a job that is never scheduled by cron
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            cron: None,
            func,
        }
    }

    /// Create a cron-scheduled job
    pub fn cron(name: impl Into<String>, expression: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            cron: Some(expression.into()),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn cron(&self) -> Option<&str> {
        self.cron.as_deref()
    }

    async fn invoke(&self) -> anyhow::Result<()> {
        (self.func)().await
    }
}

// ============================================================================
// Cron Schedule
// ============================================================================

/// Parsed cron expression
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse a cron expression.
    ///
    /// Classic 5-field expressions (minute resolution) get a `0` seconds
    /// field prepended; 6- and 7-field expressions are taken as-is.
    pub fn parse(job: &str, expression: &str) -> SchedulerResult<Self> {
        let fields = expression.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", expression.trim()),
            6 | 7 => expression.trim().to_string(),
            n => {
                return Err(SchedulerError::invalid_cron(
                    job,
                    expression,
                    format!("expected 5, 6 or 7 fields, found {n}"),
                ))
            }
        };

        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| SchedulerError::invalid_cron(job, expression, e.to_string()))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// Original expression
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }
}

// ============================================================================
// Job Descriptor
// ============================================================================

/// Immutable, indexed view of a job shared by master and worker
#[derive(Clone)]
pub struct JobDescriptor {
    index: usize,
    name: String,
    schedule: Option<CronSchedule>,
    job: Arc<dyn Job>,
}

impl JobDescriptor {
    /// Position of the job in its [`JobList`]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Job name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parsed cron schedule, if any
    pub fn schedule(&self) -> Option<&CronSchedule> {
        self.schedule.as_ref()
    }

    /// Invoke capability
    pub fn job(&self) -> Arc<dyn Job> {
        Arc::clone(&self.job)
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("cron", &self.schedule.as_ref().map(|s| s.expression()))
            .finish()
    }
}

// ============================================================================
// Job List
// ============================================================================

/// Static, ordered job list
#[derive(Debug, Clone, Default)]
pub struct JobList {
    jobs: Vec<JobDescriptor>,
}

impl JobList {
    /// Build the list, parsing every cron expression up front
    pub fn new(jobs: Vec<Arc<dyn Job>>) -> SchedulerResult<Self> {
        let jobs = jobs
            .into_iter()
            .enumerate()
            .map(|(index, job)| {
                let name = job.name().to_string();
                let schedule = job
                    .cron()
                    .map(|expr| CronSchedule::parse(&name, expr))
                    .transpose()?;
                Ok(JobDescriptor {
                    index,
                    name,
                    schedule,
                    job,
                })
            })
            .collect::<SchedulerResult<Vec<_>>>()?;

        Ok(Self { jobs })
    }

    /// Empty job list (request-serving only cluster)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a job by index
    pub fn get(&self, index: usize) -> SchedulerResult<&JobDescriptor> {
        self.jobs
            .get(index)
            .ok_or_else(|| SchedulerError::unknown_job(index, self.jobs.len()))
    }

    /// Number of jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Iterate over all jobs
    pub fn iter(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.iter()
    }

    /// Iterate over jobs that carry a cron schedule
    pub fn scheduled(&self) -> impl Iterator<Item = (usize, &CronSchedule)> {
        self.jobs
            .iter()
            .filter_map(|job| job.schedule.as_ref().map(|s| (job.index, s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noop(name: &str, cron: Option<&str>) -> Arc<dyn Job> {
        match cron {
            Some(expr) => Arc::new(FnJob::cron(name, expr, || async { Ok(()) })) as Arc<dyn Job>,
            None => Arc::new(FnJob::new(name, || async { Ok(()) })),
        }
    }

    #[test]
    fn test_parse_six_field_expression() {
        let schedule = CronSchedule::parse("tick", "* * * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let next = schedule.next_after(&base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 1).unwrap());
    }

    #[test]
    fn test_parse_five_field_expression_fires_on_minute() {
        let schedule = CronSchedule::parse("minutely", "* * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 30).unwrap();
        let next = schedule.next_after(&base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 12, 1, 0).unwrap());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CronSchedule::parse("bad", "not a cron").is_err());
        assert!(CronSchedule::parse("bad", "* *").is_err());
        assert!(CronSchedule::parse("bad", "99 * * * * *").is_err());
    }

    #[test]
    fn test_job_list_indices_and_schedules() {
        let list = JobList::new(vec![
            noop("a", Some("* * * * * *")),
            noop("b", None),
            noop("c", Some("*/5 * * * * *")),
        ])
        .unwrap();

        assert_eq!(list.len(), 3);
        assert_eq!(list.get(1).unwrap().name(), "b");
        assert!(list.get(1).unwrap().schedule().is_none());

        let scheduled: Vec<usize> = list.scheduled().map(|(i, _)| i).collect();
        assert_eq!(scheduled, vec![0, 2]);
    }

    #[test]
    fn test_job_list_invalid_cron_fails_fast() {
        let err = JobList::new(vec![noop("broken", Some("every day"))]).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { ref job, .. } if job == "broken"));
    }

    #[test]
    fn test_job_list_unknown_index() {
        let list = JobList::empty();
        assert!(list.is_empty());
        assert_eq!(list.get(0).unwrap_err(), SchedulerError::unknown_job(0, 0));
    }

    #[tokio::test]
    async fn test_fn_job_invoke() {
        let job = FnJob::new("fails", || async { anyhow::bail!("boom") });
        let err = job.invoke().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
