//! Refork delay after unexpected worker exits
//!
//! The delay for the n-th consecutive failure is `base × 2^(n-1)`, clamped
//! to `max`, with equal jitter applied on top so that several crashed
//! workers do not come back in lockstep. The base is recomputed from the
//! failure count each time; jitter never feeds into the next delay.

use rand::Rng;
use std::time::Duration;

use crate::config::SupervisorConfig;

/// What to do after an unexpected exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Refork after this delay
    Retry(Duration),

    /// Failure budget exhausted
    GiveUp { failures: u32 },
}

/// Consecutive-failure tracker with exponential backoff
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    max_failures: u32,
    failures: u32,
}

impl RestartBackoff {
    /// Create a backoff with jitter enabled
    pub fn new(base: Duration, max: Duration, max_failures: u32) -> Self {
        Self {
            base,
            max,
            factor: 2.0,
            jitter: true,
            max_failures,
            failures: 0,
        }
    }

    /// Build from supervisor settings
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.restart_backoff_base_ms),
            Duration::from_millis(config.restart_backoff_max_ms),
            config.max_consecutive_failures,
        )
    }

    /// Disable jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Clamped delay for a 0-based attempt, before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);

        if !secs.is_finite() || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Record one unexpected exit
    pub fn record_failure(&mut self) -> BackoffDecision {
        self.failures = self.failures.saturating_add(1);

        if self.failures > self.max_failures {
            return BackoffDecision::GiveUp {
                failures: self.failures,
            };
        }

        let delay = self.base_delay(self.failures - 1);
        BackoffDecision::Retry(if self.jitter { equal_jitter(delay) } else { delay })
    }

    /// A worker reached Listening
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures so far
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// `delay/2 + random[0, delay/2]`
fn equal_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    let half = ms / 2;
    if half == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(max_failures: u32) -> RestartBackoff {
        RestartBackoff::new(Duration::from_millis(250), Duration::from_secs(30), max_failures)
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let mut policy = backoff(10).without_jitter();
        assert_eq!(policy.record_failure(), BackoffDecision::Retry(Duration::from_millis(250)));
        assert_eq!(policy.record_failure(), BackoffDecision::Retry(Duration::from_millis(500)));
        assert_eq!(policy.record_failure(), BackoffDecision::Retry(Duration::from_millis(1000)));
        assert_eq!(policy.failures(), 3);
    }

    #[test]
    fn test_clamped_to_max() {
        let policy = backoff(10);
        assert_eq!(policy.base_delay(20), Duration::from_secs(30));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut policy = backoff(100);
        for attempt in 0..8 {
            let base = policy.base_delay(attempt);
            match policy.record_failure() {
                BackoffDecision::Retry(delay) => {
                    assert!(delay >= base / 2, "{delay:?} below half of {base:?}");
                    assert!(delay <= base, "{delay:?} above {base:?}");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_gives_up_after_budget() {
        let mut policy = backoff(2);
        assert!(matches!(policy.record_failure(), BackoffDecision::Retry(_)));
        assert!(matches!(policy.record_failure(), BackoffDecision::Retry(_)));
        assert_eq!(policy.record_failure(), BackoffDecision::GiveUp { failures: 3 });
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut policy = backoff(2).without_jitter();
        policy.record_failure();
        policy.record_failure();
        policy.reset();
        assert_eq!(policy.failures(), 0);
        assert_eq!(policy.record_failure(), BackoffDecision::Retry(Duration::from_millis(250)));
    }
}
