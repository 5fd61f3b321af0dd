//! Retry policies.
//!
//! Two layers exist:
//!
//! - [`StageRetryPolicy`]: in-process retries of a single stage, with
//!   exponential/linear/constant backoff and optional jitter. Used by the
//!   durable workflow engine.
//! - [`BackoffSchedule`]: a fixed list of delays used between job-level
//!   attempts (and notification deliveries). Attempt `n` waits
//!   `delays[n - 1]`, clamped to the last entry.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(retry - 1)
    #[default]
    Exponential,
    /// delay = base * retry
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy applied on top of the backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Per-stage retry and timeout policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for StageRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }
}

impl StageRetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` failed.
    #[must_use]
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let retry = attempt.max(1);
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.backoff {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(retry - 1)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry)).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// A fixed list of delays between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackoffSchedule {
    delays_secs: Vec<u64>,
}

impl BackoffSchedule {
    /// Creates a schedule from delays in seconds.
    #[must_use]
    pub fn from_secs(delays: impl IntoIterator<Item = u64>) -> Self {
        Self {
            delays_secs: delays.into_iter().collect(),
        }
    }

    /// The job-level schedule: 1, 5 and 15 minutes.
    #[must_use]
    pub fn job_default() -> Self {
        Self::from_secs([60, 300, 900])
    }

    /// The notification schedule: 1, 2 and 4 minutes.
    #[must_use]
    pub fn notification_default() -> Self {
        Self::from_secs([60, 120, 240])
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    ///
    /// Attempts beyond the schedule reuse its last entry; an empty schedule
    /// means no delay.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.max(1) - 1).unwrap_or(usize::MAX);
        let secs = self
            .delays_secs
            .get(index)
            .or_else(|| self.delays_secs.last())
            .copied()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }

    /// Returns true if the schedule has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays_secs.is_empty()
    }

    /// The delays in seconds.
    #[must_use]
    pub fn as_secs(&self) -> &[u64] {
        &self.delays_secs
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::job_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = StageRetryPolicy::default()
            .with_max_attempts(4)
            .with_base_delay_ms(100)
            .with_max_delay_ms(250);

        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(250));
    }

    #[test]
    fn test_linear_and_constant_backoff() {
        let linear = StageRetryPolicy::default()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.delay_after(3), Duration::from_millis(300));

        let constant = linear.with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.delay_after(3), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let full = StageRetryPolicy::default()
            .with_base_delay_ms(1000)
            .with_jitter(JitterStrategy::Full);
        let equal = full.clone().with_jitter(JitterStrategy::Equal);

        for _ in 0..50 {
            assert!(full.delay_after(1) <= Duration::from_millis(1000));
            let d = equal.delay_after(1);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_allows_retry_after() {
        let policy = StageRetryPolicy::default().with_max_attempts(3);
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
        assert!(!StageRetryPolicy::none().allows_retry_after(1));
    }

    #[test]
    fn test_job_schedule() {
        let schedule = BackoffSchedule::job_default();
        assert_eq!(schedule.delay_for(1), Duration::from_secs(60));
        assert_eq!(schedule.delay_for(2), Duration::from_secs(300));
        assert_eq!(schedule.delay_for(3), Duration::from_secs(900));
        assert_eq!(schedule.delay_for(7), Duration::from_secs(900));
    }

    #[test]
    fn test_empty_schedule_is_immediate() {
        let schedule = BackoffSchedule::from_secs([]);
        assert!(schedule.is_empty());
        assert_eq!(schedule.delay_for(1), Duration::ZERO);
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: StageRetryPolicy = serde_json::from_value(serde_json::json!({
            "max_attempts": 3,
            "base_delay_ms": 10,
            "max_delay_ms": 100
        }))
        .unwrap();
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert_eq!(policy.jitter, JitterStrategy::None);
    }
}
