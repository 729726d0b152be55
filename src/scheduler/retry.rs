//! Bounded retry policy with capped exponential backoff

use chrono::Duration;
use vidpair_core::WorkerFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    cap: Duration,
}

/// What to do with a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after `delay`
    Retry { delay: Duration },
    /// Stop and hand the chunk to an operator
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `base * 2^attempts`, never more than `cap`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1_i64.checked_shl(attempts.min(32)).unwrap_or(i64::MAX);
        let delay_ms = self
            .base
            .num_milliseconds()
            .saturating_mul(factor)
            .min(self.cap.num_milliseconds());
        Duration::milliseconds(delay_ms)
    }

    /// Decide after a failure; `attempts` already counts the failed attempt
    pub fn decide(&self, failure: &WorkerFailure, attempts: u32) -> RetryDecision {
        if failure.is_fatal() || attempts >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        if !failure.consumes_attempt() {
            return RetryDecision::Retry {
                delay: Duration::zero(),
            };
        }
        RetryDecision::Retry {
            delay: self.backoff(attempts),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::seconds(30), Duration::hours(1))
    }
}
