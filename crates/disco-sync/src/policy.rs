use std::time::Duration;

use disco_core::{Backoff, BackoffKind, FetchJob};

/// Whole-job retry schedule: `base_delay * multiplier^(attempt - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            multiplier: 2,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Honours a job's own backoff override when it carries one.
    pub fn delay_for_job(&self, job: &FetchJob) -> Duration {
        match job.backoff {
            Some(Backoff {
                kind: BackoffKind::Fixed,
                delay_ms,
            }) => Duration::from_millis(delay_ms),
            Some(Backoff {
                kind: BackoffKind::Exponential,
                delay_ms,
            }) => Self {
                base_delay: Duration::from_millis(delay_ms),
                ..*self
            }
            .delay_for_attempt(job.attempt),
            None => self.delay_for_attempt(job.attempt),
        }
    }
}
