use std::time::Duration;

use jiff::Timestamp;

use crate::jobs::error::JobError;
use crate::jobs::types::add_duration;

/// What the dispatcher does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back to PENDING after `delay`, with `attempts` as the new counter.
    Retry { attempts: i32, delay: Duration },
    /// FAILED plus a dead letter entry.
    DeadLetter { attempts: i32 },
    Cancel,
}

/// Exponential backoff with a cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).max(0);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decides the fate of a job that failed with `error`.
    ///
    /// `attempts` is the counter before this attempt. `delay_hint` overrides
    /// the error's own hint (the limiter's computed back-off for provider
    /// rejections).
    pub fn decide(
        &self,
        attempts: i32,
        max_attempts: i32,
        error: &JobError,
        delay_hint: Option<Duration>,
    ) -> Disposition {
        if matches!(error, JobError::Cancelled) {
            return Disposition::Cancel;
        }

        let attempts = if error.consumes_attempt() {
            attempts + 1
        } else {
            attempts
        };

        if !error.is_retryable() {
            return Disposition::DeadLetter { attempts };
        }
        if error.consumes_attempt() && attempts >= max_attempts {
            return Disposition::DeadLetter { attempts };
        }

        let delay = delay_hint
            .or_else(|| error.retry_hint())
            .unwrap_or_else(|| self.backoff(attempts));

        Disposition::Retry { attempts, delay }
    }
}

/// Next `scheduled_for` after a requeue; never moves backwards.
pub fn next_run(previous: Timestamp, now: Timestamp, delay: Duration) -> Timestamp {
    previous.max(add_duration(now, delay))
}
