//! Continuous-refill token bucket.
//!
//! Monotonic time comes from `tokio::time::Instant`, so the bucket follows a
//! paused test clock. Wall-clock time is only used at the persistence edge
//! (`record` / `restore`).

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Absorbs float rounding when a sleep lands exactly on the refill boundary.
const EPSILON: f64 = 1e-9;

/// Persisted state of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub name: String,
    pub tokens: f64,
    pub last_refill_time: Timestamp,
}

/// Point-in-time view of a bucket for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub name: String,
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    pub last_refill_time: Timestamp,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).clamp(0.0, capacity);
        self.last_refill = now;
    }
}

/// Token bucket with a fixed capacity and refill rate (tokens per second).
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a bucket that starts full.
    pub fn new(name: impl Into<String>, capacity: f64, refill_rate: f64) -> Self {
        Self::with_tokens(name, capacity, refill_rate, capacity)
    }

    pub fn with_tokens(
        name: impl Into<String>,
        capacity: f64,
        refill_rate: f64,
        tokens: f64,
    ) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            name: name.into(),
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: tokens.clamp(0.0, capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refilled(&self) -> MutexGuard<'_, BucketState> {
        let mut state = self.lock();
        state.refill(self.capacity, self.refill_rate, Instant::now());
        state
    }

    /// Time until `n` tokens are available, or `None` if they never will be.
    fn wait_for(&self, tokens: f64, n: f64) -> Option<Duration> {
        if n > self.capacity + EPSILON {
            return None;
        }
        let missing = n - tokens;
        if missing <= EPSILON {
            return Some(Duration::ZERO);
        }
        if self.refill_rate <= 0.0 {
            return None;
        }
        Some(Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX))
    }

    /// Tokens currently available after refill.
    pub fn available(&self) -> f64 {
        self.refilled().tokens
    }

    /// Takes `n` tokens if they are available right now.
    pub fn try_acquire(&self, n: f64) -> bool {
        let mut state = self.refilled();
        if state.tokens + EPSILON >= n {
            state.tokens = (state.tokens - n).max(0.0);
            true
        } else {
            false
        }
    }

    /// How long a caller would wait for `n` tokens; `Duration::MAX` if never.
    pub fn wait_time(&self, n: f64) -> Duration {
        let tokens = self.refilled().tokens;
        self.wait_for(tokens, n).unwrap_or(Duration::MAX)
    }

    /// Waits up to `max_wait` for `n` tokens.
    ///
    /// Fails immediately when the predicted wait exceeds `max_wait`. The lock
    /// is released while sleeping; if another caller drains the refilled
    /// tokens first, waiting continues until the original deadline.
    pub async fn acquire(&self, n: f64, max_wait: Duration) -> bool {
        let deadline = Instant::now().checked_add(max_wait);

        loop {
            let wait = {
                let mut state = self.refilled();
                if state.tokens + EPSILON >= n {
                    state.tokens = (state.tokens - n).max(0.0);
                    return true;
                }
                match self.wait_for(state.tokens, n) {
                    Some(wait) => wait,
                    None => return false,
                }
            };

            if let Some(deadline) = deadline {
                match Instant::now().checked_add(wait) {
                    Some(wake) if wake <= deadline => {}
                    _ => return false,
                }
            }

            tokio::time::sleep(wait).await;
        }
    }

    /// Forces the token count to zero.
    pub fn drain(&self) {
        self.refilled().tokens = 0.0;
    }

    /// Time for an empty bucket to refill completely.
    pub fn full_refill_period(&self) -> Duration {
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(self.capacity / self.refill_rate).unwrap_or(Duration::MAX)
    }

    /// Persistable state, with the monotonic refill time mapped to wall-clock.
    pub fn record(&self) -> BucketRecord {
        let state = self.refilled();
        let since_refill = Instant::now().saturating_duration_since(state.last_refill);
        let now = Timestamp::now();
        BucketRecord {
            name: self.name.clone(),
            tokens: state.tokens,
            last_refill_time: now.checked_sub(since_refill).unwrap_or(now),
        }
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let record = self.record();
        BucketSnapshot {
            name: record.name,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            tokens: record.tokens,
            last_refill_time: record.last_refill_time,
        }
    }

    /// Restores persisted state, crediting tokens accrued since `last_refill_time`.
    pub fn restore(&self, tokens: f64, last_refill_time: Timestamp) {
        let downtime = Timestamp::now()
            .duration_since(last_refill_time)
            .as_secs_f64()
            .max(0.0);
        let mut state = self.lock();
        state.tokens = (tokens.max(0.0) + downtime * self.refill_rate).clamp(0.0, self.capacity);
        state.last_refill = Instant::now();
    }
}
