use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jiff::Timestamp;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::jobs::error::JobError;
use crate::jobs::types::Provider;

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub half_open_max_calls: u32,
    /// Hint returned to callers turned away because half-open slots are taken.
    pub half_open_retry_after: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            half_open_max_calls: 1,
            half_open_retry_after: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "closed"),
            CircuitStatus::Open => write!(f, "open"),
            CircuitStatus::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub name: Provider,
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<Timestamp>,
    pub half_open_in_flight: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub half_open_max_calls: u32,
}

#[derive(Debug)]
struct BreakerState {
    status: CircuitStatus,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<Timestamp>,
    half_open_in_flight: u32,
    /// Bumped on every status change; outcomes from an older generation are ignored.
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_time: None,
            half_open_in_flight: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, status: CircuitStatus) {
        self.status = status;
        self.success_count = 0;
        self.half_open_in_flight = 0;
        self.generation += 1;
        if status == CircuitStatus::Closed {
            self.failure_count = 0;
        }
    }
}

enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Admission ticket for one call.
///
/// A half-open permit holds a slot until it is settled or dropped, so a call
/// future cancelled mid-flight does not leak the slot.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    half_open: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.on_outcome(self.generation, self.half_open, outcome);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.half_open {
            self.breaker.on_outcome(self.generation, true, Outcome::Neutral);
        }
    }
}

/// Closed / open / half-open circuit breaker for one provider.
///
/// The lock is held only for admission and for recording the outcome,
/// never across the guarded call.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: Provider,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(provider: Provider, config: CircuitBreakerConfig) -> Self {
        Self {
            provider,
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `call` if the circuit admits it.
    ///
    /// Rejections return `JobError::CircuitOpen` without invoking `call`.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let permit = self.admit()?;
        let result = call().await;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.counts_as_provider_failure() => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        };
        permit.settle(outcome);

        result
    }

    fn admit(&self) -> Result<CallPermit<'_>, JobError> {
        let mut state = self.lock();

        if state.status == CircuitStatus::Open {
            let elapsed = state
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(self.config.open_duration);
            if elapsed < self.config.open_duration {
                return Err(JobError::CircuitOpen {
                    provider: self.provider,
                    retry_after: self.config.open_duration - elapsed,
                });
            }
            state.transition(CircuitStatus::HalfOpen);
            info!(provider = %self.provider, "Circuit half-open, probing provider");
        }

        let half_open = state.status == CircuitStatus::HalfOpen;
        if half_open {
            if state.half_open_in_flight >= self.config.half_open_max_calls {
                debug!(provider = %self.provider, "Half-open slots taken, rejecting call");
                return Err(JobError::CircuitOpen {
                    provider: self.provider,
                    retry_after: self.config.half_open_retry_after,
                });
            }
            state.half_open_in_flight += 1;
        }

        Ok(CallPermit {
            breaker: self,
            generation: state.generation,
            half_open,
            settled: false,
        })
    }

    fn on_outcome(&self, generation: u64, half_open: bool, outcome: Outcome) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if half_open {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }

        match (state.status, outcome) {
            (_, Outcome::Neutral) => {}
            (CircuitStatus::Closed, Outcome::Success) => {
                state.failure_count = 0;
            }
            (CircuitStatus::Closed, Outcome::Failure) => {
                state.failure_count += 1;
                state.last_failure = Some(Instant::now());
                state.last_failure_time = Some(Timestamp::now());
                if state.failure_count >= self.config.failure_threshold {
                    let failures = state.failure_count;
                    state.transition(CircuitStatus::Open);
                    warn!(
                        provider = %self.provider,
                        failures,
                        open_secs = self.config.open_duration.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            (CircuitStatus::HalfOpen, Outcome::Success) => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.transition(CircuitStatus::Closed);
                    info!(provider = %self.provider, "Circuit closed, provider recovered");
                }
            }
            (CircuitStatus::HalfOpen, Outcome::Failure) => {
                state.last_failure = Some(Instant::now());
                state.last_failure_time = Some(Timestamp::now());
                state.transition(CircuitStatus::Open);
                warn!(provider = %self.provider, "Probe failed, circuit re-opened");
            }
            (CircuitStatus::Open, _) => {}
        }
    }

    pub fn state(&self) -> CircuitSnapshot {
        let state = self.lock();
        CircuitSnapshot {
            name: self.provider,
            status: state.status,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_time: state.last_failure_time,
            half_open_in_flight: state.half_open_in_flight,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            open_duration: self.config.open_duration,
            half_open_max_calls: self.config.half_open_max_calls,
        }
    }

    /// Forces the circuit closed.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.transition(CircuitStatus::Closed);
        state.last_failure = None;
        state.last_failure_time = None;
        info!(provider = %self.provider, "Circuit manually reset");
    }
}
