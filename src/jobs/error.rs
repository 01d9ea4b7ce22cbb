use std::time::Duration;

use thiserror::Error;

use crate::jobs::types::{JobType, Provider};

/// Failure of a single job attempt.
///
/// Each guard raises only its own variant; the dispatcher is the one place
/// that turns a variant into a retry or a terminal decision.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    /// The rate limiter could not supply a token within the allowed wait.
    #[error("Rate limit exhausted for {provider}, next token in {wait:?}")]
    RateExhausted { provider: Provider, wait: Duration },

    /// The provider answered "too many requests".
    #[error("Provider {provider} rejected the request (retry after {retry_after:?})")]
    ProviderRejected {
        provider: Provider,
        retry_after: Option<Duration>,
    },

    /// Too many consecutive provider rejections; stop retrying.
    #[error("Provider {provider} rejected {rejections} consecutive requests")]
    RejectionLimitReached { provider: Provider, rejections: u32 },

    /// The circuit breaker refused the call without making it.
    #[error("Circuit open for {provider}, retry after {retry_after:?}")]
    CircuitOpen {
        provider: Provider,
        retry_after: Duration,
    },

    #[error("Job execution timeout after {limit:?}")]
    Timeout { limit: Duration },

    /// Network or 5xx-class failure inside the handler.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Validation or business-rule failure; retrying will not help.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("No handler registered for job type {0}")]
    UnknownHandler(JobType),
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::RateExhausted { .. }
                | JobError::ProviderRejected { .. }
                | JobError::CircuitOpen { .. }
                | JobError::Timeout { .. }
                | JobError::Transient(_)
        )
    }

    /// False when no provider call was made, so the attempt budget is untouched.
    pub fn consumes_attempt(&self) -> bool {
        !matches!(
            self,
            JobError::CircuitOpen { .. } | JobError::RateExhausted { .. } | JobError::Cancelled
        )
    }

    /// Delay suggested by the guard that raised the error.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            JobError::RateExhausted { wait, .. } => Some(*wait),
            JobError::ProviderRejected { retry_after, .. } => *retry_after,
            JobError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the circuit breaker should count this as a provider failure.
    pub fn counts_as_provider_failure(&self) -> bool {
        matches!(self, JobError::Timeout { .. } | JobError::Transient(_))
    }
}
