//! Per-provider circuit breaking.

pub mod breaker;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitStatus};
