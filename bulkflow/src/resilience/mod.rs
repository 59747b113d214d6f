//! Failure handling for calls to flaky services.
//!
//! This module provides:
//! - Per-service circuit breakers and their registry
//! - Retry with exponential backoff, blocking and async

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use registry::BreakerRegistry;
pub use retry::{Backoff, JitterStrategy, RetryExecutor, RetryPolicy};
