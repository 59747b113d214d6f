//! Retry with exponential backoff.
//!
//! [`RetryExecutor::execute`] sleeps on the calling thread and is meant for
//! blocking work running on a worker pool; [`RetryExecutor::execute_async`]
//! sleeps cooperatively. Both walk the same [`Backoff`] sequence and make the
//! same retry decisions.

use super::circuit_breaker::CircuitBreaker;
use crate::errors::{ClassifiedError, ErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Jitter strategy applied on top of the backoff delay.
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

impl JitterStrategy {
    /// Applies jitter to a delay.
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match self {
            Self::None => delay,
            Self::Full => {
                if millis == 0 {
                    delay
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
                }
            }
            Self::Equal => {
                let half = millis / 2;
                if half == 0 {
                    delay
                } else {
                    Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
                }
            }
        }
    }
}

/// Immutable retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in seconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: f64,
    /// Multiplier applied to the delay after each retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Maximum delay between retries in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
    /// Error kinds that trigger a retry.
    #[serde(default = "default_retryable_kinds")]
    pub retryable_error_kinds: HashSet<ErrorKind>,
    /// Jitter applied to each delay.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_retryable_kinds() -> HashSet<ErrorKind> {
    [ErrorKind::Transient, ErrorKind::RateLimited, ErrorKind::Timeout]
        .into_iter()
        .collect()
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_seconds: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_seconds: default_max_delay(),
            retryable_error_kinds: default_retryable_kinds(),
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes a single attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_retries(1)
    }

    /// Preset for the OpenAI API.
    #[must_use]
    pub fn openai() -> Self {
        Self::default()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_secs(2))
            .with_backoff_factor(2.0)
    }

    /// Preset for the Google AI API.
    #[must_use]
    pub fn google_ai() -> Self {
        Self::default()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_factor(2.0)
    }

    /// Preset for the Sanity CMS API.
    #[must_use]
    pub fn sanity() -> Self {
        Self::default()
            .with_max_retries(5)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_factor(1.5)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_seconds = delay.as_secs_f64();
        self
    }

    /// Sets the backoff factor.
    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_seconds = delay.as_secs_f64();
        self
    }

    /// Replaces the set of retryable error kinds.
    #[must_use]
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_error_kinds = kinds.into_iter().collect();
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attempts the executor will make; never less than one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Returns true if an error of this kind is retried.
    ///
    /// `CircuitOpen` is never retried.
    #[must_use]
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind != ErrorKind::CircuitOpen && self.retryable_error_kinds.contains(&kind)
    }

    /// Upper bound on the total time spent sleeping between attempts.
    #[must_use]
    pub fn worst_case_sleep(&self) -> Duration {
        Backoff::new(&RetryPolicy {
            jitter: JitterStrategy::None,
            ..self.clone()
        })
        .take(self.attempts().saturating_sub(1) as usize)
        .sum()
    }
}

/// The delay sequence of a retry policy.
///
/// Yields `initial_delay` first, then multiplies by `backoff_factor` capped
/// at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: f64,
    factor: f64,
    max: f64,
    jitter: JitterStrategy,
}

impl Backoff {
    /// Starts the sequence for a policy.
    #[must_use]
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            current: policy.initial_delay_seconds.max(0.0),
            factor: policy.backoff_factor,
            max: policy.max_delay_seconds.max(0.0),
            jitter: policy.jitter,
        }
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = seconds(self.current);
        self.current = (self.current * self.factor).min(self.max);
        self.jitter.apply(delay)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

enum Step {
    GiveUp,
    RetryAfter(Duration),
}

/// Runs a fallible call with retries, optionally through a circuit breaker.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    name: String,
}

impl RetryExecutor {
    /// Creates an executor with the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            breaker: None,
            name: String::from("call"),
        }
    }

    /// Routes every attempt through a circuit breaker.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Optionally routes every attempt through a circuit breaker.
    #[must_use]
    pub fn with_optional_breaker(mut self, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Sets the name used in log events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes `f`, sleeping on the current thread between attempts.
    ///
    /// Do not call this on an async runtime thread; use
    /// [`execute_async`](Self::execute_async) or run it on the blocking pool.
    pub fn execute<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        E: ClassifiedError,
        F: FnMut() -> Result<T, E>,
    {
        let attempts = self.policy.attempts();
        let mut backoff = Backoff::new(&self.policy);
        let mut attempt = 0;
        let mut last_error = None;

        loop {
            let result = match &self.breaker {
                Some(breaker) => breaker.call(&mut f),
                None => f(),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) => match self.decide(attempt, attempts, &e, &mut backoff, &mut last_error) {
                    Step::GiveUp => return Err(e),
                    Step::RetryAfter(delay) => std::thread::sleep(delay),
                },
            }
            attempt += 1;
        }
    }

    /// Executes `f`, sleeping cooperatively between attempts.
    pub async fn execute_async<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        E: ClassifiedError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.policy.attempts();
        let mut backoff = Backoff::new(&self.policy);
        let mut attempt = 0;
        let mut last_error = None;

        loop {
            let result = match &self.breaker {
                Some(breaker) => breaker.call_async(&mut f).await,
                None => f().await,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) => match self.decide(attempt, attempts, &e, &mut backoff, &mut last_error) {
                    Step::GiveUp => return Err(e),
                    Step::RetryAfter(delay) => tokio::time::sleep(delay).await,
                },
            }
            attempt += 1;
        }
    }

    fn decide<E: ClassifiedError>(
        &self,
        attempt: u32,
        attempts: u32,
        err: &E,
        backoff: &mut Backoff,
        last_error: &mut Option<String>,
    ) -> Step {
        let kind = err.kind();
        if kind == ErrorKind::CircuitOpen {
            match last_error.take() {
                Some(previous) => warn!(
                    name = %self.name,
                    attempts_made = attempt,
                    last_error = %previous,
                    "Circuit opened between retries, giving up"
                ),
                None => debug!(name = %self.name, error = %err, "Circuit open, not retrying"),
            }
            return Step::GiveUp;
        }
        *last_error = Some(err.to_string());
        if !self.policy.is_retryable(kind) {
            debug!(name = %self.name, %kind, error = %err, "Error is not retryable");
            return Step::GiveUp;
        }
        if attempt + 1 >= attempts {
            error!(
                name = %self.name,
                attempts,
                error = %err,
                "Failed after all attempts"
            );
            return Step::GiveUp;
        }

        let delay = backoff.next_delay();
        warn!(
            name = %self.name,
            attempt = attempt + 1,
            max_attempts = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Attempt failed, retrying"
        );
        Step::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageError;
    use crate::resilience::{BreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(max_retries)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(4))
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert!((policy.initial_delay_seconds - 1.0).abs() < f64::EPSILON);
        assert!((policy.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert!(policy.is_retryable(ErrorKind::Transient));
        assert!(!policy.is_retryable(ErrorKind::Permanent));
        assert!(!policy.is_retryable(ErrorKind::CircuitOpen));
    }

    #[test]
    fn test_service_presets() {
        assert_eq!(RetryPolicy::sanity().max_retries, 5);
        assert!((RetryPolicy::sanity().backoff_factor - 1.5).abs() < f64::EPSILON);
        assert!((RetryPolicy::openai().initial_delay_seconds - 2.0).abs() < f64::EPSILON);
        assert_eq!(RetryPolicy::google_ai().max_retries, 3);
    }

    #[test]
    fn test_backoff_sequence_capped() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_factor(2.0)
            .with_max_delay(Duration::from_secs(5));
        let delays: Vec<_> = Backoff::new(&policy).take(5).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn test_worst_case_sleep() {
        let policy = RetryPolicy::new()
            .with_max_retries(4)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3));
        assert_eq!(policy.worst_case_sleep(), Duration::from_secs(6));
    }

    #[test]
    fn test_full_jitter_bounds() {
        let delay = Duration::from_millis(100);
        for _ in 0..100 {
            assert!(JitterStrategy::Full.apply(delay) <= delay);
        }
    }

    #[test]
    fn test_execute_success_first_try() {
        let executor = RetryExecutor::new(fast(3));
        let mut calls = 0;
        let result: Result<i32, StageError> = executor.execute(|| {
            calls += 1;
            Ok(42)
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_execute_always_failing_invoked_max_retries_times() {
        let executor = RetryExecutor::new(fast(4));
        let mut calls = 0;
        let result: Result<(), StageError> = executor.execute(|| {
            calls += 1;
            Err(StageError::transient(format!("attempt {calls}")))
        });
        assert_eq!(calls, 4);
        assert_eq!(result, Err(StageError::transient("attempt 4")));
    }

    #[test]
    fn test_execute_recovers_after_failures() {
        let executor = RetryExecutor::new(fast(5));
        let mut calls = 0;
        let result: Result<&str, StageError> = executor.execute(|| {
            calls += 1;
            if calls < 3 {
                Err(StageError::timeout("slow"))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result, Ok("done"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_execute_non_retryable_stops_immediately() {
        let executor = RetryExecutor::new(fast(5));
        let mut calls = 0;
        let result: Result<(), StageError> = executor.execute(|| {
            calls += 1;
            Err(StageError::permanent("bad request"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_retries_still_calls_once() {
        let executor = RetryExecutor::new(fast(0));
        let mut calls = 0;
        let _: Result<(), StageError> = executor.execute(|| {
            calls += 1;
            Err(StageError::transient("x"))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_circuit_open_propagates_without_retry() {
        let breaker = Arc::new(CircuitBreaker::new(
            "svc",
            BreakerConfig::new().with_failure_threshold(2),
        ));
        let executor = RetryExecutor::new(fast(5)).with_breaker(breaker.clone());
        let mut calls = 0;

        let result: Result<(), StageError> = executor.execute(|| {
            calls += 1;
            Err(StageError::transient("down"))
        });

        // Two real calls open the breaker, the third attempt is rejected.
        assert_eq!(calls, 2);
        assert!(matches!(result, Err(StageError::CircuitOpen(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_breaker_rejection_logs_last_real_error() {
        struct Capture(Arc<parking_lot::Mutex<Vec<u8>>>);

        impl std::io::Write for Capture {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let logs = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || Capture(sink.clone()))
            .with_ansi(false)
            .finish();

        let breaker = Arc::new(CircuitBreaker::new(
            "svc",
            BreakerConfig::new().with_failure_threshold(1),
        ));
        let executor = RetryExecutor::new(fast(3)).with_breaker(breaker);
        let result: Result<(), StageError> = tracing::subscriber::with_default(subscriber, || {
            executor.execute(|| Err(StageError::transient("upstream 503")))
        });

        assert!(matches!(result, Err(StageError::CircuitOpen(_))));
        let output = String::from_utf8(logs.lock().clone()).unwrap();
        assert!(output.contains("Circuit opened between retries"));
        assert!(output.contains("upstream 503"));
    }

    #[tokio::test]
    async fn test_execute_async_always_failing() {
        let executor = RetryExecutor::new(fast(3));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), StageError> = executor
            .execute_async(|| {
                let c = counter.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(StageError::rate_limited("429"))
                }
            })
            .await;

        assert!(matches!(result, Err(StageError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_async_through_breaker() {
        let breaker = Arc::new(CircuitBreaker::new("svc", BreakerConfig::default()));
        let executor = RetryExecutor::new(fast(3)).with_breaker(breaker.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, StageError> = executor
            .execute_async(|| {
                let c = counter.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 2 {
                        Err(StageError::transient("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(breaker.stats().success_count, 1);
        assert_eq!(breaker.stats().failure_count, 1);
    }
}
