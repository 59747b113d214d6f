//! Per-service circuit breaker.
//!
//! # State transitions
//! ```text
//! Closed   -> Open:     failure_count >= failure_threshold
//! Open     -> HalfOpen: recovery_timeout elapsed since state_changed_at
//! HalfOpen -> Closed:   a call succeeds (failure_count reset to 0)
//! HalfOpen -> Open:     a call fails
//! ```
//!
//! `HalfOpen` admits any number of concurrent trial calls unless
//! [`BreakerConfig::single_trial`] is set. Under concurrent load the unguarded
//! mode can flap between `Open` and `Closed`.

use crate::errors::{CircuitOpenError, ClassifiedError, ErrorKind};
use crate::utils::{elapsed_between, Clock, SystemClock, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing, calls are rejected.
    Open,
    /// Testing whether the service recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a trial call is allowed.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: f64,
    /// Admit a single trial call at a time while half-open.
    #[serde(default)]
    pub single_trial: bool,
    /// Error kinds that count as failures. `None` counts every kind.
    #[serde(default)]
    pub expected_kinds: Option<HashSet<ErrorKind>>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> f64 {
    60.0
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout(),
            single_trial: false,
            expected_kinds: None,
        }
    }
}

impl BreakerConfig {
    /// Creates a new breaker config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Admits one trial call at a time while half-open.
    #[must_use]
    pub fn with_single_trial(mut self, single_trial: bool) -> Self {
        self.single_trial = single_trial;
        self
    }

    /// Restricts which error kinds count as failures.
    #[must_use]
    pub fn with_expected_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.expected_kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Gets the recovery timeout as Duration.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.recovery_timeout_seconds).unwrap_or(Duration::ZERO)
    }

    fn counts_as_failure(&self, kind: ErrorKind) -> bool {
        if kind == ErrorKind::CircuitOpen {
            return false;
        }
        self.expected_kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    /// Service name.
    pub service: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures counted since the last recovery.
    pub failure_count: u32,
    /// Successes over the breaker's lifetime.
    pub success_count: u64,
    /// When the last counted failure happened.
    pub last_failure_time: Option<Timestamp>,
    /// When the last success happened.
    pub last_success_time: Option<Timestamp>,
    /// When the state last changed.
    pub state_changed_at: Timestamp,
    /// Configured failure threshold.
    pub failure_threshold: u32,
    /// Configured recovery timeout in seconds.
    pub recovery_timeout_seconds: f64,
}

#[derive(Debug)]
struct BreakerInner {
    stats: BreakerStats,
    trial_in_flight: bool,
}

/// Circuit breaker guarding calls to one service.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

/// Clears the half-open trial flag when the trial ends, even on panic.
struct TrialPermit<'a> {
    breaker: &'a CircuitBreaker,
    active: bool,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if self.active {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Creates a breaker reading the system clock.
    #[must_use]
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(service, config, Arc::new(SystemClock))
    }

    /// Creates a breaker reading the given clock.
    #[must_use]
    pub fn with_clock(
        service: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let stats = BreakerStats {
            service: service.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_success_time: None,
            state_changed_at: now,
            failure_threshold: config.failure_threshold,
            recovery_timeout_seconds: config.recovery_timeout_seconds,
        };
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                stats,
                trial_in_flight: false,
            }),
        }
    }

    /// Returns the service name.
    #[must_use]
    pub fn service(&self) -> String {
        self.inner.lock().stats.service.clone()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().stats.state
    }

    /// Returns a snapshot of the breaker's counters.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        self.inner.lock().stats.clone()
    }

    /// Returns the breaker configuration.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Invokes a blocking function through the breaker.
    ///
    /// Fails fast with the caller's error built from [`CircuitOpenError`]
    /// when the circuit is open; `f` is not invoked in that case.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: ClassifiedError,
        F: FnOnce() -> Result<T, E>,
    {
        let _permit = self.admit().map_err(E::from)?;
        let result = f();
        self.record(&result);
        result
    }

    /// Invokes an async function through the breaker.
    ///
    /// The breaker lock is never held across the await.
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        E: ClassifiedError,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.admit().map_err(E::from)?;
        let result = f().await;
        self.record(&result);
        result
    }

    /// Forces the breaker back to `Closed` with a zero failure count.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.stats.state = CircuitState::Closed;
        inner.stats.failure_count = 0;
        inner.stats.state_changed_at = now;
        inner.trial_in_flight = false;
        info!(service = %inner.stats.service, "Circuit breaker manually reset");
    }

    fn admit(&self) -> Result<TrialPermit<'_>, CircuitOpenError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.stats.state == CircuitState::Open {
            let open_for = elapsed_between(inner.stats.state_changed_at, now);
            if open_for < self.config.recovery_timeout() {
                debug!(service = %inner.stats.service, "Circuit open, rejecting call");
                return Err(CircuitOpenError::new(inner.stats.service.clone()));
            }
            inner.stats.state = CircuitState::HalfOpen;
            inner.stats.state_changed_at = now;
            info!(service = %inner.stats.service, "Circuit breaker entering HALF_OPEN state");
        }

        if inner.stats.state == CircuitState::HalfOpen && self.config.single_trial {
            if inner.trial_in_flight {
                return Err(CircuitOpenError::new(inner.stats.service.clone()));
            }
            inner.trial_in_flight = true;
            return Ok(TrialPermit {
                breaker: self,
                active: true,
            });
        }

        Ok(TrialPermit {
            breaker: self,
            active: false,
        })
    }

    fn record<T, E: ClassifiedError>(&self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.on_success(),
            Err(e) if self.config.counts_as_failure(e.kind()) => self.on_failure(),
            Err(_) => {}
        }
    }

    fn on_success(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.stats.success_count += 1;
        inner.stats.last_success_time = Some(now);

        if inner.stats.state == CircuitState::HalfOpen {
            inner.stats.state = CircuitState::Closed;
            inner.stats.failure_count = 0;
            inner.stats.state_changed_at = now;
            info!(service = %inner.stats.service, "Circuit breaker recovered to CLOSED state");
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.stats.failure_count = inner.stats.failure_count.saturating_add(1);
        inner.stats.last_failure_time = Some(now);

        if inner.stats.failure_count >= self.config.failure_threshold
            && inner.stats.state != CircuitState::Open
        {
            inner.stats.state = CircuitState::Open;
            inner.stats.state_changed_at = now;
            error!(
                service = %inner.stats.service,
                failures = inner.stats.failure_count,
                "Circuit breaker opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageError;
    use crate::utils::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, timeout_secs: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = BreakerConfig::new()
            .with_failure_threshold(threshold)
            .with_recovery_timeout(Duration::from_secs(timeout_secs));
        (
            CircuitBreaker::with_clock("svc", config, clock.clone()),
            clock,
        )
    }

    fn fail(b: &CircuitBreaker) -> Result<(), StageError> {
        b.call(|| Err(StageError::transient("boom")))
    }

    #[test]
    fn test_breaker_config_default() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout(), Duration::from_secs(60));
        assert!(!config.single_trial);
    }

    #[test]
    fn test_opens_after_threshold() {
        let (b, _clock) = breaker(3, 10);
        for _ in 0..2 {
            assert!(fail(&b).is_err());
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b).is_err());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.stats().failure_count, 3);
    }

    #[test]
    fn test_open_rejects_without_invoking() {
        let (b, _clock) = breaker(1, 10);
        let _ = fail(&b);

        let calls = AtomicUsize::new(0);
        let result: Result<(), StageError> = b.call(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(matches!(result, Err(StageError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.stats().failure_count, 1);
        assert_eq!(b.stats().success_count, 0);
    }

    #[test]
    fn test_recovery_scenario() {
        let (b, clock) = breaker(3, 10);
        for _ in 0..3 {
            let _ = fail(&b);
        }
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(5));
        let early: Result<u32, StageError> = b.call(|| Ok(1));
        assert!(matches!(early, Err(StageError::CircuitOpen(_))));

        clock.advance(Duration::from_secs(6));
        let late: Result<u32, StageError> = b.call(|| Ok(1));
        assert_eq!(late, Ok(1));
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().failure_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (b, clock) = breaker(2, 10);
        let _ = fail(&b);
        let _ = fail(&b);
        clock.advance(Duration::from_secs(10));

        assert!(matches!(fail(&b), Err(StageError::Transient(_))));
        assert_eq!(b.state(), CircuitState::Open);

        let rejected: Result<(), StageError> = b.call(|| Ok(()));
        assert!(matches!(rejected, Err(StageError::CircuitOpen(_))));
    }

    #[test]
    fn test_success_in_closed_keeps_failure_count() {
        let (b, _clock) = breaker(3, 10);
        let _ = fail(&b);
        let ok: Result<(), StageError> = b.call(|| Ok(()));
        assert!(ok.is_ok());
        assert_eq!(b.stats().failure_count, 1);
        assert_eq!(b.stats().success_count, 1);
    }

    #[test]
    fn test_unexpected_kind_not_counted() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = BreakerConfig::new()
            .with_failure_threshold(1)
            .with_expected_kinds([ErrorKind::Transient]);
        let b = CircuitBreaker::with_clock("svc", config, clock);

        let result: Result<(), StageError> = b.call(|| Err(StageError::permanent("bad input")));
        assert!(result.is_err());
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().failure_count, 0);
    }

    #[test]
    fn test_single_trial_rejects_concurrent_probe() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = BreakerConfig::new()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(1))
            .with_single_trial(true);
        let b = CircuitBreaker::with_clock("svc", config, clock.clone());
        let _ = fail(&b);
        clock.advance(Duration::from_secs(2));

        let outer: Result<(), StageError> = b.call(|| {
            let inner: Result<(), StageError> = b.call(|| Ok(()));
            assert!(matches!(inner, Err(StageError::CircuitOpen(_))));
            Ok(())
        });
        assert!(outer.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_default_half_open_allows_concurrent_probes() {
        let (b, clock) = breaker(1, 1);
        let _ = fail(&b);
        clock.advance(Duration::from_secs(2));

        let outer: Result<(), StageError> = b.call(|| {
            let inner: Result<(), StageError> = b.call(|| Ok(()));
            assert!(inner.is_ok());
            Ok(())
        });
        assert!(outer.is_ok());
    }

    #[test]
    fn test_reset() {
        let (b, _clock) = breaker(1, 60);
        let _ = fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().failure_count, 0);
    }

    #[tokio::test]
    async fn test_call_async_recovery() {
        let (b, clock) = breaker(2, 10);
        for _ in 0..2 {
            let r: Result<(), StageError> = b
                .call_async(|| async { Err(StageError::timeout("slow")) })
                .await;
            assert!(r.is_err());
        }
        assert_eq!(b.state(), CircuitState::Open);

        let rejected: Result<(), StageError> = b.call_async(|| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(StageError::CircuitOpen(_))));

        clock.advance(Duration::from_secs(11));
        let ok: Result<&str, StageError> = b.call_async(|| async { Ok("up") }).await;
        assert_eq!(ok, Ok("up"));
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
