//! Registry of circuit breakers keyed by service name.

use super::circuit_breaker::{BreakerConfig, BreakerStats, CircuitBreaker};
use crate::utils::{Clock, SystemClock};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Owns one [`CircuitBreaker`] per service.
///
/// Breakers are created lazily on first lookup. The registry is an ordinary
/// value: share it with `Arc` between processors that should see the same
/// breaker state, create a fresh one for isolation.
#[derive(Debug)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates a registry handing out breakers with `default_config`.
    #[must_use]
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            clock: Arc::new(SystemClock),
            breakers: DashMap::new(),
        }
    }

    /// Sets the clock breakers created from now on will read.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses a dedicated config for one service.
    #[must_use]
    pub fn with_override(mut self, service: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(service.into(), config);
        self
    }

    /// Returns the breaker for `service`, creating it if needed.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                tracing::debug!(service, "Creating circuit breaker");
                Arc::new(CircuitBreaker::with_clock(
                    service,
                    config,
                    self.clock.clone(),
                ))
            })
            .value()
            .clone()
    }

    /// Returns the breaker for `service` if one was created.
    #[must_use]
    pub fn existing(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|b| b.value().clone())
    }

    /// Resets the named breaker to `Closed`. Returns false if it does not exist.
    pub fn reset(&self, service: &str) -> bool {
        match self.existing(service) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Returns the stats of every breaker, sorted by service name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    /// Returns the number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker was created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
