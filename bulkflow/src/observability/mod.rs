//! Logging setup and timing helpers.

use crate::config::LoggingConfig;
use std::time::Instant;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Safe to call multiple
/// times; returns false if a subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json {
        builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}

/// Wall-clock timer for a stage or a whole run.
#[derive(Debug)]
pub struct SpanTimer {
    started: Instant,
    label: String,
}

impl SpanTimer {
    /// Starts timing `label`.
    #[must_use]
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            started: Instant::now(),
            label: label.into(),
        }
    }

    /// Milliseconds since [`start`](Self::start).
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Stops the timer, logs the duration at debug level and returns it.
    #[must_use]
    pub fn finish(self) -> f64 {
        let elapsed_ms = self.elapsed_ms();
        debug!(timer = %self.label, elapsed_ms, "Timer finished");
        elapsed_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("translate");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let midway = timer.elapsed_ms();
        assert!(midway >= 5.0);
        assert!(timer.finish() >= midway);
    }
}
