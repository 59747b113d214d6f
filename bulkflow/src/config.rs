//! Engine configuration.
//!
//! Every section and field has a default, so an empty JSON object is a valid
//! configuration.

use crate::cache::ContentAddressableCache;
use crate::errors::{BulkflowError, Result};
use crate::queue::PersistentJobQueue;
use crate::resilience::{BreakerConfig, BreakerRegistry, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default circuit breaker settings.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Default retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-service retry policies and breaker overrides.
    #[serde(default = "default_services")]
    pub services: HashMap<String, ServiceConfig>,
    /// Job queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Artifact cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Pipeline processor settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Batch submission settings.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_services() -> HashMap<String, ServiceConfig> {
    [
        ("openai", RetryPolicy::openai()),
        ("google_ai", RetryPolicy::google_ai()),
        ("sanity", RetryPolicy::sanity()),
    ]
    .into_iter()
    .map(|(name, retry)| {
        (
            name.to_string(),
            ServiceConfig {
                retry,
                breaker: None,
            },
        )
    })
    .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            services: default_services(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
            batch: BatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json =
            std::fs::read_to_string(path).map_err(|e| BulkflowError::persistence(path, e))?;
        Self::from_json_str(&json)
    }

    /// Checks values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        if !non_negative(self.breaker.recovery_timeout_seconds) {
            return Err(invalid("breaker.recovery_timeout_seconds must be non-negative"));
        }
        validate_retry("retry", &self.retry)?;
        for (name, service) in &self.services {
            validate_retry(&format!("services.{name}.retry"), &service.retry)?;
            if service.breaker.as_ref().is_some_and(|b| b.failure_threshold == 0) {
                return Err(invalid(format!(
                    "services.{name}.breaker.failure_threshold must be at least 1"
                )));
            }
        }
        if self.queue.max_attempts == 0 {
            return Err(invalid("queue.max_attempts must be at least 1"));
        }
        if self.pipeline.concurrency_limit == 0 {
            return Err(invalid("pipeline.concurrency_limit must be at least 1"));
        }
        if self.batch.batch_size == 0 {
            return Err(invalid("batch.batch_size must be at least 1"));
        }
        Ok(())
    }

    /// Builds a breaker registry with the configured defaults and overrides.
    #[must_use]
    pub fn breaker_registry(&self) -> BreakerRegistry {
        self.services
            .iter()
            .filter_map(|(name, s)| s.breaker.clone().map(|b| (name, b)))
            .fold(
                BreakerRegistry::new(self.breaker.clone()),
                |registry, (name, breaker)| registry.with_override(name.clone(), breaker),
            )
    }

    /// Opens the configured job queue.
    pub fn open_queue(&self) -> Result<PersistentJobQueue> {
        Ok(PersistentJobQueue::open(&self.queue.path)?
            .with_max_attempts(self.queue.max_attempts)
            .with_stale_after(self.queue.stale_after()))
    }

    /// Opens the configured artifact cache.
    pub fn open_cache(&self) -> Result<ContentAddressableCache> {
        ContentAddressableCache::open(&self.cache.dir)
    }
}

fn invalid(message: impl Into<String>) -> BulkflowError {
    BulkflowError::InvalidConfig(message.into())
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn validate_retry(section: &str, policy: &RetryPolicy) -> Result<()> {
    if !non_negative(policy.initial_delay_seconds) || !non_negative(policy.max_delay_seconds) {
        return Err(invalid(format!("{section}: delays must be non-negative")));
    }
    if !policy.backoff_factor.is_finite() || policy.backoff_factor < 1.0 {
        return Err(invalid(format!("{section}.backoff_factor must be at least 1.0")));
    }
    Ok(())
}

/// Settings for one external service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Retry policy for calls to the service.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Breaker settings replacing the default ones.
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
}

/// Job queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Store file.
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
    /// Deliveries before a job fails terminally.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds after which a `processing` job counts as abandoned.
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("job_queue.json")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_stale_after() -> u64 {
    900
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            max_attempts: default_max_attempts(),
            stale_after_seconds: default_stale_after(),
        }
    }
}

impl QueueConfig {
    /// Gets the stale timeout as Duration.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }
}

/// Artifact cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("image_cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

/// Pipeline processor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Items processed concurrently within a stage.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Error messages kept per stage in the run report.
    #[serde(default = "default_max_error_samples")]
    pub max_error_samples: usize,
    /// Prefix of dead-letter job types.
    #[serde(default = "default_dead_letter_prefix")]
    pub dead_letter_job_prefix: String,
}

fn default_concurrency_limit() -> usize {
    5
}

fn default_max_error_samples() -> usize {
    5
}

fn default_dead_letter_prefix() -> String {
    "pipeline".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            max_error_samples: default_max_error_samples(),
            dead_letter_job_prefix: default_dead_letter_prefix(),
        }
    }
}

/// Batch submission settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Documents per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_json_is_default() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.pipeline.concurrency_limit, 5);
        assert_eq!(config.batch.batch_size, 100);
        assert_eq!(config.cache.dir, PathBuf::from("image_cache"));
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_json_str(
            r#"{"breaker": {"failure_threshold": 3}, "logging": {"json": true}}"#,
        )
        .unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert!((config.breaker.recovery_timeout_seconds - 60.0).abs() < f64::EPSILON);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_default_service_presets() {
        let config = EngineConfig::default();
        assert_eq!(config.services["sanity"].retry, RetryPolicy::sanity());
        assert_eq!(config.services["openai"].retry, RetryPolicy::openai());
        assert!(config.services.values().all(|s| s.breaker.is_none()));
    }

    #[test]
    fn test_breaker_overrides() {
        let config = EngineConfig::from_json_str(
            r#"{"services": {"openai": {"breaker": {"failure_threshold": 2}}}}"#,
        )
        .unwrap();
        let registry = config.breaker_registry();
        assert_eq!(registry.get("openai").config().failure_threshold, 2);
        assert_eq!(registry.get("sanity").config().failure_threshold, 5);
        // Listing services replaces the presets.
        assert!(!config.services.contains_key("sanity"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        for json in [
            r#"{"breaker": {"failure_threshold": 0}}"#,
            r#"{"queue": {"max_attempts": 0}}"#,
            r#"{"pipeline": {"concurrency_limit": 0}}"#,
            r#"{"batch": {"batch_size": 0}}"#,
            r#"{"retry": {"backoff_factor": 0.5}}"#,
        ] {
            assert!(
                matches!(
                    EngineConfig::from_json_str(json),
                    Err(BulkflowError::InvalidConfig(_))
                ),
                "{json} should be rejected"
            );
        }
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bulkflow.json");
        std::fs::write(&path, r#"{"queue": {"path": "/var/lib/bulkflow/jobs.json"}}"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.queue.path, PathBuf::from("/var/lib/bulkflow/jobs.json"));
        assert_eq!(config.queue.stale_after(), Duration::from_secs(900));
    }

    #[test]
    fn test_open_queue_uses_queue_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.queue.path = dir.path().join("jobs.json");
        config.queue.max_attempts = 7;
        config.queue.stale_after_seconds = 45;
        let queue = config.open_queue().unwrap();
        assert_eq!(queue.max_attempts(), 7);
        assert_eq!(queue.stale_after(), Duration::from_secs(45));
    }
}
