//! Error types for the bulkflow engine.
//!
//! Two families live here. [`StageError`] is what stage functions return and
//! what the retry executor and circuit breaker classify. [`BulkflowError`] is
//! what the engine's own operations (queue, cache, config, batching) return.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Classification of a stage failure.
///
/// Retry policies select which kinds are retried; breakers select which kinds
/// count as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A transient fault of the remote service.
    Transient,
    /// The remote service asked us to slow down.
    RateLimited,
    /// The call did not complete in time.
    Timeout,
    /// A fault that will not go away by retrying.
    Permanent,
    /// The circuit breaker rejected the call without invoking it.
    CircuitOpen,
    /// The stage function panicked.
    Panicked,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Permanent => "permanent",
            Self::CircuitOpen => "circuit_open",
            Self::Panicked => "panicked",
        };
        write!(f, "{s}")
    }
}

/// Raised when a call is rejected because the service's breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker for '{service}' is OPEN. Service unavailable.")]
pub struct CircuitOpenError {
    /// The service whose breaker rejected the call.
    pub service: String,
}

impl CircuitOpenError {
    /// Creates a new circuit open error.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

/// Errors that can be classified by the retry executor and circuit breaker.
///
/// The `From<CircuitOpenError>` bound lets a breaker surface its fast-fail
/// rejection through the caller's own error type.
pub trait ClassifiedError: std::error::Error + From<CircuitOpenError> {
    /// Returns the kind of this error.
    fn kind(&self) -> ErrorKind;
}

/// Error returned by a stage function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Retryable service failure.
    #[error("Transient service error: {0}")]
    Transient(String),

    /// The service throttled the request.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The call timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The call failed for a reason retries will not fix.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// The breaker rejected the call.
    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    /// The stage function panicked.
    #[error("Stage panicked: {0}")]
    Panicked(String),
}

impl StageError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Creates a rate-limited error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited(message.into())
    }
}

impl ClassifiedError for StageError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Panicked(_) => ErrorKind::Panicked,
        }
    }
}

/// A job whose attempts are exhausted; terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("Job '{job_id}' permanently failed after {attempts} attempts: {last_error}")]
pub struct PermanentJobFailure {
    /// The job id.
    pub job_id: String,
    /// Attempts made.
    pub attempts: u32,
    /// The error recorded on the last attempt.
    pub last_error: String,
}

/// Some batches of a bulk submission failed while others succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{} of {total_batches} batches failed: {:?}", failed.len(), failed)]
pub struct BatchPartialFailure {
    /// Total number of batches attempted.
    pub total_batches: usize,
    /// Index and error message of each failed batch.
    pub failed: Vec<(usize, String)>,
}

/// The main error type for bulkflow operations.
#[derive(Debug, Error)]
pub enum BulkflowError {
    /// The backing store could not be read or written.
    #[error("Persistence error at {}: {source}", path.display())]
    Persistence {
        /// The file involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No job with this id exists.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job is in a state that does not allow the operation.
    #[error("Invalid job state '{status}' for operation '{operation}' on job '{id}'")]
    InvalidJobState {
        /// Job id.
        id: String,
        /// Current status.
        status: String,
        /// Operation attempted.
        operation: String,
    },

    /// Configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A job's attempts are exhausted.
    #[error("{0}")]
    PermanentJobFailure(#[from] PermanentJobFailure),

    /// A bulk submission partially failed.
    #[error("{0}")]
    BatchPartialFailure(#[from] BatchPartialFailure),

    /// A spawned task could not be joined.
    #[error("Task join error: {0}")]
    Join(String),
}

impl BulkflowError {
    /// Wraps an I/O error with the path it occurred on.
    #[must_use]
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias for results of engine operations.
pub type Result<T, E = BulkflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_kinds() {
        assert_eq!(StageError::transient("x").kind(), ErrorKind::Transient);
        assert_eq!(StageError::permanent("x").kind(), ErrorKind::Permanent);
        assert_eq!(StageError::timeout("x").kind(), ErrorKind::Timeout);
        assert_eq!(StageError::rate_limited("x").kind(), ErrorKind::RateLimited);
        assert_eq!(
            StageError::from(CircuitOpenError::new("openai")).kind(),
            ErrorKind::CircuitOpen
        );
    }

    #[test]
    fn test_circuit_open_message() {
        let err = CircuitOpenError::new("sanity");
        assert!(err.to_string().contains("'sanity' is OPEN"));
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
        let kind: ErrorKind = serde_json::from_str("\"circuit_open\"").unwrap();
        assert_eq!(kind, ErrorKind::CircuitOpen);
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit_open");
    }

    #[test]
    fn test_batch_partial_failure_display() {
        let err = BatchPartialFailure {
            total_batches: 3,
            failed: vec![(1, "boom".to_string())],
        };
        assert!(err.to_string().starts_with("1 of 3 batches failed"));
    }

    #[test]
    fn test_persistence_error_display() {
        let err = BulkflowError::persistence(
            "/tmp/queue.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/queue.json"));
    }
}
