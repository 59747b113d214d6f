//! Per-item results and the item trait.

use crate::errors::{ClassifiedError, ErrorKind, StageError};
use crate::utils::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A value that can flow through pipeline stages.
///
/// Items are cloned for every attempt, so they should be cheap to clone or
/// wrapped in an `Arc`. `Serialize` is needed to dead-letter failed items.
pub trait PipelineItem: Clone + Send + Sync + Serialize + 'static {
    /// Returns the item's identifier, if it carries one.
    ///
    /// Items without one are named `item-{index}` after their position.
    fn item_id(&self) -> Option<String> {
        None
    }
}

impl PipelineItem for serde_json::Value {
    /// Reads a string or numeric `"id"` field.
    fn item_id(&self) -> Option<String> {
        match self.get("id")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl PipelineItem for String {}

/// Outcome of one item through one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult<T> {
    /// The item's id, or `item-{index}`.
    pub item_id: String,
    /// Whether the stage succeeded.
    pub success: bool,
    /// The stage output on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    /// The final error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Classification of the final error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Times the stage function was actually invoked.
    pub attempts: u32,
    /// Wall time spent on the item, retries and backoff included.
    pub processing_time_ms: f64,
    /// When the result was produced.
    pub timestamp: Timestamp,
}

impl<T> ProcessingResult<T> {
    /// Creates a successful result.
    #[must_use]
    pub fn succeeded(item_id: impl Into<String>, value: T, attempts: u32, processing_time_ms: f64) -> Self {
        Self {
            item_id: item_id.into(),
            success: true,
            result: Some(value),
            error: None,
            error_kind: None,
            attempts,
            processing_time_ms,
            timestamp: Utc::now(),
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failed(
        item_id: impl Into<String>,
        error: &StageError,
        attempts: u32,
        processing_time_ms: f64,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            success: false,
            result: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            attempts,
            processing_time_ms,
            timestamp: Utc::now(),
        }
    }

    /// Returns true if the stage failed for this item.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_item_id() {
        assert_eq!(json!({"id": "art-1"}).item_id().as_deref(), Some("art-1"));
        assert_eq!(json!({"id": 7}).item_id().as_deref(), Some("7"));
        assert_eq!(json!({"title": "x"}).item_id(), None);
        assert_eq!(json!("plain").item_id(), None);
    }

    #[test]
    fn test_failed_result_carries_kind() {
        let result: ProcessingResult<String> =
            ProcessingResult::failed("a", &StageError::timeout("30s"), 3, 12.5);
        assert!(result.is_failure());
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.error.as_deref(), Some("Timed out: 30s"));
        assert!(result.result.is_none());
    }

    #[test]
    fn test_result_serialization_skips_empty_fields() {
        let result = ProcessingResult::succeeded("a", json!({"title": "T"}), 1, 1.0);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["result"]["title"], "T");
        assert!(value.get("error").is_none());
    }
}
