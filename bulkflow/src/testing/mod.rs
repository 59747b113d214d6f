//! Helpers for testing code built on bulkflow.
//!
//! Scripted stage functions with controllable failures, item factories and
//! fast retry policies. Pair them with [`ManualClock`] to drive breaker
//! recovery windows and job timestamps without sleeping.

use crate::errors::StageError;
use crate::pipeline::Stage;
use crate::resilience::RetryPolicy;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use crate::utils::ManualClock;

/// Creates `count` JSON items with ids `"0"`, `"1"`, ...
#[must_use]
pub fn items(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| json!({"id": i.to_string(), "stages": []}))
        .collect()
}

/// Appends `stage` to the item's `"stages"` array.
#[must_use]
pub fn mark_stage(mut item: Value, stage: &str) -> Value {
    if let Some(object) = item.as_object_mut() {
        let stages = object.entry("stages").or_insert_with(|| json!([]));
        if let Some(stages) = stages.as_array_mut() {
            stages.push(json!(stage));
        }
    }
    item
}

/// Returns the stages recorded on an item by [`mark_stage`].
#[must_use]
pub fn stages_of(item: &Value) -> Vec<String> {
    item.get("stages")
        .and_then(Value::as_array)
        .map(|stages| {
            stages
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// A retry policy with millisecond delays.
#[must_use]
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_retries(max_retries)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
}

/// A blocking stage that marks items and fails those whose id is listed.
#[must_use]
pub fn fail_on_ids(name: &str, ids: &[&str], error: StageError) -> Stage<Value> {
    let failing: HashSet<String> = ids.iter().map(|id| (*id).to_string()).collect();
    let stage = name.to_string();
    Stage::blocking(name, move |item: Value| {
        let id = item.get("id").and_then(Value::as_str).unwrap_or_default();
        if failing.contains(id) {
            return Err(error.clone());
        }
        Ok(mark_stage(item, &stage))
    })
}

/// A fake remote service that fails each item a fixed number of times.
#[derive(Debug)]
pub struct FlakyService {
    failures_per_item: u32,
    error: StageError,
    calls: AtomicU32,
    seen: Mutex<HashMap<String, u32>>,
}

impl FlakyService {
    /// Fails each item `failures_per_item` times with a transient error.
    #[must_use]
    pub fn new(failures_per_item: u32) -> Self {
        Self::with_error(failures_per_item, StageError::transient("service unavailable"))
    }

    /// Fails each item `failures_per_item` times with `error`.
    #[must_use]
    pub fn with_error(failures_per_item: u32, error: StageError) -> Self {
        Self {
            failures_per_item,
            error,
            calls: AtomicU32::new(0),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Processes one item.
    pub fn call(&self, item_id: &str) -> Result<(), StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut seen = self.seen.lock();
        let count = seen.entry(item_id.to_string()).or_insert(0);
        *count += 1;
        if *count <= self.failures_per_item {
            return Err(self.error.clone());
        }
        Ok(())
    }

    /// Total calls across all items.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wraps the service as a blocking stage that marks items.
    #[must_use]
    pub fn stage(self: &Arc<Self>, name: &str) -> Stage<Value> {
        let service = Arc::clone(self);
        let stage = name.to_string();
        Stage::blocking(name, move |item: Value| {
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            service.call(&id)?;
            Ok(mark_stage(item, &stage))
        })
    }

    /// Wraps the service as an async stage that marks items.
    #[must_use]
    pub fn async_stage(self: &Arc<Self>, name: &str) -> Stage<Value> {
        let service = Arc::clone(self);
        let stage = name.to_string();
        Stage::from_async(name, move |item: Value| {
            let service = Arc::clone(&service);
            let stage = stage.clone();
            async move {
                tokio::task::yield_now().await;
                let id = item
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                service.call(&id)?;
                Ok::<_, StageError>(mark_stage(item, &stage))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_and_marks() {
        let item = items(3).remove(2);
        assert_eq!(item["id"], "2");
        let item = mark_stage(mark_stage(item, "a"), "b");
        assert_eq!(stages_of(&item), vec!["a", "b"]);
    }

    #[test]
    fn test_mark_stage_without_array() {
        let item = mark_stage(json!({"id": "x"}), "a");
        assert_eq!(stages_of(&item), vec!["a"]);
    }

    #[test]
    fn test_flaky_service_per_item() {
        let service = FlakyService::new(1);
        assert!(service.call("a").is_err());
        assert!(service.call("b").is_err());
        assert!(service.call("a").is_ok());
        assert_eq!(service.calls(), 3);
    }
}
