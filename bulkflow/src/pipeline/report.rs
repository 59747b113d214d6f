//! Run summaries.

use super::result::ProcessingResult;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What happens to items that fail a stage.
///
/// Has no default; every run names its policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Failed items are dropped from later stages. A stage with zero
    /// successes halts the run.
    StopOnError,
    /// A failed item's pre-stage value is passed to the next stage
    /// unchanged. Later stages may operate on unprocessed input.
    CarryForwardStale,
}

/// Summary of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage name.
    pub stage: String,
    /// Items that entered the stage.
    pub total: usize,
    /// Items that succeeded.
    pub succeeded: usize,
    /// Items that failed.
    pub failed: usize,
    /// Stage invocations across all items, retries included.
    pub attempts: u64,
    /// Wall time of the stage.
    pub duration_ms: f64,
    /// The first few error messages.
    pub error_samples: Vec<String>,
    /// Failed items recorded as dead-letter jobs.
    pub dead_lettered: usize,
}

impl StageReport {
    /// Summarizes the results of a stage.
    #[must_use]
    pub fn from_results<T>(
        stage: impl Into<String>,
        results: &[ProcessingResult<T>],
        duration_ms: f64,
        max_error_samples: usize,
    ) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            stage: stage.into(),
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            attempts: results.iter().map(|r| u64::from(r.attempts)).sum(),
            duration_ms,
            error_samples: results
                .iter()
                .filter_map(|r| r.error.clone())
                .take(max_error_samples)
                .collect(),
            dead_lettered: 0,
        }
    }

    /// Returns the fraction of items that succeeded.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64
    }

    pub(crate) fn log(&self) {
        if self.failed == 0 {
            info!(
                stage = %self.stage,
                total = self.total,
                attempts = self.attempts,
                duration_ms = self.duration_ms,
                "Stage completed"
            );
        } else {
            warn!(
                stage = %self.stage,
                total = self.total,
                succeeded = self.succeeded,
                failed = self.failed,
                dead_lettered = self.dead_lettered,
                duration_ms = self.duration_ms,
                errors = ?self.error_samples,
                "Stage completed with failures"
            );
        }
    }
}

/// Summary of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// The failure policy of the run.
    pub policy: FailurePolicy,
    /// One entry per stage that ran, in order.
    pub stages: Vec<StageReport>,
    /// The stage after which the run halted early.
    pub halted_at: Option<String>,
    /// Items given to the run.
    pub items_in: usize,
    /// Items that came out of the last stage that ran.
    pub items_out: usize,
    /// Wall time of the run.
    pub duration_ms: f64,
}

impl PipelineReport {
    pub(crate) fn new(policy: FailurePolicy, items_in: usize) -> Self {
        Self {
            policy,
            stages: Vec::new(),
            halted_at: None,
            items_in,
            items_out: 0,
            duration_ms: 0.0,
        }
    }

    /// Returns the report of the named stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Returns the number of failed (item, stage) pairs.
    #[must_use]
    pub fn total_failures(&self) -> usize {
        self.stages.iter().map(|s| s.failed).sum()
    }

    /// Returns true if the run stopped before its last stage.
    #[must_use]
    pub fn halted(&self) -> bool {
        self.halted_at.is_some()
    }
}
