//! Job records stored by the persistent queue.

use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be dequeued.
    Pending,
    /// Handed to a worker, not yet acknowledged.
    Processing,
    /// Finished successfully.
    Completed,
    /// Attempts exhausted or failed without retry. Terminal.
    Failed,
}

impl JobStatus {
    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A durable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: String,
    /// Routing type; never interpreted by the queue.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque payload.
    #[serde(alias = "data", default)]
    pub payload: serde_json::Value,
    /// Higher is dequeued first.
    #[serde(default)]
    pub priority: i32,
    /// Creation time.
    pub created_at: Timestamp,
    /// Times the job has been dequeued.
    #[serde(default)]
    pub attempts: u32,
    /// Current status.
    pub status: JobStatus,
    /// Error recorded by the last failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the current attempt was dequeued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the job completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// When the job permanently failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<Timestamp>,
    /// Fields written by newer versions, kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// Creates a pending job.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            payload,
            priority,
            created_at,
            attempts: 0,
            status: JobStatus::Pending,
            last_error: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Returns true if the job is pending and matches the type filter.
    #[must_use]
    pub fn is_ready(&self, job_type: Option<&str>) -> bool {
        self.status == JobStatus::Pending && job_type.map_or(true, |t| self.job_type == t)
    }
}

/// Counts of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// All jobs in the store.
    pub total: usize,
    /// Pending jobs.
    pub pending: usize,
    /// Jobs being processed.
    pub processing: usize,
    /// Completed jobs.
    pub completed: usize,
    /// Failed jobs.
    pub failed: usize,
}

impl QueueStats {
    /// Tallies a collection of jobs.
    #[must_use]
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        jobs.into_iter().fold(Self::default(), |mut stats, job| {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            stats
        })
    }
}

/// What `fail_job` did with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job went back to pending for redelivery.
    Requeued {
        /// Attempts made so far.
        attempts: u32,
    },
    /// The job is terminally failed.
    Failed(crate::errors::PermanentJobFailure),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_job_serializes_type_field() {
        let job = Job::new("j1", "process_article", serde_json::json!({"url": "x"}), 1, Utc::now());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "process_article");
        assert_eq!(value["status"], "pending");
        assert!(value.get("completed_at").is_none());
    }

    #[test]
    fn test_job_accepts_legacy_and_unknown_fields() {
        let json = serde_json::json!({
            "id": "process_article_1",
            "type": "process_article",
            "data": {"url": "https://example.com/article"},
            "priority": 1,
            "created_at": "2024-12-01T10:00:00Z",
            "attempts": 0,
            "status": "pending",
            "last_error": null,
            "owner": "worker-7"
        });
        let job: Job = serde_json::from_value(json).unwrap();
        assert_eq!(job.payload["url"], "https://example.com/article");
        assert_eq!(job.extra["owner"], "worker-7");

        let back = serde_json::to_value(&job).unwrap();
        assert_eq!(back["owner"], "worker-7");
    }

    #[test]
    fn test_queue_stats_from_jobs() {
        let now = Utc::now();
        let mut done = Job::new("b", "t", serde_json::Value::Null, 0, now);
        done.status = JobStatus::Completed;
        let jobs = vec![Job::new("a", "t", serde_json::Value::Null, 0, now), done];

        let stats = QueueStats::from_jobs(&jobs);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
