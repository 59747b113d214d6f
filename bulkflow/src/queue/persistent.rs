//! File-backed priority job queue.

use super::job::{FailOutcome, Job, JobStatus, QueueStats};
use crate::errors::{BulkflowError, PermanentJobFailure, Result};
use crate::storage::{read_json, write_json_atomic};
use crate::utils::{elapsed_between, generate_job_id, Clock, SystemClock};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default number of deliveries before a job is terminally failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default time a job may stay in `processing` before it is reaped.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(900);

/// A durable queue of deferred work.
///
/// Every mutation rewrites the whole store atomically before it returns, so a
/// job handed out by [`add_job`](Self::add_job) survives a crash. Delivery is
/// at-least-once: a worker that dies after [`get_next_job`](Self::get_next_job)
/// leaves the job in `processing` until
/// [`requeue_stale`](Self::requeue_stale) puts it back.
#[derive(Debug)]
pub struct PersistentJobQueue {
    path: PathBuf,
    max_attempts: u32,
    stale_after: Duration,
    clock: Arc<dyn Clock>,
    jobs: Mutex<Vec<Job>>,
}

impl PersistentJobQueue {
    /// Opens the store at `path`, loading any jobs it already holds.
    ///
    /// A missing file is an empty queue. An unreadable or corrupt file is an
    /// error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let jobs: Vec<Job> = read_json(&path)?.unwrap_or_default();
        info!(path = %path.display(), jobs = jobs.len(), "Loaded job queue");
        Ok(Self {
            path,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stale_after: DEFAULT_STALE_AFTER,
            clock: Arc::new(SystemClock),
            jobs: Mutex::new(jobs),
        })
    }

    /// Sets the number of deliveries before a job fails terminally.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets how long a job may stay in `processing` before
    /// [`reap_stale`](Self::reap_stale) requeues it.
    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the clock used for job timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the store path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the attempt cap.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the stale timeout used by [`reap_stale`](Self::reap_stale).
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Appends a pending job and returns its id.
    pub fn add_job(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<String> {
        let id = generate_job_id(job_type);
        let job = Job::new(id.clone(), job_type, payload, priority, self.clock.now());
        self.transact(|jobs| {
            jobs.push(job);
            Ok(Some(()))
        })?;
        info!(job_id = %id, job_type, priority, "Added job");
        Ok(id)
    }

    /// Dequeues the most urgent pending job, optionally of one type.
    ///
    /// Highest priority wins, then the earliest `created_at`, then insertion
    /// order. The job is marked `processing` and its attempt count is bumped
    /// before it is returned.
    pub fn get_next_job(&self, job_type: Option<&str>) -> Result<Option<Job>> {
        let now = self.clock.now();
        let job = self.transact(|jobs| {
            let next = jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| job.is_ready(job_type))
                .min_by(|(ia, a), (ib, b)| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.created_at.cmp(&b.created_at))
                        .then(ia.cmp(ib))
                })
                .map(|(i, _)| i);

            Ok(next.map(|i| {
                let job = &mut jobs[i];
                job.status = JobStatus::Processing;
                job.attempts += 1;
                job.started_at = Some(now);
                job.clone()
            }))
        })?;

        if let Some(job) = &job {
            debug!(job_id = %job.id, attempts = job.attempts, "Dequeued job");
        }
        Ok(job)
    }

    /// Marks a job completed.
    pub fn complete_job(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        self.transact(|jobs| {
            let job = find_live(jobs, id, "complete")?;
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            Ok(Some(()))
        })?;
        info!(job_id = id, "Completed job");
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// With `retry` set and attempts left the job returns to `pending`;
    /// otherwise it becomes `failed`, which is terminal, and the returned
    /// outcome carries the failure description.
    pub fn fail_job(&self, id: &str, error: &str, retry: bool) -> Result<FailOutcome> {
        let now = self.clock.now();
        let max_attempts = self.max_attempts;
        let outcome = self.transact(|jobs| {
            let job = find_live(jobs, id, "fail")?;
            job.last_error = Some(error.to_string());
            if retry && job.attempts < max_attempts {
                job.status = JobStatus::Pending;
                job.started_at = None;
                return Ok(Some(FailOutcome::Requeued {
                    attempts: job.attempts,
                }));
            }
            job.status = JobStatus::Failed;
            job.failed_at = Some(now);
            Ok(Some(FailOutcome::Failed(PermanentJobFailure {
                job_id: job.id.clone(),
                attempts: job.attempts,
                last_error: error.to_string(),
            })))
        })?;

        match &outcome {
            Some(FailOutcome::Requeued { attempts }) => {
                warn!(job_id = id, attempts, max_attempts, error, "Job failed, requeued");
            }
            Some(FailOutcome::Failed(failure)) => {
                error!(job_id = id, attempts = failure.attempts, error, "Job permanently failed");
            }
            None => {}
        }
        outcome.ok_or_else(|| BulkflowError::JobNotFound(id.to_string()))
    }

    /// Removes completed and failed jobs created more than `days` days ago.
    ///
    /// Pending and processing jobs are never removed. Returns the number of
    /// jobs purged. A window reaching past the representable date range
    /// purges nothing.
    pub fn cleanup_old_jobs(&self, days: u32) -> Result<usize> {
        let Some(cutoff) = chrono::Duration::try_days(i64::from(days))
            .and_then(|window| self.clock.now().checked_sub_signed(window))
        else {
            return Ok(0);
        };
        let removed = self
            .transact(|jobs| {
                let before = jobs.len();
                jobs.retain(|job| !(job.status.is_terminal() && job.created_at < cutoff));
                let removed = before - jobs.len();
                Ok((removed > 0).then_some(removed))
            })?
            .unwrap_or(0);
        if removed > 0 {
            info!(removed, days, "Cleaned up old jobs");
        }
        Ok(removed)
    }

    /// Returns `processing` jobs started longer than `timeout` ago to the
    /// queue.
    ///
    /// Jobs whose attempts are exhausted are failed instead. Returns the
    /// number of jobs touched.
    pub fn requeue_stale(&self, timeout: Duration) -> Result<usize> {
        let now = self.clock.now();
        let max_attempts = self.max_attempts;
        let touched = self
            .transact(|jobs| {
                let mut touched = 0;
                for job in jobs
                    .iter_mut()
                    .filter(|job| job.status == JobStatus::Processing)
                {
                    let started = job.started_at.unwrap_or(job.created_at);
                    if elapsed_between(started, now) < timeout {
                        continue;
                    }
                    touched += 1;
                    job.last_error = Some(format!(
                        "No acknowledgement within {}s",
                        timeout.as_secs()
                    ));
                    job.started_at = None;
                    if job.attempts >= max_attempts {
                        job.status = JobStatus::Failed;
                        job.failed_at = Some(now);
                        error!(job_id = %job.id, attempts = job.attempts, "Stale job permanently failed");
                    } else {
                        job.status = JobStatus::Pending;
                        warn!(job_id = %job.id, attempts = job.attempts, "Requeued stale job");
                    }
                }
                Ok((touched > 0).then_some(touched))
            })?
            .unwrap_or(0);
        Ok(touched)
    }

    /// Runs [`requeue_stale`](Self::requeue_stale) with the configured
    /// stale timeout.
    pub fn reap_stale(&self) -> Result<usize> {
        self.requeue_stale(self.stale_after)
    }

    /// Returns a copy of the job with `id`.
    #[must_use]
    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.jobs.lock().iter().find(|job| job.id == id).cloned()
    }

    /// Returns per-status counts.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats::from_jobs(self.jobs.lock().iter())
    }

    /// Returns the number of stored jobs, in any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Returns true if the store holds no jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Runs `f` on a copy of the jobs and persists the copy.
    ///
    /// `f` returns `None` when it changed nothing, in which case nothing is
    /// written. The in-memory state is replaced only after the write
    /// succeeded.
    fn transact<R>(
        &self,
        f: impl FnOnce(&mut Vec<Job>) -> Result<Option<R>>,
    ) -> Result<Option<R>> {
        let mut jobs = self.jobs.lock();
        let mut next = jobs.clone();
        let Some(out) = f(&mut next)? else {
            return Ok(None);
        };
        write_json_atomic(&self.path, &next)?;
        *jobs = next;
        Ok(Some(out))
    }
}

fn find_live<'a>(jobs: &'a mut [Job], id: &str, operation: &str) -> Result<&'a mut Job> {
    let job = jobs
        .iter_mut()
        .find(|job| job.id == id)
        .ok_or_else(|| BulkflowError::JobNotFound(id.to_string()))?;
    if job.status.is_terminal() {
        return Err(BulkflowError::InvalidJobState {
            id: id.to_string(),
            status: job.status.to_string(),
            operation: operation.to_string(),
        });
    }
    Ok(job)
}
