//! Bounded-concurrency execution of stages over item batches.

use super::report::{FailurePolicy, PipelineReport, StageReport};
use super::result::{PipelineItem, ProcessingResult};
use super::stage::{Stage, StageFn};
use crate::config::EngineConfig;
use crate::errors::{BulkflowError, Result, StageError};
use crate::observability::SpanTimer;
use crate::queue::PersistentJobQueue;
use crate::resilience::{BreakerRegistry, RetryExecutor, RetryPolicy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Results of one stage, positionally aligned with the items that entered it.
#[derive(Debug, Clone)]
pub struct StageResults<T> {
    /// Stage name.
    pub stage: String,
    /// One result per item that entered the stage.
    pub results: Vec<ProcessingResult<T>>,
}

/// Everything a pipeline run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutcome<T> {
    /// Per-stage results in stage order.
    pub results: Vec<StageResults<T>>,
    /// Items that came out of the last stage that ran.
    pub items: Vec<T>,
    /// Run summary.
    pub report: PipelineReport,
}

impl<T> PipelineOutcome<T> {
    /// Returns the results of the named stage, if it ran.
    #[must_use]
    pub fn results_for(&self, stage: &str) -> Option<&[ProcessingResult<T>]> {
        self.results
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.results.as_slice())
    }
}

/// Runs items through stages with retries, breakers and a concurrency cap.
///
/// Blocking stages run on tokio's blocking pool and sleep between retries on
/// that thread; async stages run as tasks and sleep cooperatively. Either way
/// a failure or panic of one item only fails that item's result.
#[derive(Debug)]
pub struct PipelineProcessor {
    registry: Arc<BreakerRegistry>,
    default_retry: RetryPolicy,
    service_retry: HashMap<String, RetryPolicy>,
    concurrency_limit: usize,
    max_error_samples: usize,
    dead_letter_queue: Option<Arc<PersistentJobQueue>>,
    dead_letter_prefix: String,
}

impl PipelineProcessor {
    /// Creates a processor using `registry` for stage breakers.
    #[must_use]
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self::from_config(&EngineConfig::default(), registry)
    }

    /// Creates a processor from the engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig, registry: Arc<BreakerRegistry>) -> Self {
        Self {
            registry,
            default_retry: config.retry.clone(),
            service_retry: config
                .services
                .iter()
                .map(|(name, service)| (name.clone(), service.retry.clone()))
                .collect(),
            concurrency_limit: config.pipeline.concurrency_limit.max(1),
            max_error_samples: config.pipeline.max_error_samples,
            dead_letter_queue: None,
            dead_letter_prefix: config.pipeline.dead_letter_job_prefix.clone(),
        }
    }

    /// Sets the fallback retry policy.
    ///
    /// A stage's own policy comes first, then the policy of its service.
    /// [`new`](Self::new) and [`from_config`](Self::from_config) register
    /// service policies for `openai`, `google_ai` and `sanity` (or whatever
    /// the config lists), so stages bound to those services ignore this
    /// policy. Use [`with_service_retry`](Self::with_service_retry) or
    /// [`Stage::with_retry`] to change them.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Sets the retry policy of stages bound to `service`.
    #[must_use]
    pub fn with_service_retry(mut self, service: impl Into<String>, policy: RetryPolicy) -> Self {
        self.service_retry.insert(service.into(), policy);
        self
    }

    /// Sets how many items of a stage run at once in pipeline runs.
    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Sets how many error messages each stage report keeps.
    #[must_use]
    pub fn with_max_error_samples(mut self, samples: usize) -> Self {
        self.max_error_samples = samples;
        self
    }

    /// Records every failed item as a job in `queue`.
    #[must_use]
    pub fn with_dead_letter_queue(mut self, queue: Arc<PersistentJobQueue>) -> Self {
        self.dead_letter_queue = Some(queue);
        self
    }

    /// Sets the prefix of dead-letter job types.
    #[must_use]
    pub fn with_dead_letter_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dead_letter_prefix = prefix.into();
        self
    }

    /// Returns the breaker registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    /// Returns the concurrency limit used by pipeline runs.
    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Runs one stage over `items`, at most `concurrency_limit` at a time.
    ///
    /// `results[i]` is the outcome of `items[i]`. A limit of zero is treated
    /// as one.
    pub async fn process_batch<T: PipelineItem>(
        &self,
        items: &[T],
        stage: &Stage<T>,
        concurrency_limit: usize,
    ) -> Vec<ProcessingResult<T>> {
        let semaphore = Arc::new(Semaphore::new(concurrency_limit.max(1)));
        let executor = self.executor_for(stage);

        let mut ids = Vec::with_capacity(items.len());
        let mut counters = Vec::with_capacity(items.len());
        let mut handles = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let attempts = Arc::new(AtomicU32::new(0));
            handles.push(tokio::spawn(run_item(
                stage.func().clone(),
                executor.clone(),
                item.clone(),
                attempts.clone(),
                semaphore.clone(),
            )));
            ids.push(item.item_id().unwrap_or_else(|| format!("item-{index}")));
            counters.push(attempts);
        }

        let joined = futures::future::join_all(handles).await;
        joined
            .into_iter()
            .zip(ids)
            .zip(counters)
            .map(|((joined, item_id), attempts)| {
                let attempts = attempts.load(Ordering::SeqCst);
                match joined {
                    Ok((Ok(value), elapsed_ms)) => {
                        debug!(stage = stage.name(), item_id = %item_id, attempts, "Item processed");
                        ProcessingResult::succeeded(item_id, value, attempts, elapsed_ms)
                    }
                    Ok((Err(e), elapsed_ms)) => {
                        warn!(stage = stage.name(), item_id = %item_id, attempts, error = %e, "Item failed");
                        ProcessingResult::failed(item_id, &e, attempts, elapsed_ms)
                    }
                    Err(join_error) => {
                        let e = StageError::Panicked(panic_message(join_error));
                        error!(stage = stage.name(), item_id = %item_id, error = %e, "Item task aborted");
                        ProcessingResult::failed(item_id, &e, attempts, 0.0)
                    }
                }
            })
            .collect()
    }

    /// Runs `items` through `stages` in order.
    ///
    /// All items finish a stage before any item starts the next one. What
    /// happens to failed items is decided by `policy`. The run returns an
    /// error only if dead-lettering failed items could not be persisted.
    pub async fn process_pipeline<T: PipelineItem>(
        &self,
        items: Vec<T>,
        stages: &[Stage<T>],
        policy: FailurePolicy,
    ) -> Result<PipelineOutcome<T>> {
        let run_timer = SpanTimer::start("pipeline");
        let mut report = PipelineReport::new(policy, items.len());
        let mut all_results = Vec::with_capacity(stages.len());
        let mut current = items;

        info!(stages = stages.len(), items = current.len(), ?policy, "Starting pipeline");

        for (position, stage) in stages.iter().enumerate() {
            let timer = SpanTimer::start(stage.name());
            let results = self
                .process_batch(&current, stage, self.concurrency_limit)
                .await;
            let mut stage_report = StageReport::from_results(
                stage.name(),
                &results,
                timer.finish(),
                self.max_error_samples,
            );
            stage_report.dead_lettered = self.dead_letter(stage, &current, &results).await?;
            stage_report.log();

            let halt = policy == FailurePolicy::StopOnError
                && stage_report.succeeded == 0
                && position + 1 < stages.len();

            current = match policy {
                FailurePolicy::StopOnError => {
                    results.iter().filter_map(|r| r.result.clone()).collect()
                }
                FailurePolicy::CarryForwardStale => results
                    .iter()
                    .zip(current)
                    .map(|(r, previous)| r.result.clone().unwrap_or(previous))
                    .collect(),
            };
            report.stages.push(stage_report);
            all_results.push(StageResults {
                stage: stage.name().to_string(),
                results,
            });

            if halt {
                warn!(stage = stage.name(), "No item succeeded, halting pipeline");
                report.halted_at = Some(stage.name().to_string());
                break;
            }
        }

        report.items_out = current.len();
        report.duration_ms = run_timer.finish();
        info!(
            items_in = report.items_in,
            items_out = report.items_out,
            failures = report.total_failures(),
            duration_ms = report.duration_ms,
            "Pipeline finished"
        );

        Ok(PipelineOutcome {
            results: all_results,
            items: current,
            report,
        })
    }

    fn executor_for<T>(&self, stage: &Stage<T>) -> RetryExecutor {
        let policy = stage
            .retry_policy()
            .cloned()
            .or_else(|| {
                stage
                    .service()
                    .and_then(|service| self.service_retry.get(service).cloned())
            })
            .unwrap_or_else(|| self.default_retry.clone());
        RetryExecutor::new(policy)
            .with_optional_breaker(stage.service().map(|service| self.registry.get(service)))
            .with_name(stage.name())
    }

    async fn dead_letter<T: PipelineItem>(
        &self,
        stage: &Stage<T>,
        inputs: &[T],
        results: &[ProcessingResult<T>],
    ) -> Result<usize> {
        let Some(queue) = &self.dead_letter_queue else {
            return Ok(0);
        };

        let payloads = inputs
            .iter()
            .zip(results)
            .filter(|(_, result)| result.is_failure())
            .map(|(item, result)| -> Result<serde_json::Value> {
                Ok(serde_json::json!({
                    "stage": stage.name(),
                    "item_id": result.item_id,
                    "item": serde_json::to_value(item)?,
                    "error": result.error,
                    "error_kind": result.error_kind,
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        if payloads.is_empty() {
            return Ok(0);
        }

        let count = payloads.len();
        let queue = queue.clone();
        let job_type = format!("{}.{}", self.dead_letter_prefix, stage.name());
        tokio::task::spawn_blocking(move || {
            payloads
                .into_iter()
                .try_for_each(|payload| queue.add_job(&job_type, payload, 0).map(|_| ()))
        })
        .await
        .map_err(|e| BulkflowError::Join(e.to_string()))??;

        info!(stage = stage.name(), count, "Dead-lettered failed items");
        Ok(count)
    }
}

async fn run_item<T: PipelineItem>(
    func: StageFn<T>,
    executor: RetryExecutor,
    item: T,
    attempts: Arc<AtomicU32>,
    semaphore: Arc<Semaphore>,
) -> (std::result::Result<T, StageError>, f64) {
    // The semaphore is never closed.
    let _permit = semaphore.acquire_owned().await.ok();
    let start = Instant::now();

    let result = match func {
        StageFn::Blocking(f) => tokio::task::spawn_blocking(move || {
            executor.execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                f(item.clone())
            })
        })
        .await
        .unwrap_or_else(|e| Err(StageError::Panicked(panic_message(e)))),
        StageFn::Async(f) => {
            executor
                .execute_async(|| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    f(item.clone())
                })
                .await
        }
    };

    (result, start.elapsed().as_secs_f64() * 1000.0)
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
