//! Bulk submission of documents in bounded batches.
//!
//! Each batch is submitted and reported on its own. A failed batch does not
//! stop later ones, and the per-batch outcomes are never folded into a single
//! flag.

use crate::config::BatchConfig;
use crate::errors::{BatchPartialFailure, BulkflowError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{error, info};

/// Destination accepting whole batches, such as a CMS transaction endpoint.
#[async_trait]
pub trait BatchSink<T: Send + 'static>: Send + Sync {
    /// Submits one batch and returns the sink's response.
    async fn submit(&self, batch: Vec<T>) -> anyhow::Result<serde_json::Value>;
}

/// Splits `documents` into batches of at most `batch_size`, keeping order.
pub fn group<T>(documents: Vec<T>, batch_size: usize) -> Result<Vec<Vec<T>>> {
    if batch_size == 0 {
        return Err(BulkflowError::InvalidConfig(
            "batch_size must be at least 1".to_string(),
        ));
    }
    Ok(chunk(documents, batch_size))
}

fn chunk<T>(documents: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(documents.len().div_ceil(batch_size));
    let mut documents = documents.into_iter().peekable();
    while documents.peek().is_some() {
        batches.push(documents.by_ref().take(batch_size).collect());
    }
    batches
}

/// Outcome of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Position of the batch.
    pub index: usize,
    /// Documents in the batch.
    pub size: usize,
    /// Whether the sink accepted the batch.
    pub success: bool,
    /// The sink's response on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// The error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-batch outcomes of a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// One outcome per batch, in submission order.
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchReport {
    /// Returns the number of batches submitted.
    #[must_use]
    pub fn total_batches(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns the number of accepted batches.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    /// Returns the number of accepted documents.
    #[must_use]
    pub fn documents_submitted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.size)
            .sum()
    }

    /// Returns the outcomes of failed batches.
    pub fn failures(&self) -> impl Iterator<Item = &BatchOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    /// Describes the failed batches, if any.
    #[must_use]
    pub fn partial_failure(&self) -> Option<BatchPartialFailure> {
        let failed: Vec<(usize, String)> = self
            .failures()
            .map(|o| (o.index, o.error.clone().unwrap_or_default()))
            .collect();
        if failed.is_empty() {
            return None;
        }
        Some(BatchPartialFailure {
            total_batches: self.total_batches(),
            failed,
        })
    }

    /// Converts any batch failure into an error.
    pub fn into_result(self) -> Result<Self> {
        match self.partial_failure() {
            Some(failure) => Err(failure.into()),
            None => Ok(self),
        }
    }
}

/// Groups documents and hands the batches to a sink one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSubmitter {
    batch_size: usize,
}

impl BatchSubmitter {
    /// Creates a submitter; `batch_size` must be at least 1.
    pub fn new(batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(BulkflowError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(Self { batch_size })
    }

    /// Creates a submitter from the batch configuration.
    pub fn from_config(config: &BatchConfig) -> Result<Self> {
        Self::new(config.batch_size)
    }

    /// Returns the batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Splits documents into this submitter's batch size.
    pub fn group<T>(&self, documents: Vec<T>) -> Vec<Vec<T>> {
        chunk(documents, self.batch_size)
    }

    /// Submits each batch to `sink`.
    pub async fn submit_batches<T, S>(&self, batches: Vec<Vec<T>>, sink: &S) -> BatchReport
    where
        T: Send + 'static,
        S: BatchSink<T> + ?Sized,
    {
        self.submit_batches_with(batches, |batch| sink.submit(batch))
            .await
    }

    /// Submits each batch with `submit_fn`.
    pub async fn submit_batches_with<T, F, Fut>(
        &self,
        batches: Vec<Vec<T>>,
        mut submit_fn: F,
    ) -> BatchReport
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<serde_json::Value>>,
    {
        let total = batches.len();
        let mut report = BatchReport {
            outcomes: Vec::with_capacity(total),
        };

        for (index, batch) in batches.into_iter().enumerate() {
            let size = batch.len();
            let outcome = match submit_fn(batch).await {
                Ok(response) => {
                    info!(batch = index + 1, total, size, "Batch submitted");
                    BatchOutcome {
                        index,
                        size,
                        success: true,
                        response: Some(response),
                        error: None,
                    }
                }
                Err(e) => {
                    error!(batch = index + 1, total, size, error = %e, "Batch failed");
                    BatchOutcome {
                        index,
                        size,
                        success: false,
                        response: None,
                        error: Some(format!("{e:#}")),
                    }
                }
            };
            report.outcomes.push(outcome);
        }
        report
    }

    /// Groups `documents` and submits the batches to `sink`.
    pub async fn submit_all<T, S>(&self, documents: Vec<T>, sink: &S) -> BatchReport
    where
        T: Send + 'static,
        S: BatchSink<T> + ?Sized,
    {
        let batches = self.group(documents);
        self.submit_batches(batches, sink).await
    }
}
