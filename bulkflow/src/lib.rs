//! # Bulkflow
//!
//! A resilient execution engine for bulk, multi-stage processing of work
//! items against flaky third-party services.
//!
//! Bulkflow provides:
//!
//! - **Circuit breakers**: per-service fail-fast guards with a recovery window
//! - **Retries**: exponential backoff, blocking or cooperative
//! - **Durable job queue**: priority-ordered deferred work with attempt caps
//! - **Pipelines**: bounded-concurrency stages separated by a barrier
//! - **Artifact cache**: content-addressed store for expensive outputs
//! - **Batch submission**: bounded batches reported one by one
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bulkflow::prelude::*;
//!
//! let config = EngineConfig::from_json_file(Path::new("bulkflow.json"))?;
//! init_tracing(&config.logging);
//!
//! let registry = Arc::new(config.breaker_registry());
//! let processor = PipelineProcessor::from_config(&config, registry)
//!     .with_dead_letter_queue(Arc::new(config.open_queue()?));
//!
//! let stages = vec![
//!     Stage::blocking("translate", translate).with_service("openai"),
//!     Stage::from_async("publish", publish).with_service("sanity"),
//! ];
//! let outcome = processor
//!     .process_pipeline(articles, &stages, FailurePolicy::StopOnError)
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod batch;
pub mod cache;
pub mod config;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod resilience;
pub mod storage;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchReport, BatchSink, BatchSubmitter};
    pub use crate::cache::{CacheEntry, CachedArtifact, ContentAddressableCache};
    pub use crate::config::EngineConfig;
    pub use crate::errors::{
        BulkflowError, CircuitOpenError, ClassifiedError, ErrorKind, StageError,
    };
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        FailurePolicy, PipelineItem, PipelineOutcome, PipelineProcessor, ProcessingResult, Stage,
    };
    pub use crate::queue::{FailOutcome, Job, JobStatus, PersistentJobQueue};
    pub use crate::resilience::{
        BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState, RetryExecutor, RetryPolicy,
    };
    pub use crate::utils::{Clock, SystemClock, Timestamp};
}
