//! Multi-stage bulk processing.
//!
//! A [`PipelineProcessor`] runs a collection of items through an ordered list
//! of [`Stage`]s. Within a stage items run concurrently up to a limit, each
//! invocation wrapped by the retry executor and, when the stage names a
//! service, that service's circuit breaker. Stages are separated by a barrier.

mod processor;
mod report;
mod result;
mod stage;

pub use processor::{PipelineOutcome, PipelineProcessor, StageResults};
pub use report::{FailurePolicy, PipelineReport, StageReport};
pub use result::{PipelineItem, ProcessingResult};
pub use stage::Stage;
