//! Durable job queue for deferred and failed work.

mod job;
mod persistent;

pub use job::{FailOutcome, Job, JobStatus, QueueStats};
pub use persistent::{PersistentJobQueue, DEFAULT_MAX_ATTEMPTS};
