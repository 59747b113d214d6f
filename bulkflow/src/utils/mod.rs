//! Utility functions for ids, timestamps and clocks.

pub mod timestamps;

pub use timestamps::{elapsed_between, Clock, ManualClock, SystemClock, Timestamp};

/// Generates a unique job id of the form `<job_type>_<uuid v7>`.
///
/// The v7 UUID is time-ordered, so ids of one type sort by creation.
#[must_use]
pub fn generate_job_id(job_type: &str) -> String {
    format!("{job_type}_{}", uuid::Uuid::now_v7().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_job_id_prefix() {
        let id = generate_job_id("process_article");
        assert!(id.starts_with("process_article_"));
    }

    #[test]
    fn test_generate_job_id_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| generate_job_id("x")).collect();
        assert_eq!(ids.len(), 1000);
    }
}
