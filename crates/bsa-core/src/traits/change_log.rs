// # Change Log Trait
//
// Append-only, job-keyed storage for refresh diffs.
//
// ## Purpose
//
// MAKE_DIFF records the computed diff here once. Every later stage, and any
// retry of those stages, reads the same record back instead of recomputing
// it. This is what makes the report stages resend the original batch even if
// registry state changed in between.
//
// ## Usage
//
// ```rust,ignore
// use bsa_core::traits::{ChangeLogStore, WriteOutcome};
//
// let outcome = change_log.write(&job.job_id, &changes).await?;
// if outcome == WriteOutcome::AlreadyPresent {
//     // a previous attempt already recorded this job's diff
// }
// let recorded = change_log.read(&job.job_id).await?;
// ```

use async_trait::async_trait;

use crate::model::UnblockableDomainChange;

/// Result of a change log write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The log for this job was created
    Written,
    /// A log for this job already existed and was left untouched
    AlreadyPresent,
}

/// Trait for change log implementations
///
/// There is deliberately no update or delete operation: a job's log is
/// immutable history once written.
#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    /// Record the diff for `job_id`
    ///
    /// A second write for the same job never overwrites the first.
    async fn write(
        &self,
        job_id: &str,
        changes: &[UnblockableDomainChange],
    ) -> Result<WriteOutcome, crate::Error>;

    /// Read the diff recorded for `job_id`
    ///
    /// # Returns
    ///
    /// - `Ok(Vec<_>)`: The recorded changes, in recorded order
    /// - `Err(Error::NotFound)`: Nothing was recorded for this job
    async fn read(&self, job_id: &str) -> Result<Vec<UnblockableDomainChange>, crate::Error>;

    /// Whether a diff has been recorded for `job_id`
    async fn exists(&self, job_id: &str) -> Result<bool, crate::Error>;
}
