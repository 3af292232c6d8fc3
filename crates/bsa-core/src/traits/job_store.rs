// # Refresh Job Store Trait
//
// Durable storage for refresh jobs and their stage checkpoints.

use async_trait::async_trait;

use crate::model::{RefreshJob, Stage};

/// Trait for refresh job store implementations
#[async_trait]
pub trait RefreshJobStore: Send + Sync {
    /// The most recent jobs by start time, newest first, at most `limit`
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<RefreshJob>, crate::Error>;

    /// Persist a newly created job
    ///
    /// Fails if a job with the same id already exists.
    async fn insert(&self, job: &RefreshJob) -> Result<(), crate::Error>;

    /// Persist a new checkpoint for `job_id`
    ///
    /// # Returns
    ///
    /// - `Ok(())`: The checkpoint is durable
    /// - `Err(Error::NotFound)`: No such job
    /// - `Err(Error::InvalidInput)`: `stage` is behind the stored stage
    async fn update_stage(&self, job_id: &str, stage: Stage) -> Result<(), crate::Error>;
}
