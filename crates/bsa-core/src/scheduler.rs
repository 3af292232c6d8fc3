//! Refresh job scheduling
//!
//! Decides, per invocation, whether to resume an unfinished job or start a
//! new one. Resuming the same job id (rather than starting over) is what keeps
//! crashed invocations from double-applying or double-reporting a diff.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::model::{RefreshJob, Stage};
use crate::traits::{DownloadStatus, RefreshJobStore};

/// The job assigned to one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSchedule {
    /// The job to drive
    pub job: RefreshJob,
    /// Start time of the job before this one, if any
    pub prev_job_start_time: Option<DateTime<Utc>>,
}

impl RefreshSchedule {
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    pub fn stage(&self) -> Stage {
        self.job.stage
    }

    /// Persist `next` as the job's checkpoint, then reflect it locally
    pub async fn advance(&mut self, jobs: &dyn RefreshJobStore, next: Stage) -> Result<()> {
        jobs.update_stage(&self.job.job_id, next).await?;
        self.job.advance_to(next)
    }
}

/// Assigns work for each refresh invocation
pub struct RefreshScheduler {
    jobs: Arc<dyn RefreshJobStore>,
    downloads: Arc<dyn DownloadStatus>,
    clock: Arc<dyn Clock>,
}

impl RefreshScheduler {
    pub fn new(
        jobs: Arc<dyn RefreshJobStore>,
        downloads: Arc<dyn DownloadStatus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            downloads,
            clock,
        }
    }

    /// Load or create the job for this invocation
    ///
    /// # Returns
    ///
    /// - `Ok(Some(schedule))`: An unfinished job to resume, or a new job
    ///   positioned at `MakeDiff`
    /// - `Ok(None)`: No blocklist download has completed yet; nothing to do
    /// - `Err(Error)`: Job store or download status failure
    pub async fn schedule(&self) -> Result<Option<RefreshSchedule>> {
        let recent = self.jobs.recent_jobs(2).await?;

        if let Some(latest) = recent.first()
            && !latest.is_done()
        {
            info!("Resuming refresh job {} at {}", latest.job_id, latest.stage);
            return Ok(Some(RefreshSchedule {
                job: latest.clone(),
                prev_job_start_time: recent.get(1).map(|j| j.start_time),
            }));
        }

        let Some(download) = self.downloads.latest_completed_download().await? else {
            info!("No completed blocklist download yet, skipping refresh");
            return Ok(None);
        };
        debug!("Latest completed download started at {}", download);

        let job = RefreshJob::new(self.clock.now());
        self.jobs.insert(&job).await?;
        info!("Created refresh job {}", job.job_id);

        Ok(Some(RefreshSchedule {
            job,
            prev_job_start_time: recent.first().map(|j| j.start_time),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::state::{MemoryJobStore, MemoryRegistry};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Fixture {
        jobs: Arc<MemoryJobStore>,
        registry: MemoryRegistry,
        clock: Arc<FakeClock>,
        scheduler: RefreshScheduler,
    }

    fn fixture() -> Fixture {
        let jobs = Arc::new(MemoryJobStore::new());
        let registry = MemoryRegistry::new();
        let clock = Arc::new(FakeClock::new(ts("2024-01-01T00:00:00Z")));
        let scheduler = RefreshScheduler::new(
            jobs.clone(),
            Arc::new(registry.clone()),
            clock.clone(),
        );
        Fixture {
            jobs,
            registry,
            clock,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_nothing_to_do_without_download() {
        let f = fixture();
        assert!(f.scheduler.schedule().await.unwrap().is_none());
        assert!(f.jobs.recent_jobs(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_job_created() {
        let f = fixture();
        f.registry.mark_download_completed(f.clock.now()).await;

        let schedule = f.scheduler.schedule().await.unwrap().unwrap();
        assert_eq!(schedule.job_id(), "2024-01-01T00:00:00.000Z-refresh");
        assert_eq!(schedule.stage(), Stage::MakeDiff);
        assert_eq!(schedule.prev_job_start_time, None);
        assert_eq!(f.jobs.recent_jobs(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_job_resumed() {
        let f = fixture();
        f.registry.mark_download_completed(f.clock.now()).await;

        let mut first = f.scheduler.schedule().await.unwrap().unwrap();
        first.advance(&*f.jobs, Stage::ApplyDiff).await.unwrap();

        f.clock.advance_one_milli();
        let resumed = f.scheduler.schedule().await.unwrap().unwrap();
        assert_eq!(resumed.job_id(), first.job_id());
        assert_eq!(resumed.stage(), Stage::ApplyDiff);
        assert_eq!(f.jobs.recent_jobs(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_new_job_after_done() {
        let f = fixture();
        f.registry.mark_download_completed(f.clock.now()).await;

        let mut first = f.scheduler.schedule().await.unwrap().unwrap();
        first.advance(&*f.jobs, Stage::Done).await.unwrap();

        f.clock.advance_one_milli();
        let second = f.scheduler.schedule().await.unwrap().unwrap();
        assert_ne!(second.job_id(), first.job_id());
        assert_eq!(second.stage(), Stage::MakeDiff);
        assert_eq!(second.prev_job_start_time, Some(first.job.start_time));
    }

    #[tokio::test]
    async fn test_resume_reports_previous_job_start() {
        let f = fixture();
        f.registry.mark_download_completed(f.clock.now()).await;

        let mut first = f.scheduler.schedule().await.unwrap().unwrap();
        first.advance(&*f.jobs, Stage::Done).await.unwrap();
        f.clock.advance_one_milli();
        let second = f.scheduler.schedule().await.unwrap().unwrap();

        f.clock.advance_one_milli();
        let resumed = f.scheduler.schedule().await.unwrap().unwrap();
        assert_eq!(resumed.job_id(), second.job_id());
        assert_eq!(resumed.prev_job_start_time, Some(first.job.start_time));
    }
}
