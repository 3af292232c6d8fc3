// # Memory Stores
//
// In-memory implementations of the storage traits.
//
// ## Purpose
//
// Simple, fast stores that don't persist across restarts. Useful for tests,
// embedded use and single-process deployments where losing the checkpoint on
// restart is acceptable.
//
// ## Crash Behavior
//
// - All state is lost on restart/crash
// - The first run after a crash starts a new job and reports the whole
//   unblockable set as additions
// - Leases only exclude engines within the same process

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::model::{RefreshJob, Stage, UnblockableDomain, UnblockableDomainChange};
use crate::traits::{ChangeLogStore, LeaseStore, RefreshJobStore, UnblockableStore, WriteOutcome};

/// A held lease
#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// In-memory lease store
///
/// # Example
///
/// ```rust,no_run
/// use bsa_core::state::MemoryLeaseStore;
/// use bsa_core::traits::LeaseStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryLeaseStore::new();
///     let now = chrono::Utc::now();
///     let expires = now + chrono::Duration::seconds(30);
///
///     assert!(store.try_acquire("bsa-refresh", "worker-a", now, expires).await?);
///     assert!(!store.try_acquire("bsa-refresh", "worker-b", now, expires).await?);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<RwLock<HashMap<String, Lease>>>,
}

impl MemoryLeaseStore {
    /// Create an empty lease store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `name`, expired or not
    pub async fn holder(&self, name: &str) -> Option<String> {
        self.leases.read().await.get(name).map(|l| l.holder.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let mut guard = self.leases.write().await;

        if let Some(existing) = guard.get(name)
            && existing.holder != holder
            && existing.expires_at > now
        {
            return Ok(false);
        }

        guard.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), Error> {
        let mut guard = self.leases.write().await;
        if guard.get(name).is_some_and(|l| l.holder == holder) {
            guard.remove(name);
        }
        Ok(())
    }
}

/// In-memory change log
#[derive(Debug, Clone, Default)]
pub struct MemoryChangeLog {
    logs: Arc<RwLock<HashMap<String, Vec<UnblockableDomainChange>>>>,
}

impl MemoryChangeLog {
    /// Create an empty change log
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of all jobs with a recorded diff
    pub async fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.logs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ChangeLogStore for MemoryChangeLog {
    async fn write(
        &self,
        job_id: &str,
        changes: &[UnblockableDomainChange],
    ) -> Result<WriteOutcome, Error> {
        let mut guard = self.logs.write().await;
        if guard.contains_key(job_id) {
            return Ok(WriteOutcome::AlreadyPresent);
        }
        guard.insert(job_id.to_string(), changes.to_vec());
        Ok(WriteOutcome::Written)
    }

    async fn read(&self, job_id: &str) -> Result<Vec<UnblockableDomainChange>, Error> {
        self.logs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("No change log for job {}", job_id)))
    }

    async fn exists(&self, job_id: &str) -> Result<bool, Error> {
        Ok(self.logs.read().await.contains_key(job_id))
    }
}

/// In-memory unblockable domain store
///
/// Each batch is applied under a single write lock, so readers never observe
/// a partially applied batch.
#[derive(Debug, Clone, Default)]
pub struct MemoryUnblockableStore {
    inner: Arc<RwLock<BTreeMap<String, UnblockableDomain>>>,
}

impl MemoryUnblockableStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of domains in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl UnblockableStore for MemoryUnblockableStore {
    async fn apply_batch(
        &self,
        upserts: &[UnblockableDomain],
        deletes: &[String],
    ) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        for domain in upserts {
            guard.insert(domain.domain_name.clone(), domain.clone());
        }
        for name in deletes {
            guard.remove(name);
        }
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<UnblockableDomain>, Error> {
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn get(&self, domain_name: &str) -> Result<Option<UnblockableDomain>, Error> {
        Ok(self.inner.read().await.get(domain_name).cloned())
    }
}

/// In-memory refresh job store
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<Vec<RefreshJob>>>,
}

impl MemoryJobStore {
    /// Create an empty job store
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a job by id
    pub async fn get(&self, job_id: &str) -> Option<RefreshJob> {
        self.jobs
            .read()
            .await
            .iter()
            .find(|j| j.job_id == job_id)
            .cloned()
    }
}

#[async_trait]
impl RefreshJobStore for MemoryJobStore {
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<RefreshJob>, Error> {
        let guard = self.jobs.read().await;
        let mut jobs = guard.clone();
        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn insert(&self, job: &RefreshJob) -> Result<(), Error> {
        let mut guard = self.jobs.write().await;
        if guard.iter().any(|j| j.job_id == job.job_id) {
            return Err(Error::job_store(format!("Job {} already exists", job.job_id)));
        }
        guard.push(job.clone());
        Ok(())
    }

    async fn update_stage(&self, job_id: &str, stage: Stage) -> Result<(), Error> {
        let mut guard = self.jobs.write().await;
        let job = guard
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .ok_or_else(|| Error::not_found(format!("No refresh job {}", job_id)))?;
        job.advance_to(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Reason;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_lease_acquire_and_release() {
        let store = MemoryLeaseStore::new();
        let now = ts("2024-01-01T00:00:00Z");
        let later = now + chrono::Duration::seconds(30);

        assert!(store.try_acquire("l", "a", now, later).await.unwrap());
        assert!(!store.try_acquire("l", "b", now, later).await.unwrap());
        // Same holder renews
        assert!(store.try_acquire("l", "a", now, later).await.unwrap());

        // Release by a non-holder is ignored
        store.release("l", "b").await.unwrap();
        assert_eq!(store.holder("l").await.as_deref(), Some("a"));

        store.release("l", "a").await.unwrap();
        assert!(store.try_acquire("l", "b", now, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_takeover_after_expiry() {
        let store = MemoryLeaseStore::new();
        let now = ts("2024-01-01T00:00:00Z");
        let expires = now + chrono::Duration::seconds(30);

        assert!(store.try_acquire("l", "a", now, expires).await.unwrap());
        assert!(!store.try_acquire("l", "b", expires - chrono::Duration::milliseconds(1), expires).await.unwrap());
        assert!(store.try_acquire("l", "b", expires, expires + chrono::Duration::seconds(30)).await.unwrap());
        assert_eq!(store.holder("l").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_change_log_is_write_once() {
        let log = MemoryChangeLog::new();
        let first = vec![UnblockableDomainChange::new_unblockable(UnblockableDomain::new(
            "blocked1.app",
            Reason::Reserved,
        ))];
        let second = vec![UnblockableDomainChange::removed(UnblockableDomain::new(
            "blocked1.app",
            Reason::Reserved,
        ))];

        assert!(!log.exists("job").await.unwrap());
        assert_eq!(log.write("job", &first).await.unwrap(), WriteOutcome::Written);
        assert_eq!(log.write("job", &second).await.unwrap(), WriteOutcome::AlreadyPresent);
        assert_eq!(log.read("job").await.unwrap(), first);
        assert!(matches!(log.read("other").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unblockable_store_batch() {
        let store = MemoryUnblockableStore::new();
        assert!(store.is_empty().await);

        store
            .apply_batch(
                &[
                    UnblockableDomain::new("a.app", Reason::Reserved),
                    UnblockableDomain::new("b.dev", Reason::Registered),
                ],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(store.len().await, 2);

        store
            .apply_batch(
                &[UnblockableDomain::new("a.app", Reason::Registered)],
                &["b.dev".to_string(), "missing.dev".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(
            store.get_all().await.unwrap(),
            vec![UnblockableDomain::new("a.app", Reason::Registered)]
        );
        assert!(store.get("b.dev").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_store_recent_and_update() {
        let store = MemoryJobStore::new();
        let older = RefreshJob::new(ts("2024-01-01T00:00:00Z"));
        let newer = RefreshJob::new(ts("2024-01-01T00:00:01Z"));

        store.insert(&older).await.unwrap();
        store.insert(&newer).await.unwrap();
        assert!(store.insert(&newer).await.is_err());

        let recent = store.recent_jobs(1).await.unwrap();
        assert_eq!(recent, vec![newer.clone()]);

        store.update_stage(&newer.job_id, Stage::ApplyDiff).await.unwrap();
        assert!(store.update_stage(&newer.job_id, Stage::MakeDiff).await.is_err());
        assert!(store.update_stage("nope", Stage::Done).await.is_err());
        assert_eq!(store.get(&newer.job_id).await.unwrap().stage, Stage::ApplyDiff);
    }
}
