// # File Stores
//
// File-based implementations of the storage traits with crash recovery.
//
// ## Purpose
//
// Persist job checkpoints, change logs, leases and the unblockable set
// across restarts and crashes. A refresh interrupted mid-stage resumes from
// the last checkpoint written here.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good document
// - Recovery: Falls back to backup if corruption detected
//
// ## Shared Directories
//
// Several workers may open the same directory. Nothing is cached in memory:
// every operation re-reads its document while holding an exclusive advisory
// lock (`flock`) on a sibling `.lock` file, so a read-modify-write never
// interleaves with another process. Lock files are never deleted.
//
// ## Directory Layout
//
// ```text
// <dir>/
//   unblockable.json        # the persisted unblockable set
//   unblockable.lock
//   jobs.json               # refresh jobs and their stages
//   jobs.lock
//   leases/<name>.json      # one lease record per lock name
//   leases/<name>.lock
//   refresh/<job_id>.json   # one change log per job, never rewritten
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::Error;
use crate::model::{RefreshJob, Stage, UnblockableDomain, UnblockableDomainChange};
use crate::traits::{ChangeLogStore, LeaseStore, RefreshJobStore, UnblockableStore, WriteOutcome};

/// Document format version
/// Used for future migration if format changes
const FILE_FORMAT_VERSION: &str = "1.0";

/// Serializable unblockable set document
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct UnblockableFile {
    version: String,
    domains: BTreeMap<String, UnblockableDomain>,
}

/// Serializable job document
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct JobsFile {
    version: String,
    jobs: Vec<RefreshJob>,
}

/// Serializable lease record
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct LeaseFile {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// File-backed unblockable domain store
///
/// The whole set lives in one JSON document. Each batch re-reads the
/// document, applies the changes and writes it back atomically under the
/// directory lock, so a crash leaves either the previous or the new document
/// on disk.
///
/// # Example
///
/// ```rust,no_run
/// use bsa_core::model::{Reason, UnblockableDomain};
/// use bsa_core::state::FileUnblockableStore;
/// use bsa_core::traits::UnblockableStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileUnblockableStore::new("/var/lib/bsa/unblockable.json").await?;
///
///     store
///         .apply_batch(&[UnblockableDomain::new("blocked1.app", Reason::Reserved)], &[])
///         .await?;
///
///     assert!(store.get("blocked1.app").await?.is_some());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileUnblockableStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileUnblockableStore {
    /// Open a file-backed unblockable store
    ///
    /// This will:
    /// 1. Create parent directories if needed
    /// 2. Try to load the existing document
    /// 3. If corruption detected, try to load from backup
    /// 4. If both fail, start with an empty set
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path).await?;

        let store = Self {
            lock_path: path.with_extension("lock"),
            path,
        };
        let domains = store.load().await?;
        tracing::debug!(
            "Opened unblockable set {}: {} domains",
            store.path.display(),
            domains.len()
        );
        Ok(store)
    }

    async fn load(&self) -> Result<BTreeMap<String, UnblockableDomain>, Error> {
        let _lock = lock_exclusive(&self.lock_path).await?;
        let doc: UnblockableFile = load_with_recovery(&self.path).await?;
        Ok(doc.domains)
    }
}

#[async_trait]
impl UnblockableStore for FileUnblockableStore {
    async fn apply_batch(
        &self,
        upserts: &[UnblockableDomain],
        deletes: &[String],
    ) -> Result<(), Error> {
        let _lock = lock_exclusive(&self.lock_path).await?;

        let mut doc: UnblockableFile = load_with_recovery(&self.path).await?;
        for domain in upserts {
            doc.domains.insert(domain.domain_name.clone(), domain.clone());
        }
        for name in deletes {
            doc.domains.remove(name);
        }
        doc.version = FILE_FORMAT_VERSION.to_string();

        write_atomic(&self.path, &doc).await
    }

    async fn get_all(&self) -> Result<Vec<UnblockableDomain>, Error> {
        Ok(self.load().await?.into_values().collect())
    }

    async fn get(&self, domain_name: &str) -> Result<Option<UnblockableDomain>, Error> {
        Ok(self.load().await?.remove(domain_name))
    }
}

/// File-backed refresh job store
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileJobStore {
    /// Open a file-backed job store
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path).await?;

        let store = Self {
            lock_path: path.with_extension("lock"),
            path,
        };
        // Surface an unreadable document at startup
        {
            let _lock = lock_exclusive(&store.lock_path).await?;
            let _: JobsFile = load_with_recovery(&store.path).await?;
        }
        Ok(store)
    }

    /// Re-read the document, apply `change` and write it back under the lock
    async fn modify<F>(&self, change: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Vec<RefreshJob>) -> Result<(), Error> + Send,
    {
        let _lock = lock_exclusive(&self.lock_path).await?;

        let mut doc: JobsFile = load_with_recovery(&self.path).await?;
        change(&mut doc.jobs)?;
        doc.version = FILE_FORMAT_VERSION.to_string();

        write_atomic(&self.path, &doc).await
    }
}

#[async_trait]
impl RefreshJobStore for FileJobStore {
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<RefreshJob>, Error> {
        let _lock = lock_exclusive(&self.lock_path).await?;
        let doc: JobsFile = load_with_recovery(&self.path).await?;

        let mut jobs = doc.jobs;
        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn insert(&self, job: &RefreshJob) -> Result<(), Error> {
        self.modify(|jobs| {
            if jobs.iter().any(|j| j.job_id == job.job_id) {
                return Err(Error::job_store(format!("Job {} already exists", job.job_id)));
            }
            jobs.push(job.clone());
            Ok(())
        })
        .await
    }

    async fn update_stage(&self, job_id: &str, stage: Stage) -> Result<(), Error> {
        self.modify(|jobs| {
            jobs.iter_mut()
                .find(|j| j.job_id == job_id)
                .ok_or_else(|| Error::not_found(format!("No refresh job {}", job_id)))?
                .advance_to(stage)
        })
        .await
    }
}

/// File-backed change log
///
/// One file per job, published with a hard link: the first writer
/// wins and later writes report [`WriteOutcome::AlreadyPresent`].
#[derive(Debug)]
pub struct FileChangeLog {
    dir: PathBuf,
}

impl FileChangeLog {
    /// Open (and create if needed) a change log directory
    pub async fn new<P: AsRef<Path>>(dir: P) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::config(format!(
                "Failed to create change log directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    fn log_path(&self, job_id: &str) -> Result<PathBuf, Error> {
        if job_id.is_empty() || job_id.contains(['/', '\\']) || job_id.starts_with('.') {
            return Err(Error::invalid_input(format!("Invalid job id: '{}'", job_id)));
        }
        Ok(self.dir.join(format!("{}.json", job_id)))
    }
}

#[async_trait]
impl ChangeLogStore for FileChangeLog {
    async fn write(
        &self,
        job_id: &str,
        changes: &[UnblockableDomainChange],
    ) -> Result<WriteOutcome, Error> {
        let path = self.log_path(job_id)?;
        let json = serde_json::to_string_pretty(changes)?;

        // Stage the content under a unique name, then publish it with a
        // hard link, which fails if the log already exists.
        let staging = self.dir.join(format!(".{}.{}.tmp", job_id, ulid::Ulid::new()));
        write_file(&staging, json.as_bytes()).await?;

        let published = fs::hard_link(&staging, &path).await;
        if let Err(e) = fs::remove_file(&staging).await {
            tracing::warn!("Failed to remove staging file {}: {}", staging.display(), e);
        }

        match published {
            Ok(()) => {
                tracing::debug!("Wrote change log {} ({} changes)", path.display(), changes.len());
                Ok(WriteOutcome::Written)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(WriteOutcome::AlreadyPresent),
            Err(e) => Err(Error::change_log(format!(
                "Failed to publish change log {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn read(&self, job_id: &str) -> Result<Vec<UnblockableDomainChange>, Error> {
        let path = self.log_path(job_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(format!("No change log for job {}", job_id)));
            }
            Err(e) => {
                return Err(Error::change_log(format!(
                    "Failed to read change log {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        serde_json::from_str(&content).map_err(|e| {
            Error::change_log(format!(
                "Failed to parse change log {}: {}",
                path.display(),
                e
            ))
        })
    }

    async fn exists(&self, job_id: &str) -> Result<bool, Error> {
        let path = self.log_path(job_id)?;
        Ok(fs::try_exists(&path).await?)
    }
}

/// File-backed lease store
///
/// One record per lease name. Every acquire and release reads, checks and
/// replaces the record while holding an exclusive `flock` on the lease's
/// `.lock` file, so workers in different processes never both win.
#[derive(Debug)]
pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    /// Open (and create if needed) a lease directory
    pub async fn new<P: AsRef<Path>>(dir: P) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::config(format!(
                "Failed to create lease directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    fn lease_paths(&self, name: &str) -> Result<(PathBuf, PathBuf), Error> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(Error::invalid_input(format!("Invalid lease name: '{}'", name)));
        }
        Ok((
            self.dir.join(format!("{}.json", name)),
            self.dir.join(format!("{}.lock", name)),
        ))
    }

    /// Current record; an unreadable record is an error, never a free lease
    async fn read_lease(path: &Path) -> Result<Option<LeaseFile>, Error> {
        match fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                Error::lock(format!(
                    "Lease file {} is unreadable, refusing to take it over: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::lock(format!(
                "Failed to read lease file {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let (path, lock_path) = self.lease_paths(name)?;
        let _lock = lock_exclusive(&lock_path).await?;

        if let Some(existing) = Self::read_lease(&path).await?
            && existing.holder != holder
            && existing.expires_at > now
        {
            return Ok(false);
        }

        let record = LeaseFile {
            holder: holder.to_string(),
            expires_at,
        };
        let temp = self.dir.join(format!(".{}.{}.tmp", name, ulid::Ulid::new()));
        write_file(&temp, &serde_json::to_vec_pretty(&record)?).await?;
        fs::rename(&temp, &path).await.map_err(|e| {
            Error::lock(format!("Failed to publish lease file {}: {}", path.display(), e))
        })?;
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), Error> {
        let (path, lock_path) = self.lease_paths(name)?;
        let _lock = lock_exclusive(&lock_path).await?;

        match Self::read_lease(&path).await? {
            Some(existing) if existing.holder == holder => match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::lock(format!(
                    "Failed to remove lease file {}: {}",
                    path.display(),
                    e
                ))),
            },
            _ => Ok(()),
        }
    }
}

/// Take an exclusive advisory lock on `path`, creating it if needed
///
/// The lock is held until the returned handle is dropped. Locks taken
/// through separate handles exclude each other within one process too.
async fn lock_exclusive(path: &Path) -> Result<std::fs::File, Error> {
    let owned = path.to_path_buf();
    let locked = tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&owned)?;
        file.lock_exclusive()?;
        Ok::<_, std::io::Error>(file)
    })
    .await
    .map_err(|e| Error::lock(format!("Lock task for {} failed: {}", path.display(), e)))?;

    locked.map_err(|e| Error::lock(format!("Failed to lock {}: {}", path.display(), e)))
}

async fn ensure_parent(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !fs::try_exists(parent).await.unwrap_or(false)
    {
        fs::create_dir_all(parent).await.map_err(|e| {
            Error::config(format!(
                "Failed to create state directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// Load a document, falling back to its backup if the main file is corrupted
///
/// Recovery strategy:
/// 1. Try to load main file (missing file means empty document)
/// 2. If JSON parse error, try loading backup and restore it
/// 3. If backup also fails, start with an empty document
async fn load_with_recovery<T>(path: &Path) -> Result<T, Error>
where
    T: DeserializeOwned + Default,
{
    match load(path).await {
        Ok(doc) => Ok(doc),
        Err(Error::Json(e)) => {
            tracing::warn!(
                "State file {} appears corrupted: {}. Attempting recovery from backup.",
                path.display(),
                e
            );

            let backup = backup_path(path);
            if !fs::try_exists(&backup).await.unwrap_or(false) {
                tracing::warn!("No backup file found. Starting with empty state.");
                return Ok(T::default());
            }

            match load(&backup).await {
                Ok(doc) => {
                    tracing::info!("Recovered state from backup {}", backup.display());
                    if let Err(restore_err) = fs::copy(&backup, path).await {
                        tracing::error!(
                            "Failed to restore state file from backup: {}",
                            restore_err
                        );
                    }
                    Ok(doc)
                }
                Err(backup_err) => {
                    tracing::error!(
                        "Backup also corrupted: {}. Starting with empty state.",
                        backup_err
                    );
                    Ok(T::default())
                }
            }
        }
        Err(e) => Err(e),
    }
}

async fn load<T>(path: &Path) -> Result<T, Error>
where
    T: DeserializeOwned + Default,
{
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!("State file does not exist: {}", path.display());
            return Ok(T::default());
        }
        Err(e) => {
            return Err(Error::store(format!(
                "Failed to read state file {}: {}",
                path.display(),
                e
            )));
        }
    };

    Ok(serde_json::from_str(&content)?)
}

/// Write a document atomically, keeping the previous one as `.backup`
async fn write_atomic<T: Serialize>(path: &Path, doc: &T) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(doc)?;

    let mut temp = path.to_path_buf();
    temp.set_extension("tmp");
    write_file(&temp, json.as_bytes()).await?;

    if fs::try_exists(path).await.unwrap_or(false)
        && let Err(e) = fs::copy(path, backup_path(path)).await
    {
        tracing::warn!("Failed to create backup: {}", e);
    }

    fs::rename(&temp, path).await.map_err(|e| {
        Error::store(format!(
            "Failed to rename {} to {}: {}",
            temp.display(),
            path.display(),
            e
        ))
    })?;

    tracing::trace!("State written to file: {}", path.display());
    Ok(())
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let mut file = fs::File::create(path).await.map_err(|e| {
        Error::store(format!("Failed to create temp file {}: {}", path.display(), e))
    })?;
    file.write_all(bytes).await.map_err(|e| {
        Error::store(format!("Failed to write to temp file {}: {}", path.display(), e))
    })?;
    file.sync_all().await.map_err(|e| {
        Error::store(format!("Failed to sync temp file {}: {}", path.display(), e))
    })?;
    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut backup = path.to_path_buf();
    backup.set_extension("backup");
    backup
}
