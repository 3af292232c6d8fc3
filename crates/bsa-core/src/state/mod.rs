// # Store Implementations
//
// This module provides implementations of the storage traits for different
// persistence strategies, plus the in-memory registry view.

pub mod file;
pub mod memory;
pub mod snapshot;

use std::path::Path;
use std::sync::Arc;

pub use file::{FileChangeLog, FileJobStore, FileLeaseStore, FileUnblockableStore};
pub use memory::{MemoryChangeLog, MemoryJobStore, MemoryLeaseStore, MemoryUnblockableStore};
pub use snapshot::{
    DomainSnapshot, MemoryRegistry, RegistrySnapshot, ReservedListSnapshot, TldSnapshot, TldType,
};

use crate::Error;
use crate::config::StorageConfig;
use crate::traits::{ChangeLogStore, LeaseStore, RefreshJobStore, UnblockableStore};

/// The four stores the refresh pipeline writes to
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn RefreshJobStore>,
    pub change_log: Arc<dyn ChangeLogStore>,
    pub unblockable: Arc<dyn UnblockableStore>,
    pub leases: Arc<dyn LeaseStore>,
}

impl Stores {
    /// Fresh in-memory stores
    pub fn memory() -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            change_log: Arc::new(MemoryChangeLog::new()),
            unblockable: Arc::new(MemoryUnblockableStore::new()),
            leases: Arc::new(MemoryLeaseStore::new()),
        }
    }

    /// File-backed stores rooted at `dir`
    pub async fn file<P: AsRef<Path>>(dir: P) -> Result<Self, Error> {
        let dir = dir.as_ref();
        Ok(Self {
            jobs: Arc::new(FileJobStore::new(dir.join("jobs.json")).await?),
            change_log: Arc::new(FileChangeLog::new(dir.join("refresh")).await?),
            unblockable: Arc::new(FileUnblockableStore::new(dir.join("unblockable.json")).await?),
            leases: Arc::new(FileLeaseStore::new(dir.join("leases")).await?),
        })
    }

    /// Build stores from configuration
    pub async fn from_config(config: &StorageConfig) -> Result<Self, Error> {
        config.validate()?;
        match config {
            StorageConfig::Memory => Ok(Self::memory()),
            StorageConfig::File { dir } => Self::file(dir).await,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
