// # Registry Snapshot
//
// In-memory `RegistryView` + `DownloadStatus` backed by a JSON document.
//
// ## Purpose
//
// The refresh pipeline only reads registry state. `MemoryRegistry` holds that
// state in one serializable `RegistrySnapshot`, so the daemon can load it
// from disk and tests can build and mutate it directly.
//
// ## File Format
//
// ```json
// {
//   "tlds": {
//     "app": {
//       "tld_type": "REAL",
//       "bsa_enroll_start_time": "2024-01-01T00:00:00Z",
//       "reserved_lists": ["app-reserved"]
//     }
//   },
//   "reserved_lists": {
//     "app-reserved": {
//       "should_publish": true,
//       "entries": { "blocked1": "RESERVED_FOR_SPECIFIC_USE" }
//     }
//   },
//   "domains": [
//     { "domain_name": "abc.dev", "creation_time": "2024-01-01T00:00:00Z" }
//   ],
//   "latest_completed_download": "2024-01-01T00:00:00Z"
// }
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::model::ReservationType;
use crate::traits::{DownloadStatus, RegistryView};

/// Whether a TLD is live or a test TLD
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TldType {
    #[default]
    Real,
    Test,
}

/// A TLD and its BSA-relevant settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TldSnapshot {
    #[serde(default)]
    pub tld_type: TldType,

    /// When BSA enrollment starts; never enrolled if absent
    #[serde(default)]
    pub bsa_enroll_start_time: Option<DateTime<Utc>>,

    /// Names of reserved lists attached to this TLD
    #[serde(default)]
    pub reserved_lists: Vec<String>,
}

/// A named reserved list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedListSnapshot {
    /// Whether the list is published (unpublished lists never exempt names)
    #[serde(default = "default_should_publish")]
    pub should_publish: bool,

    /// label -> reservation type
    #[serde(default)]
    pub entries: BTreeMap<String, ReservationType>,
}

impl Default for ReservedListSnapshot {
    fn default() -> Self {
        Self {
            should_publish: default_should_publish(),
            entries: BTreeMap::new(),
        }
    }
}

fn default_should_publish() -> bool {
    true
}

/// A domain and its lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub domain_name: String,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub deletion_time: Option<DateTime<Utc>>,
}

impl DomainSnapshot {
    /// Whether the domain exists and is not deleted at `as_of`
    pub fn is_active_at(&self, as_of: DateTime<Utc>) -> bool {
        self.creation_time <= as_of && self.deletion_time.is_none_or(|d| d > as_of)
    }

    /// The TLD part of the name (everything after the first label)
    pub fn tld(&self) -> Option<&str> {
        self.domain_name
            .trim()
            .trim_end_matches('.')
            .split_once('.')
            .map(|(_, tld)| tld)
    }

    /// Whether the domain sits under `tld`, compared case-insensitively
    pub fn is_under(&self, tld: &str) -> bool {
        self.tld().is_some_and(|own| own.eq_ignore_ascii_case(tld))
    }
}

/// Serializable registry state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub tlds: BTreeMap<String, TldSnapshot>,

    #[serde(default)]
    pub reserved_lists: BTreeMap<String, ReservedListSnapshot>,

    #[serde(default)]
    pub domains: Vec<DomainSnapshot>,

    /// Start time of the latest completed blocklist download
    #[serde(default)]
    pub latest_completed_download: Option<DateTime<Utc>>,
}

/// In-memory registry view
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<RwLock<RegistrySnapshot>>,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding `snapshot`
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Load a registry from a JSON snapshot file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::registry(format!(
                "Failed to read registry snapshot {}: {}",
                path.display(),
                e
            ))
        })?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&content).map_err(|e| {
            Error::registry(format!(
                "Failed to parse registry snapshot {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::debug!(
            "Loaded registry snapshot {}: {} TLDs, {} domains",
            path.display(),
            snapshot.tlds.len(),
            snapshot.domains.len()
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.inner.read().await.clone()
    }

    /// Add or replace a TLD
    pub async fn add_tld(&self, tld: &str, settings: TldSnapshot) {
        self.inner.write().await.tlds.insert(tld.to_string(), settings);
    }

    /// Enroll a (real) TLD in the BSA program from `start`
    ///
    /// Creates the TLD if it does not exist yet.
    pub async fn enroll_tld(&self, tld: &str, start: DateTime<Utc>) {
        let mut guard = self.inner.write().await;
        guard
            .tlds
            .entry(tld.to_string())
            .or_default()
            .bsa_enroll_start_time = Some(start);
    }

    /// Record a domain created at `created_at`
    pub async fn register_domain(&self, domain_name: &str, created_at: DateTime<Utc>) {
        self.inner.write().await.domains.push(DomainSnapshot {
            domain_name: domain_name.to_string(),
            creation_time: created_at,
            deletion_time: None,
        });
    }

    /// Mark every live registration of `domain_name` deleted at `deleted_at`
    pub async fn delete_domain(
        &self,
        domain_name: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        let mut found = false;
        for domain in guard
            .domains
            .iter_mut()
            .filter(|d| d.domain_name == domain_name && d.deletion_time.is_none())
        {
            domain.deletion_time = Some(deleted_at);
            found = true;
        }

        if found {
            Ok(())
        } else {
            Err(Error::not_found(format!("No live domain {}", domain_name)))
        }
    }

    /// Add `label` to reserved list `list` and attach the list to `tld`
    ///
    /// Creates a published list if it does not exist yet.
    pub async fn reserve_label(
        &self,
        tld: &str,
        list: &str,
        label: &str,
        reservation_type: ReservationType,
    ) {
        let mut guard = self.inner.write().await;
        guard
            .reserved_lists
            .entry(list.to_string())
            .or_default()
            .entries
            .insert(label.to_string(), reservation_type);

        let settings = guard.tlds.entry(tld.to_string()).or_default();
        if !settings.reserved_lists.iter().any(|l| l == list) {
            settings.reserved_lists.push(list.to_string());
        }
    }

    /// Remove `label` from reserved list `list`
    pub async fn unreserve_label(&self, list: &str, label: &str) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        let entries = &mut guard
            .reserved_lists
            .get_mut(list)
            .ok_or_else(|| Error::not_found(format!("No reserved list {}", list)))?
            .entries;

        entries
            .remove(label)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("Label {} is not on list {}", label, list)))
    }

    /// Record a completed blocklist download that started at `at`
    pub async fn mark_download_completed(&self, at: DateTime<Utc>) {
        self.inner.write().await.latest_completed_download = Some(at);
    }
}

#[async_trait]
impl RegistryView for MemoryRegistry {
    async fn bsa_enrolled_tlds(&self, as_of: DateTime<Utc>) -> Result<Vec<String>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .tlds
            .iter()
            .filter(|(_, t)| t.tld_type == TldType::Real)
            .filter(|(_, t)| t.bsa_enroll_start_time.is_some_and(|start| start <= as_of))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn active_domains(&self, tld: &str, as_of: DateTime<Utc>) -> Result<Vec<String>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .domains
            .iter()
            .filter(|d| d.is_under(tld) && d.is_active_at(as_of))
            .map(|d| d.domain_name.clone())
            .collect())
    }

    async fn publishable_reserved_labels(
        &self,
        tld: &str,
    ) -> Result<Vec<(String, ReservationType)>, Error> {
        let guard = self.inner.read().await;
        let Some(settings) = guard.tlds.get(tld) else {
            return Err(Error::not_found(format!("No TLD {}", tld)));
        };

        let mut labels = Vec::new();
        for list_name in &settings.reserved_lists {
            match guard.reserved_lists.get(list_name) {
                Some(list) if list.should_publish => {
                    labels.extend(list.entries.iter().map(|(l, t)| (l.clone(), *t)));
                }
                Some(_) => {}
                None => {
                    tracing::warn!("TLD {} references missing reserved list {}", tld, list_name);
                }
            }
        }
        Ok(labels)
    }
}

#[async_trait]
impl DownloadStatus for MemoryRegistry {
    async fn latest_completed_download(&self) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(self.inner.read().await.latest_completed_download)
    }
}
