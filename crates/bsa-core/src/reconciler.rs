//! Unblockable set reconciliation
//!
//! Derives the target unblockable set from registry state and diffs it
//! against the persisted set.
//!
//! ## Target Set
//!
//! For every BSA-enrolled real TLD:
//! - active domains (as of `now - commit_time_lag`) are `REGISTERED`
//! - labels on publishable reserved lists with an exempt reservation type,
//!   joined with the TLD, are `RESERVED`
//!
//! A name that qualifies for both is `REGISTERED`.
//!
//! ## Diff
//!
//! | target  | persisted | change           |
//! |---------|-----------|------------------|
//! | present | absent    | `NEW`            |
//! | absent  | present   | `REMOVED`        |
//! | reason  | other     | `REASON_CHANGED` |
//! | reason  | same      | (none)           |
//!
//! Output is sorted by domain name.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{
    Reason, UnblockableDomain, UnblockableDomainChange, join_label, normalize_domain_name,
};
use crate::traits::{DownloadStatus, RegistryView, UnblockableStore};

/// Default buffer subtracted from "now" when reading active domains
pub const DEFAULT_COMMIT_TIME_LAG: Duration = Duration::from_millis(200);

/// Computes refresh diffs
pub struct Reconciler {
    registry: Arc<dyn RegistryView>,
    downloads: Arc<dyn DownloadStatus>,
    store: Arc<dyn UnblockableStore>,
    clock: Arc<dyn Clock>,
    commit_time_lag: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn RegistryView>,
        downloads: Arc<dyn DownloadStatus>,
        store: Arc<dyn UnblockableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            downloads,
            store,
            clock,
            commit_time_lag: DEFAULT_COMMIT_TIME_LAG,
        }
    }

    /// Set the buffer subtracted from "now" when reading active domains
    pub fn with_commit_time_lag(mut self, lag: Duration) -> Self {
        self.commit_time_lag = lag;
        self
    }

    /// Compute the diff between the current target set and the persisted set
    ///
    /// Returns an empty diff (and logs) if no blocklist download has completed.
    pub async fn compute_diff(&self) -> Result<Vec<UnblockableDomainChange>> {
        if self.downloads.latest_completed_download().await?.is_none() {
            info!("No completed blocklist download, refusing to compute refresh diff");
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let target = self.compute_target(now).await?;
        let persisted = self.store.get_all().await?;
        let changes = diff(&target, &persisted)?;

        info!(
            "Computed refresh diff: {} target, {} persisted, {} changes",
            target.len(),
            persisted.len(),
            changes.len()
        );
        Ok(changes)
    }

    /// The unblockable set implied by registry state at `now`
    pub async fn compute_target(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, Reason>> {
        let lag = chrono::Duration::from_std(self.commit_time_lag)
            .map_err(|e| Error::config(format!("Invalid commit time lag: {}", e)))?;
        let as_of = now - lag;

        let tlds = self.registry.bsa_enrolled_tlds(now).await?;
        debug!("Reconciling {} enrolled TLDs as of {}", tlds.len(), as_of);

        let mut tasks = JoinSet::new();
        for tld in tlds {
            let registry = Arc::clone(&self.registry);
            tasks.spawn(async move { unblockables_for_tld(registry.as_ref(), &tld, as_of).await });
        }

        let mut target = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let names = joined
                .map_err(|e| Error::registry(format!("TLD reconciliation task failed: {}", e)))??;
            for (name, reason) in names {
                target
                    .entry(name)
                    .and_modify(|r: &mut Reason| *r = r.stronger(reason))
                    .or_insert(reason);
            }
        }
        Ok(target)
    }
}

async fn unblockables_for_tld(
    registry: &dyn RegistryView,
    tld: &str,
    as_of: DateTime<Utc>,
) -> Result<Vec<(String, Reason)>> {
    let mut names = Vec::new();

    for name in registry.active_domains(tld, as_of).await? {
        match normalize_domain_name(&name) {
            Ok(normalized) => names.push((normalized, Reason::Registered)),
            Err(e) => warn!("Skipping registered domain on {}: {}", tld, e),
        }
    }

    for (label, reservation_type) in registry.publishable_reserved_labels(tld).await? {
        if !reservation_type.is_blocklist_exempt() {
            continue;
        }
        match join_label(&label, tld) {
            Ok(normalized) => names.push((normalized, Reason::Reserved)),
            Err(e) => warn!("Skipping reserved label on {}: {}", tld, e),
        }
    }

    debug!("TLD {}: {} unblockable candidates", tld, names.len());
    Ok(names)
}

/// Diff a target set against the persisted set, sorted by domain name
pub fn diff(
    target: &BTreeMap<String, Reason>,
    persisted: &[UnblockableDomain],
) -> Result<Vec<UnblockableDomainChange>> {
    let persisted: BTreeMap<&str, &UnblockableDomain> = persisted
        .iter()
        .map(|d| (d.domain_name.as_str(), d))
        .collect();

    let mut changes: BTreeMap<&str, UnblockableDomainChange> = BTreeMap::new();

    for (name, &reason) in target {
        match persisted.get(name.as_str()) {
            None => {
                changes.insert(
                    name.as_str(),
                    UnblockableDomainChange::new_unblockable(UnblockableDomain::new(
                        name.clone(),
                        reason,
                    )),
                );
            }
            Some(existing) if existing.reason != reason => {
                changes.insert(
                    name.as_str(),
                    UnblockableDomainChange::reason_changed(
                        UnblockableDomain::new(name.clone(), reason),
                        existing.reason,
                    )?,
                );
            }
            Some(_) => {}
        }
    }

    for (name, existing) in &persisted {
        if !target.contains_key(*name) {
            changes.insert(*name, UnblockableDomainChange::removed((*existing).clone()));
        }
    }

    Ok(changes.into_values().collect())
}
