// # Unblockable Store Trait
//
// Persisted set of unblockable domains (domain name -> reason).
//
// ## Purpose
//
// Holds the result of the last applied refresh. The reconciler diffs the
// freshly computed target set against this store, and APPLY_DIFF brings the
// store in line with the recorded diff.

use async_trait::async_trait;

use crate::model::UnblockableDomain;

/// Trait for unblockable store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
///
/// # Trust Level: Trusted (Core Component)
///
/// Stores perform I/O only. They never decide what belongs in the set; that
/// is owned by the `Reconciler`.
#[async_trait]
pub trait UnblockableStore: Send + Sync {
    /// Apply one batch of upserts and deletes as a single transaction
    ///
    /// Either every write in the batch is visible afterwards or none is.
    /// Upserting an identical row or deleting a missing name is a no-op, so
    /// re-applying a batch leaves the store unchanged.
    async fn apply_batch(
        &self,
        upserts: &[UnblockableDomain],
        deletes: &[String],
    ) -> Result<(), crate::Error>;

    /// All unblockable domains, in no particular order
    async fn get_all(&self) -> Result<Vec<UnblockableDomain>, crate::Error>;

    /// Look up one domain by its normalized name
    async fn get(&self, domain_name: &str) -> Result<Option<UnblockableDomain>, crate::Error>;
}
