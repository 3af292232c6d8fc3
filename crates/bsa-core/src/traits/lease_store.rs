// # Lease Store Trait
//
// Shared storage for named, time-bounded leases.
//
// ## Purpose
//
// The refresh job may be triggered on several workers at once. A lease record
// with an expiry, kept in storage every worker can see, ensures only one of
// them runs the pipeline. A holder that crashes simply lets its lease expire.
//
// ## Implementations
//
// - In-memory: single process only (tests, embedded use)
// - File-based: lease file on a shared filesystem

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Trait for lease store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
///
/// # Atomicity
///
/// `try_acquire` must be atomic with respect to other callers: two holders
/// racing for the same free lease must not both observe `true`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Try to take the lease `name` for `holder` until `expires_at`
    ///
    /// Succeeds when no lease exists, the existing lease expired at or before
    /// `now`, or `holder` already holds it (which renews it).
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: The lease is now held by `holder`
    /// - `Ok(false)`: Another holder has an unexpired lease
    /// - `Err(Error)`: Storage error
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, crate::Error>;

    /// Release the lease `name` if it is still held by `holder`
    ///
    /// Releasing a lease held by someone else (after expiry and takeover) or
    /// a lease that no longer exists is a no-op.
    async fn release(&self, name: &str, holder: &str) -> Result<(), crate::Error>;
}
