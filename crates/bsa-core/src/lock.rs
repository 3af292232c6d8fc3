//! Cluster-wide mutual exclusion for refresh invocations
//!
//! A [`RefreshLock`] wraps a named lease in a shared [`LeaseStore`]. Each
//! lock instance gets a unique holder id, so two workers (or two engines in
//! one process) contend for the same lease.
//!
//! There is no waiting or queuing: if the lease is held and unexpired the
//! body is skipped and the next trigger tries again. There is no heartbeat
//! either; a body that outlives the lease may overlap with a later
//! invocation, which the pipeline tolerates because every stage is
//! idempotent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::traits::LeaseStore;

/// A named, time-bounded lease used to serialize refresh invocations
pub struct RefreshLock {
    store: Arc<dyn LeaseStore>,
    name: String,
    lease_duration: Duration,
    holder_id: String,
    clock: Arc<dyn Clock>,
}

impl RefreshLock {
    /// Create a lock on `name` with a fresh holder id
    pub fn new(
        store: Arc<dyn LeaseStore>,
        name: impl Into<String>,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            lease_duration,
            holder_id: Ulid::new().to_string(),
            clock,
        }
    }

    /// Create a lock from configuration
    pub fn from_config(store: Arc<dyn LeaseStore>, config: &LockConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(store, config.name.clone(), config.lease_duration(), clock)
    }

    /// Holder id of this lock instance
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Lease name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `body` while holding the lease
    ///
    /// # Returns
    ///
    /// - `Ok(None)`: The lease is held elsewhere; `body` did not run
    /// - `Ok(Some(value))`: `body` ran and succeeded
    /// - `Err(Error)`: Acquisition failed, or `body` ran and failed
    ///
    /// The lease is released after `body` completes, whether it succeeded or
    /// not. A failed release is logged; the lease then expires on its own.
    pub async fn execute_with_lock<F, Fut, T>(&self, body: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.lease_duration)
            .map_err(|e| Error::lock(format!("Invalid lease duration: {}", e)))?;

        let acquired = self
            .store
            .try_acquire(&self.name, &self.holder_id, now, now + ttl)
            .await?;

        if !acquired {
            debug!("Lease {} is held by another worker", self.name);
            return Ok(None);
        }

        debug!("Acquired lease {} as {}", self.name, self.holder_id);
        let result = body().await;

        if let Err(e) = self.store.release(&self.name, &self.holder_id).await {
            warn!(
                "Failed to release lease {}: {}. It will expire in {:?}.",
                self.name, e, self.lease_duration
            );
        }

        result.map(Some)
    }
}
