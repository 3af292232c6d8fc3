// # Registry View Traits
//
// Read-only queries against registry state owned by other subsystems.
//
// - `RegistryView`: TLD enrollment, active domains, reserved lists
// - `DownloadStatus`: whether a full blocklist download has completed
//
// The refresh pipeline never writes through these interfaces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::ReservationType;

/// Registry state needed to compute the unblockable set
#[async_trait]
pub trait RegistryView: Send + Sync {
    /// Real (non-test) TLDs whose BSA enrollment started at or before `as_of`
    async fn bsa_enrolled_tlds(&self, as_of: DateTime<Utc>) -> Result<Vec<String>, crate::Error>;

    /// Fully-qualified names of domains on `tld` that exist and are not
    /// deleted as of `as_of`
    async fn active_domains(
        &self,
        tld: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<String>, crate::Error>;

    /// Labels (without the TLD) on the publishable reserved lists attached to
    /// `tld`, with their reservation types
    ///
    /// A label on several lists may appear more than once.
    async fn publishable_reserved_labels(
        &self,
        tld: &str,
    ) -> Result<Vec<(String, ReservationType)>, crate::Error>;
}

/// Progress of the blocklist download pipeline
#[async_trait]
pub trait DownloadStatus: Send + Sync {
    /// Start time of the most recent successfully completed download, if any
    async fn latest_completed_download(&self) -> Result<Option<DateTime<Utc>>, crate::Error>;
}
