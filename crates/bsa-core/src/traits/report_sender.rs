// # Report Sender Trait
//
// Defines the interface for reporting unblockable-domain changes to the BSA.
//
// ## Implementations
//
// - HTTP: `bsa-report-http` crate
//
// ## Usage
//
// ```rust,ignore
// use bsa_core::traits::{ReportBatch, ReportSender};
// use bsa_core::model::Reason;
//
// let mut batch = ReportBatch::new();
// batch.push(Reason::Reserved, "blocked1.app");
// sender.send_additions(&batch).await?;
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::Reason;

/// One report document: lower-cased reason -> ordered domain names
///
/// Serializes as a plain JSON object, e.g. `{"reserved": ["blocked1.app"]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportBatch {
    entries: BTreeMap<String, Vec<String>>,
}

impl ReportBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a domain name under `reason`
    pub fn push(&mut self, reason: Reason, domain_name: impl Into<String>) {
        self.entries
            .entry(reason.report_key().to_string())
            .or_default()
            .push(domain_name.into());
    }

    /// Names recorded under `reason`, in insertion order
    pub fn names(&self, reason: Reason) -> &[String] {
        self.entries
            .get(reason.report_key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Total number of names across all reasons
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The document as sent on the wire (two-space indented JSON)
    pub fn to_json_pretty(&self) -> Result<String, crate::Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Trait for report sender implementations
///
/// # Trust Level: Untrusted
///
/// Report senders are **untrusted** components with strict limitations:
///
/// ## Allowed Capabilities
/// - ✅ Perform HTTP/HTTPS API calls to the BSA endpoints only
/// - ✅ Serialize the batch document
/// - ✅ Return success or failure (the stage machine handles retry)
///
/// ## Forbidden Capabilities
/// - ❌ Implement retry logic or backoff (retry happens on the next trigger,
///   from the durable checkpoint)
/// - ❌ Access the change log or unblockable store
/// - ❌ Split, filter or reorder the batch
/// - ❌ Spawn tasks or threads
///
/// ## Delivery Semantics
///
/// A failed stage is re-run on the next invocation with the identical batch
/// (read back from the change log), so delivery is at-least-once. The BSA is
/// expected to tolerate duplicate additions and removals.
///
/// ❌ **WRONG**: Sender with its own retry loop
/// ```rust,ignore
/// async fn send_additions(&self, batch: &ReportBatch) -> Result<()> {
///     for _ in 0..3 {
///         if self.post(batch).await.is_ok() { return Ok(()); }
///         tokio::time::sleep(Duration::from_secs(1)).await; // WRONG!
///     }
///     ...
/// }
/// ```
#[async_trait]
pub trait ReportSender: Send + Sync {
    /// Report names that became unblockable
    async fn send_additions(&self, batch: &ReportBatch) -> Result<(), crate::Error>;

    /// Report names that are no longer unblockable
    async fn send_removals(&self, batch: &ReportBatch) -> Result<(), crate::Error>;

    /// Sender name (for logging/debugging)
    fn sender_name(&self) -> &'static str;
}

/// Helper trait for constructing report senders from configuration
pub trait ReportSenderFactory: Send + Sync {
    /// Create a ReportSender instance from configuration
    fn create(
        &self,
        config: &crate::config::ReporterConfig,
    ) -> Result<Box<dyn ReportSender>, crate::Error>;
}
