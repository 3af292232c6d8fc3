//! Domain model for the refresh pipeline
//!
//! - [`UnblockableDomain`]: a name exempted from the BSA blocklist, with its [`Reason`]
//! - [`UnblockableDomainChange`]: one entry of a computed diff
//! - [`RefreshJob`] / [`Stage`]: the durable checkpoint of one refresh cycle
//! - [`ReservationType`]: reserved-list entry types and their blocklist exemption

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Why a domain must not be blocked
///
/// Variant order is precedence order: `Registered` wins over `Reserved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// The domain is actively registered
    Registered,
    /// The domain is on a publishable reserved list with an exempt type
    Reserved,
}

impl Reason {
    /// Key used for this reason in report documents
    pub fn report_key(&self) -> &'static str {
        match self {
            Reason::Registered => "registered",
            Reason::Reserved => "reserved",
        }
    }

    /// The reason that applies when a name qualifies for both
    pub fn stronger(self, other: Reason) -> Reason {
        self.min(other)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Registered => f.write_str("REGISTERED"),
            Reason::Reserved => f.write_str("RESERVED"),
        }
    }
}

/// A domain name that must be exempted from the blocklist
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnblockableDomain {
    /// Fully-qualified, lower-case, punycoded domain name
    pub domain_name: String,
    /// Why the name is unblockable
    pub reason: Reason,
}

impl UnblockableDomain {
    /// Create an unblockable domain from an already-normalized name
    pub fn new(domain_name: impl Into<String>, reason: Reason) -> Self {
        Self {
            domain_name: domain_name.into(),
            reason,
        }
    }

    /// Create an unblockable domain from a label and its TLD
    pub fn from_label(label: &str, tld: &str, reason: Reason) -> Result<Self> {
        Ok(Self::new(join_label(label, tld)?, reason))
    }
}

/// Kind of a diff entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Newly unblockable
    New,
    /// No longer unblockable
    Removed,
    /// Still unblockable, for a different reason
    ReasonChanged,
}

/// One entry of a refresh diff, as written to the change log
///
/// For `New` and `ReasonChanged` the embedded domain carries the target
/// reason; for `Removed` it carries the reason that was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnblockableDomainChange {
    /// Kind of change
    pub kind: ChangeKind,
    /// The affected domain
    #[serde(flatten)]
    pub domain: UnblockableDomain,
    /// Persisted reason before a `ReasonChanged` entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_reason: Option<Reason>,
}

impl UnblockableDomainChange {
    /// A domain that became unblockable
    pub fn new_unblockable(domain: UnblockableDomain) -> Self {
        Self {
            kind: ChangeKind::New,
            domain,
            previous_reason: None,
        }
    }

    /// A domain that is no longer unblockable
    pub fn removed(domain: UnblockableDomain) -> Self {
        Self {
            kind: ChangeKind::Removed,
            domain,
            previous_reason: None,
        }
    }

    /// A domain whose reason flipped while staying unblockable
    pub fn reason_changed(domain: UnblockableDomain, previous_reason: Reason) -> Result<Self> {
        if domain.reason == previous_reason {
            return Err(Error::invalid_input(format!(
                "No change in reason for {}",
                domain.domain_name
            )));
        }
        Ok(Self {
            kind: ChangeKind::ReasonChanged,
            domain,
            previous_reason: Some(previous_reason),
        })
    }

    /// Name of the affected domain
    pub fn domain_name(&self) -> &str {
        &self.domain.domain_name
    }

    pub fn is_new(&self) -> bool {
        self.kind == ChangeKind::New
    }

    pub fn is_removal(&self) -> bool {
        self.kind == ChangeKind::Removed
    }

    pub fn is_reason_change(&self) -> bool {
        self.kind == ChangeKind::ReasonChanged
    }
}

/// Stage of a refresh job
///
/// Declaration order is execution order; a job's stage only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    MakeDiff,
    ApplyDiff,
    ReportRemovals,
    ReportAdditions,
    Done,
}

impl Stage {
    /// The stage that follows this one (`Done` is terminal)
    pub fn next(self) -> Stage {
        match self {
            Stage::MakeDiff => Stage::ApplyDiff,
            Stage::ApplyDiff => Stage::ReportRemovals,
            Stage::ReportRemovals => Stage::ReportAdditions,
            Stage::ReportAdditions => Stage::Done,
            Stage::Done => Stage::Done,
        }
    }

    pub fn is_done(self) -> bool {
        self == Stage::Done
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::MakeDiff => "MAKE_DIFF",
            Stage::ApplyDiff => "APPLY_DIFF",
            Stage::ReportRemovals => "REPORT_REMOVALS",
            Stage::ReportAdditions => "REPORT_ADDITIONS",
            Stage::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// One refresh cycle and its durable checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshJob {
    /// Unique job name, derived from the start time
    pub job_id: String,
    /// Current checkpoint
    pub stage: Stage,
    /// When the job was created
    pub start_time: DateTime<Utc>,
}

impl RefreshJob {
    /// Create a job starting at `start_time`, positioned at `MakeDiff`
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            job_id: Self::job_name(start_time),
            stage: Stage::MakeDiff,
            start_time,
        }
    }

    /// Job name for a given start time, e.g. `2024-01-01T00:00:00.001Z-refresh`
    pub fn job_name(start_time: DateTime<Utc>) -> String {
        format!(
            "{}-refresh",
            start_time.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    pub fn is_done(&self) -> bool {
        self.stage.is_done()
    }

    /// Move the checkpoint to `next`
    ///
    /// Fails if `next` is behind the current stage or the job is already done.
    pub fn advance_to(&mut self, next: Stage) -> Result<()> {
        if self.is_done() {
            return Err(Error::invalid_input(format!(
                "Job {} is already {}",
                self.job_id, self.stage
            )));
        }
        if next < self.stage {
            return Err(Error::invalid_input(format!(
                "Job {} cannot move back from {} to {}",
                self.job_id, self.stage, next
            )));
        }
        self.stage = next;
        Ok(())
    }
}

/// Reserved-list entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationType {
    AllowedInSunrise,
    NameCollision,
    ReservedForSpecificUse,
    ReservedForAnchorTenant,
    FullyBlocked,
}

impl ReservationType {
    /// Whether a label reserved with this type can still be allocated (with a
    /// token) and therefore must not be blocked
    pub fn is_blocklist_exempt(self) -> bool {
        matches!(
            self,
            ReservationType::ReservedForSpecificUse | ReservationType::ReservedForAnchorTenant
        )
    }
}

/// Normalize a domain name for comparison and storage
///
/// Trims whitespace, drops a trailing root dot and lower-cases. Names must
/// already be in ASCII (punycode) form; labels follow RFC 1035 limits.
pub fn normalize_domain_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);

    if trimmed.is_empty() {
        return Err(Error::invalid_input("Domain name cannot be empty"));
    }

    if !trimmed.is_ascii() {
        return Err(Error::invalid_input(format!(
            "Domain name must be punycoded: '{}'",
            trimmed
        )));
    }

    // RFC 1035: 253 chars max
    if trimmed.len() > 253 {
        return Err(Error::invalid_input(format!(
            "Domain name too long: {} chars (max 253)",
            trimmed.len()
        )));
    }

    let normalized = trimmed.to_ascii_lowercase();

    for label in normalized.split('.') {
        validate_label(label, &normalized)?;
    }

    Ok(normalized)
}

/// Join a label with its TLD into a normalized domain name
pub fn join_label(label: &str, tld: &str) -> Result<String> {
    normalize_domain_name(&format!("{}.{}", label.trim(), tld.trim()))
}

fn validate_label(label: &str, domain: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::invalid_input(format!(
            "Domain name has empty label: '{}'",
            domain
        )));
    }

    if label.len() > 63 {
        return Err(Error::invalid_input(format!(
            "Domain label too long: {} chars (max 63). Label: '{}'",
            label.len(),
            label
        )));
    }

    if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::invalid_input(format!(
            "Domain label contains invalid characters. Label: '{}'",
            label
        )));
    }

    if label.starts_with('-') || label.ends_with('-') {
        return Err(Error::invalid_input(format!(
            "Domain label cannot start or end with hyphen. Label: '{}'",
            label
        )));
    }

    Ok(())
}
