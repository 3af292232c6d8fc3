//! Core traits for the refresh pipeline
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`LeaseStore`]: Shared lease records backing the cluster-wide lock
//! - [`ChangeLogStore`]: Append-only, job-keyed log of computed diffs
//! - [`UnblockableStore`]: Persisted set of unblockable domains
//! - [`RefreshJobStore`]: Durable refresh job checkpoints
//! - [`ReportSender`]: Delivers additions/removals to the BSA
//! - [`RegistryView`] / [`DownloadStatus`]: Read-only registry collaborators

pub mod lease_store;
pub mod change_log;
pub mod unblockable_store;
pub mod job_store;
pub mod report_sender;
pub mod registry_view;

pub use lease_store::LeaseStore;
pub use change_log::{ChangeLogStore, WriteOutcome};
pub use unblockable_store::UnblockableStore;
pub use job_store::RefreshJobStore;
pub use report_sender::{ReportBatch, ReportSender, ReportSenderFactory};
pub use registry_view::{DownloadStatus, RegistryView};
