//! Error types for the BSA refresh pipeline
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for refresh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the refresh pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Lease/lock store errors
    #[error("Lock error: {0}")]
    Lock(String),

    /// Change log store errors
    #[error("Change log error: {0}")]
    ChangeLog(String),

    /// Unblockable domain store errors
    #[error("Unblockable store error: {0}")]
    Store(String),

    /// Refresh job store errors
    #[error("Job store error: {0}")]
    JobStore(String),

    /// Registry state query errors (domains, reserved lists, TLDs)
    #[error("Registry query error: {0}")]
    Registry(String),

    /// Report delivery errors
    #[error("Report error: {0}")]
    Report(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors from file-backed stores
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors (from the reporting API)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limiting errors
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Sender-specific error
    #[error("Sender error ({sender}): {message}")]
    Sender {
        /// Sender name
        sender: String,
        /// Error message
        message: String,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a lock error
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// Create a change log error
    pub fn change_log(msg: impl Into<String>) -> Self {
        Self::ChangeLog(msg.into())
    }

    /// Create an unblockable store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a job store error
    pub fn job_store(msg: impl Into<String>) -> Self {
        Self::JobStore(msg.into())
    }

    /// Create a registry query error
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a report error
    pub fn report(msg: impl Into<String>) -> Self {
        Self::Report(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a sender-specific error
    pub fn sender(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sender {
            sender: sender.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Used only for log severity; the pipeline retries every failure on the
    /// next trigger regardless.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::Config(_) | Self::InvalidInput(_) | Self::Authentication(_)
        )
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
