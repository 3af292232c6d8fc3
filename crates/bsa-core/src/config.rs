//! Configuration types for the refresh pipeline
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Where job checkpoints, change logs, leases and the unblockable set live
    #[serde(default)]
    pub storage: StorageConfig,

    /// How reports reach the BSA
    pub reporter: ReporterConfig,

    /// Cluster-wide lock settings
    #[serde(default)]
    pub lock: LockConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl RefreshConfig {
    /// Create a configuration with defaults for everything but the reporter
    pub fn new(reporter: ReporterConfig) -> Self {
        Self {
            storage: StorageConfig::default(),
            reporter,
            lock: LockConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.storage.validate()?;
        self.reporter.validate()?;
        self.lock.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-memory stores (not persistent, single process)
    #[default]
    Memory,

    /// File-backed stores under one directory
    File {
        /// Root directory; must be shared by all workers
        dir: String,
    },
}

impl StorageConfig {
    /// Validate the storage configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            StorageConfig::File { dir } if dir.is_empty() => {
                Err(crate::Error::config("File storage directory cannot be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Report sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReporterConfig {
    /// BSA HTTP reporting API
    Http {
        /// API base URL
        base_url: String,
        /// API key
        api_key: String,
        /// Path of the additions endpoint, relative to `base_url`
        #[serde(default = "default_additions_path")]
        additions_path: String,
        /// Path of the removals endpoint, relative to `base_url`
        #[serde(default = "default_removals_path")]
        removals_path: String,
        /// Log payloads instead of sending them
        #[serde(default)]
        dry_run: bool,
    },

    /// Custom sender
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl ReporterConfig {
    /// HTTP reporter with the default endpoint paths
    pub fn http(base_url: impl Into<String>, api_key: impl Into<String>, dry_run: bool) -> Self {
        ReporterConfig::Http {
            base_url: base_url.into(),
            api_key: api_key.into(),
            additions_path: default_additions_path(),
            removals_path: default_removals_path(),
            dry_run,
        }
    }

    /// Validate the reporter configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ReporterConfig::Http {
                base_url,
                api_key,
                additions_path,
                removals_path,
                ..
            } => {
                if base_url.is_empty() {
                    return Err(crate::Error::config("Reporter base URL cannot be empty"));
                }
                if !base_url.starts_with("https://") && !base_url.starts_with("http://") {
                    return Err(crate::Error::config(format!(
                        "Reporter base URL must use HTTP or HTTPS scheme. Got: {}",
                        base_url
                    )));
                }
                if api_key.is_empty() {
                    return Err(crate::Error::config("Reporter API key cannot be empty"));
                }
                for path in [additions_path, removals_path] {
                    if !path.starts_with('/') {
                        return Err(crate::Error::config(format!(
                            "Reporter endpoint path must start with '/'. Got: {}",
                            path
                        )));
                    }
                }
                Ok(())
            }
            ReporterConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom reporter factory cannot be empty",
                    ));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom reporter config cannot be null"));
                }
                Ok(())
            }
        }
    }

    /// Get the reporter type name
    pub fn type_name(&self) -> &str {
        match self {
            ReporterConfig::Http { .. } => "http",
            ReporterConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease name shared by all workers
    #[serde(default = "default_lock_name")]
    pub name: String,

    /// Lease duration (in seconds); an unreleased lease expires after this
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
}

impl LockConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Validate the lock configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::config("Lock name cannot be empty"));
        }
        if self.lease_duration_secs == 0 {
            return Err(crate::Error::config("Lock lease duration must be > 0"));
        }
        Ok(())
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: default_lock_name(),
            lease_duration_secs: default_lease_duration_secs(),
        }
    }
}

/// How a reason flip (REGISTERED <-> RESERVED) is reported to the BSA
///
/// The local store is updated under either policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonChangePolicy {
    /// Report a removal under the old reason and an addition under the new one
    #[default]
    ReportAsRemoveAndAdd,
    /// Update the local store only
    AbsorbLocally,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of upserts/deletes applied per store transaction in APPLY_DIFF
    #[serde(default = "default_transaction_batch_size")]
    pub transaction_batch_size: usize,

    /// Buffer subtracted from "now" when querying active domains (in milliseconds)
    ///
    /// Keeps the read from racing a registration that is committing but not
    /// yet visible.
    #[serde(default = "default_commit_time_lag_ms")]
    pub commit_time_lag_ms: u64,

    /// Reporting policy for reason-only changes
    #[serde(default)]
    pub reason_change_policy: ReasonChangePolicy,

    /// Capacity of the internal event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    pub fn commit_time_lag(&self) -> Duration {
        Duration::from_millis(self.commit_time_lag_ms)
    }

    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.transaction_batch_size == 0 {
            return Err(crate::Error::config("Transaction batch size must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transaction_batch_size: default_transaction_batch_size(),
            commit_time_lag_ms: default_commit_time_lag_ms(),
            reason_change_policy: ReasonChangePolicy::default(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_additions_path() -> String {
    "/unblockable-domains/add".to_string()
}

fn default_removals_path() -> String {
    "/unblockable-domains/remove".to_string()
}

fn default_lock_name() -> String {
    "bsa-refresh".to_string()
}

fn default_lease_duration_secs() -> u64 {
    30
}

fn default_transaction_batch_size() -> usize {
    500
}

fn default_commit_time_lag_ms() -> u64 {
    200
}

fn default_event_channel_capacity() -> usize {
    1000
}
