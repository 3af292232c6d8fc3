//! Plugin-based report sender registry
//!
//! The registry allows report senders to be registered dynamically at
//! runtime, so the daemon picks one by configured type name instead of a
//! hardcoded match.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bsa_core::registry::SenderRegistry;
//! use bsa_core::config::ReporterConfig;
//!
//! let registry = SenderRegistry::new();
//! bsa_report_http::register(&registry);
//!
//! let config = ReporterConfig::http("https://bsa.example.test/api", api_key, false);
//! let sender = registry.create_sender(&config)?;
//! ```

use crate::config::ReporterConfig;
use crate::error::{Error, Result};
use crate::traits::{ReportSender, ReportSenderFactory};
use std::collections::HashMap;
use std::sync::RwLock;

/// Registry of report sender factories keyed by reporter type name
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct SenderRegistry {
    senders: RwLock<HashMap<String, Box<dyn ReportSenderFactory>>>,
}

impl SenderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a report sender factory
    ///
    /// # Parameters
    ///
    /// - `name`: Reporter type name (e.g., "http"); matches
    ///   [`ReporterConfig::type_name`]
    /// - `factory`: Factory object for creating sender instances
    ///
    /// Registering the same name twice replaces the earlier factory.
    pub fn register_sender(&self, name: impl Into<String>, factory: Box<dyn ReportSenderFactory>) {
        let name = name.into();
        let mut senders = self.senders.write().unwrap_or_else(|e| e.into_inner());
        senders.insert(name, factory);
    }

    /// Create a report sender from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn ReportSender>)`: Created sender instance
    /// - `Err(Error)`: If the reporter type is not registered or creation fails
    pub fn create_sender(&self, config: &ReporterConfig) -> Result<Box<dyn ReportSender>> {
        let sender_type = config.type_name();
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());

        let factory = senders
            .get(sender_type)
            .ok_or_else(|| Error::config(format!("Unknown reporter type: {}", sender_type)))?;

        factory.create(config)
    }

    /// List all registered reporter types
    pub fn list_senders(&self) -> Vec<String> {
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = senders.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a reporter type is registered
    pub fn has_sender(&self, name: &str) -> bool {
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        senders.contains_key(name)
    }
}
