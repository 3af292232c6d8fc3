//! Test doubles and common utilities for refresh contract tests
//!
//! This module provides a recording report sender and a harness that wires
//! in-memory stores, an in-memory registry and a fake clock into a
//! `RefreshEngine`.

#![allow(dead_code)]

use async_trait::async_trait;
use bsa_core::config::{RefreshConfig, ReporterConfig};
use bsa_core::error::{Error, Result};
use bsa_core::model::{ReservationType, UnblockableDomain};
use bsa_core::state::{
    MemoryChangeLog, MemoryJobStore, MemoryLeaseStore, MemoryRegistry, MemoryUnblockableStore,
    Stores,
};
use bsa_core::traits::{ReportBatch, ReportSender, UnblockableStore};
use bsa_core::{Clock, EngineEvent, FakeClock, RefreshEngine, RegistrySources, ReportKind, RunOutcome};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

pub const TEST_START_TIME: &str = "2024-01-01T00:00:00Z";
pub const RESERVED_LIST_NAME: &str = "reserved";

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// A report sender that records every batch and can be told to fail
#[derive(Clone, Default)]
pub struct RecordingReportSender {
    calls: Arc<Mutex<Vec<(ReportKind, ReportBatch)>>>,
    fail_additions: Arc<AtomicBool>,
    fail_removals: Arc<AtomicBool>,
}

impl RecordingReportSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivered batch, in call order
    pub fn calls(&self) -> Vec<(ReportKind, ReportBatch)> {
        self.calls.lock().unwrap().clone()
    }

    /// Delivered batches of one kind
    pub fn batches(&self, kind: ReportKind) -> Vec<ReportBatch> {
        self.calls()
            .into_iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, b)| b)
            .collect()
    }

    /// Delivered batches of one kind, as wire documents
    pub fn documents(&self, kind: ReportKind) -> Vec<String> {
        self.batches(kind)
            .iter()
            .map(|b| b.to_json_pretty().unwrap())
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn set_fail_additions(&self, fail: bool) {
        self.fail_additions.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReportSender for RecordingReportSender {
    async fn send_additions(&self, batch: &ReportBatch) -> Result<()> {
        if self.fail_additions.load(Ordering::SeqCst) {
            return Err(Error::http("additions endpoint unavailable (503)"));
        }
        self.calls
            .lock()
            .unwrap()
            .push((ReportKind::Additions, batch.clone()));
        Ok(())
    }

    async fn send_removals(&self, batch: &ReportBatch) -> Result<()> {
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(Error::http("removals endpoint unavailable (503)"));
        }
        self.calls
            .lock()
            .unwrap()
            .push((ReportKind::Removals, batch.clone()));
        Ok(())
    }

    fn sender_name(&self) -> &'static str {
        "recording"
    }
}

/// Sender that parks inside send_additions until released
#[derive(Clone, Default)]
pub struct GatedReportSender {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl ReportSender for GatedReportSender {
    async fn send_additions(&self, _batch: &ReportBatch) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn send_removals(&self, _batch: &ReportBatch) -> Result<()> {
        Ok(())
    }

    fn sender_name(&self) -> &'static str {
        "gated"
    }
}

/// Minimal RefreshConfig for tests: batch size 5, 1 ms commit lag
pub fn test_config() -> RefreshConfig {
    let mut config = RefreshConfig::new(ReporterConfig::Custom {
        factory: "recording".to_string(),
        config: serde_json::json!({}),
    });
    config.engine.transaction_batch_size = 5;
    config.engine.commit_time_lag_ms = 1;
    config
}

/// In-memory world around a RefreshEngine
///
/// TLDs `app` and `dev` are enrolled, a blocklist download has completed and
/// the clock sits just after both.
pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub jobs: Arc<MemoryJobStore>,
    pub change_log: Arc<MemoryChangeLog>,
    pub unblockable: Arc<MemoryUnblockableStore>,
    pub leases: Arc<MemoryLeaseStore>,
    pub clock: Arc<FakeClock>,
    pub sender: RecordingReportSender,
    pub config: RefreshConfig,
}

impl Harness {
    pub async fn new() -> Self {
        let clock = Arc::new(FakeClock::new(ts(TEST_START_TIME)));
        let registry = Arc::new(MemoryRegistry::new());

        registry.enroll_tld("app", clock.now()).await;
        registry.enroll_tld("dev", clock.now()).await;
        registry.mark_download_completed(clock.now()).await;
        clock.advance_one_milli();

        Self {
            registry,
            jobs: Arc::new(MemoryJobStore::new()),
            change_log: Arc::new(MemoryChangeLog::new()),
            unblockable: Arc::new(MemoryUnblockableStore::new()),
            leases: Arc::new(MemoryLeaseStore::new()),
            clock,
            sender: RecordingReportSender::new(),
            config: test_config(),
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            jobs: self.jobs.clone(),
            change_log: self.change_log.clone(),
            unblockable: self.unblockable.clone(),
            leases: self.leases.clone(),
        }
    }

    /// A fresh engine over the shared state (like a new worker process)
    pub fn engine(&self) -> (RefreshEngine, mpsc::Receiver<EngineEvent>) {
        self.engine_with_stores(self.stores())
    }

    /// A fresh engine over the harness registry and sender but other stores
    pub fn engine_with_stores(&self, stores: Stores) -> (RefreshEngine, mpsc::Receiver<EngineEvent>) {
        RefreshEngine::new(
            stores,
            RegistrySources::from_shared(self.registry.clone()),
            Box::new(self.sender.clone()),
            self.clock.clone(),
            &self.config,
        )
        .expect("engine construction succeeds")
    }

    /// Advance the clock past the commit lag, then run one invocation on a
    /// fresh engine
    pub async fn refresh(&self) -> RunOutcome {
        self.advance();
        let (engine, _events) = self.engine();
        engine.run().await
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self) {
        self.clock.advance_one_milli();
    }

    /// Reserve `label` on `app` with an exempt reservation type
    pub async fn reserve(&self, label: &str) {
        self.registry
            .reserve_label("app", RESERVED_LIST_NAME, label, ReservationType::ReservedForSpecificUse)
            .await;
    }

    pub async fn unreserve(&self, label: &str) {
        self.registry
            .unreserve_label(RESERVED_LIST_NAME, label)
            .await
            .expect("label was reserved");
    }

    /// Register `name` now; visible to refreshes after the commit lag
    pub async fn register(&self, name: &str) {
        self.registry.register_domain(name, self.now()).await;
    }

    pub async fn delete(&self, name: &str) {
        self.registry
            .delete_domain(name, self.now())
            .await
            .expect("domain was registered");
    }

    /// The persisted unblockable set, sorted by name
    pub async fn persisted(&self) -> Vec<UnblockableDomain> {
        self.unblockable.get_all().await.unwrap()
    }
}

/// Drain every event currently buffered
pub fn drain(rx: &mut mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
