//! Architectural Contract Test: Stage Idempotency
//!
//! This test verifies that re-running any stage has the same effect as
//! running it once.
//!
//! Constraints verified:
//! - A diff re-applied after a lost checkpoint leaves the same persisted set
//! - A refresh with no registry change writes an empty diff and reports nothing
//! - Transaction batches respect the configured batch size
//!
//! If this test fails, resumed jobs can corrupt the unblockable set.

mod common;

use async_trait::async_trait;
use bsa_core::error::{Error, Result};
use bsa_core::model::{Reason, RefreshJob, Stage, UnblockableDomain};
use bsa_core::traits::{ChangeLogStore, RefreshJobStore};
use bsa_core::{EngineEvent, RunOutcome};
use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Job store that loses the checkpoint write to `fail_on` a number of times
struct FlakyJobStore {
    inner: Arc<dyn RefreshJobStore>,
    fail_on: Stage,
    failures_left: AtomicUsize,
}

#[async_trait]
impl RefreshJobStore for FlakyJobStore {
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<RefreshJob>> {
        self.inner.recent_jobs(limit).await
    }

    async fn insert(&self, job: &RefreshJob) -> Result<()> {
        self.inner.insert(job).await
    }

    async fn update_stage(&self, job_id: &str, stage: Stage) -> Result<()> {
        if stage == self.fail_on
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::job_store("checkpoint write lost"));
        }
        self.inner.update_stage(job_id, stage).await
    }
}

#[tokio::test]
async fn reapplying_diff_after_lost_checkpoint_is_idempotent() {
    let h = Harness::new().await;
    h.reserve("blocked1").await;
    h.reserve("blocked2").await;
    h.register("blocked1.app").await;
    h.register("blocked3.dev").await;

    let mut stores = h.stores();
    stores.jobs = Arc::new(FlakyJobStore {
        inner: h.jobs.clone(),
        fail_on: Stage::ReportRemovals,
        failures_left: AtomicUsize::new(1),
    });

    h.advance();
    let (engine, _events) = h.engine_with_stores(stores.clone());
    let outcome = engine.run().await;
    let job_id = match &outcome {
        RunOutcome::Failed {
            job_id: Some(job_id),
            stage: Some(Stage::ApplyDiff),
            ..
        } => job_id.clone(),
        other => panic!("expected the checkpoint after APPLY_DIFF to fail, got {:?}", other),
    };
    let after_first_apply = h.persisted().await;

    h.advance();
    let (engine, _events) = h.engine_with_stores(stores);
    assert_eq!(engine.run().await, RunOutcome::Completed { job_id });

    let expected = vec![
        UnblockableDomain::new("blocked1.app", Reason::Registered),
        UnblockableDomain::new("blocked2.app", Reason::Reserved),
        UnblockableDomain::new("blocked3.dev", Reason::Registered),
    ];
    assert_eq!(after_first_apply, expected);
    assert_eq!(h.persisted().await, expected);
}

#[tokio::test]
async fn unchanged_registry_produces_empty_diff() {
    let h = Harness::new().await;
    h.reserve("blocked1").await;
    h.register("blocked2.dev").await;
    assert!(matches!(h.refresh().await, RunOutcome::Completed { .. }));
    let before = h.persisted().await;
    h.sender.clear();

    let RunOutcome::Completed { job_id } = h.refresh().await else {
        panic!("second refresh should complete");
    };

    assert!(h.change_log.read(&job_id).await.unwrap().is_empty());
    assert_eq!(h.persisted().await, before);
    assert!(h.sender.calls().is_empty());
}

#[tokio::test]
async fn diff_applied_in_batches_of_configured_size() {
    let h = Harness::new().await;
    for i in 0..12 {
        h.reserve(&format!("label{:02}", i)).await;
    }
    h.advance();

    let (engine, mut events) = h.engine();
    assert!(matches!(engine.run().await, RunOutcome::Completed { .. }));

    let batches: Vec<(usize, usize)> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::BatchApplied { upserts, deletes, .. } => Some((upserts, deletes)),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![(5, 0), (5, 0), (2, 0)]);
    assert_eq!(h.unblockable.len().await, 12);
}

#[tokio::test]
async fn removals_and_upserts_share_transactions() {
    let h = Harness::new().await;
    for label in ["a", "b", "c"] {
        h.reserve(label).await;
    }
    assert!(matches!(h.refresh().await, RunOutcome::Completed { .. }));

    h.unreserve("a").await;
    h.unreserve("b").await;
    h.reserve("d").await;
    h.advance();

    let (engine, mut events) = h.engine();
    assert!(matches!(engine.run().await, RunOutcome::Completed { .. }));

    let applied: Vec<EngineEvent> = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, EngineEvent::BatchApplied { .. }))
        .collect();
    assert_eq!(applied.len(), 1);
    assert!(matches!(
        applied[0],
        EngineEvent::BatchApplied {
            upserts: 1,
            deletes: 2,
            ..
        }
    ));
    assert_eq!(
        h.persisted().await,
        vec![
            UnblockableDomain::new("c.app", Reason::Reserved),
            UnblockableDomain::new("d.app", Reason::Reserved),
        ]
    );
}
