//! Contract Test: Refresh Scenarios
//!
//! This test verifies end-to-end refresh behavior against registry changes.
//!
//! Constraints verified:
//! - Reserved and registered names become unblockable
//! - Registration takes precedence over reservation
//! - Deregistration and unreservation are reported as removals
//! - Report documents have the reason-keyed wire shape
//!
//! If this test fails, the unblockable set reported to the BSA is wrong.

mod common;

use bsa_core::model::{ChangeKind, Reason, UnblockableDomain, UnblockableDomainChange};
use bsa_core::traits::{ChangeLogStore, RefreshJobStore};
use bsa_core::{ReportKind, RunOutcome};
use common::*;

fn completed_job(outcome: RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed { job_id } => job_id,
        other => panic!("expected a completed refresh, got {:?}", other),
    }
}

#[tokio::test]
async fn new_reserved_domain_added_as_unblockable() {
    let h = Harness::new().await;
    h.reserve("blocked1").await;

    let job_id = completed_job(h.refresh().await);

    let expected = UnblockableDomain::new("blocked1.app", Reason::Reserved);
    assert_eq!(h.persisted().await, vec![expected.clone()]);
    assert_eq!(
        h.change_log.read(&job_id).await.unwrap(),
        vec![UnblockableDomainChange::new_unblockable(expected)]
    );

    assert!(
        h.sender.batches(ReportKind::Removals).is_empty(),
        "no removal call for an empty removal batch"
    );
    assert_eq!(
        h.sender.documents(ReportKind::Additions),
        vec!["{\n  \"reserved\": [\n    \"blocked1.app\"\n  ]\n}".to_string()]
    );
}

#[tokio::test]
async fn mixed_case_registration_is_normalized() {
    let h = Harness::new().await;
    h.register("Blocked1.DEV").await;

    completed_job(h.refresh().await);

    assert_eq!(
        h.persisted().await,
        vec![UnblockableDomain::new("blocked1.dev", Reason::Registered)]
    );
    assert_eq!(
        h.sender.batches(ReportKind::Additions)[0].names(Reason::Registered),
        ["blocked1.dev"]
    );
}

#[tokio::test]
async fn new_registered_domain_added_as_unblockable() {
    let h = Harness::new().await;
    h.register("blocked1.dev").await;

    completed_job(h.refresh().await);

    assert_eq!(
        h.persisted().await,
        vec![UnblockableDomain::new("blocked1.dev", Reason::Registered)]
    );
    let additions = h.sender.batches(ReportKind::Additions);
    assert_eq!(additions.len(), 1);
    assert_eq!(additions[0].names(Reason::Registered), ["blocked1.dev"]);
}

#[tokio::test]
async fn registered_and_reserved_domain_added_as_registered() {
    let h = Harness::new().await;
    h.reserve("blocked1").await;
    h.register("blocked1.app").await;

    completed_job(h.refresh().await);

    assert_eq!(
        h.persisted().await,
        vec![UnblockableDomain::new("blocked1.app", Reason::Registered)]
    );
}

#[tokio::test]
async fn registered_unblockable_unregistered() {
    let h = Harness::new().await;
    h.register("blocked1.dev").await;
    completed_job(h.refresh().await);

    h.advance();
    h.delete("blocked1.dev").await;
    let job_id = completed_job(h.refresh().await);

    assert!(h.persisted().await.is_empty());
    let changes = h.change_log.read(&job_id).await.unwrap();
    assert_eq!(
        changes,
        vec![UnblockableDomainChange::removed(UnblockableDomain::new(
            "blocked1.dev",
            Reason::Registered
        ))]
    );

    let removals = h.sender.batches(ReportKind::Removals);
    assert_eq!(removals.len(), 1);
    assert_eq!(removals[0].names(Reason::Registered), ["blocked1.dev"]);
}

#[tokio::test]
async fn reserved_unblockable_no_longer_reserved() {
    let h = Harness::new().await;
    h.reserve("blocked1").await;
    completed_job(h.refresh().await);

    h.advance();
    h.unreserve("blocked1").await;
    completed_job(h.refresh().await);

    assert!(h.persisted().await.is_empty());
    let removals = h.sender.documents(ReportKind::Removals);
    assert_eq!(
        removals,
        vec!["{\n  \"reserved\": [\n    \"blocked1.app\"\n  ]\n}".to_string()]
    );
}

#[tokio::test]
async fn registered_and_reserved_no_longer_registered_falls_back_to_reserved() {
    let h = Harness::new().await;
    h.reserve("blocked1").await;
    h.register("blocked1.app").await;
    completed_job(h.refresh().await);

    h.advance();
    h.delete("blocked1.app").await;
    let job_id = completed_job(h.refresh().await);

    assert_eq!(
        h.persisted().await,
        vec![UnblockableDomain::new("blocked1.app", Reason::Reserved)]
    );

    let changes = h.change_log.read(&job_id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::ReasonChanged);
    assert_eq!(changes[0].previous_reason, Some(Reason::Registered));
}

#[tokio::test]
async fn registered_and_reserved_no_longer_reserved_no_change() {
    let h = Harness::new().await;
    h.reserve("blocked1").await;
    h.register("blocked1.app").await;
    completed_job(h.refresh().await);
    h.sender.clear();

    h.advance();
    h.unreserve("blocked1").await;
    let job_id = completed_job(h.refresh().await);

    assert_eq!(
        h.persisted().await,
        vec![UnblockableDomain::new("blocked1.app", Reason::Registered)]
    );
    assert!(h.change_log.read(&job_id).await.unwrap().is_empty());
    assert!(h.sender.calls().is_empty(), "nothing externally visible changed");
}

#[tokio::test]
async fn registered_unblockable_becomes_reserved_no_change() {
    let h = Harness::new().await;
    h.register("blocked1.app").await;
    completed_job(h.refresh().await);
    h.sender.clear();

    h.advance();
    h.reserve("blocked1").await;
    completed_job(h.refresh().await);

    assert_eq!(
        h.persisted().await,
        vec![UnblockableDomain::new("blocked1.app", Reason::Registered)]
    );
    assert!(h.sender.calls().is_empty());
}

#[tokio::test]
async fn reserved_unblockable_becomes_registered_reported_as_remove_then_add() {
    let h = Harness::new().await;
    h.reserve("blocked1").await;
    completed_job(h.refresh().await);
    h.sender.clear();

    h.advance();
    h.register("blocked1.app").await;
    completed_job(h.refresh().await);

    assert_eq!(
        h.persisted().await,
        vec![UnblockableDomain::new("blocked1.app", Reason::Registered)]
    );

    let calls = h.sender.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, ReportKind::Removals, "removals are sent before additions");
    assert_eq!(calls[0].1.names(Reason::Reserved), ["blocked1.app"]);
    assert_eq!(calls[1].0, ReportKind::Additions);
    assert_eq!(calls[1].1.names(Reason::Registered), ["blocked1.app"]);
}

#[tokio::test]
async fn reason_change_absorbed_locally_when_configured() {
    let mut h = Harness::new().await;
    h.config.engine.reason_change_policy = bsa_core::ReasonChangePolicy::AbsorbLocally;
    h.reserve("blocked1").await;
    completed_job(h.refresh().await);
    h.sender.clear();

    h.advance();
    h.register("blocked1.app").await;
    completed_job(h.refresh().await);

    assert_eq!(
        h.persisted().await,
        vec![UnblockableDomain::new("blocked1.app", Reason::Registered)]
    );
    assert!(h.sender.calls().is_empty());
}

#[tokio::test]
async fn persisted_set_matches_registry_after_full_run() {
    let h = Harness::new().await;
    for label in ["a1", "a2", "a3", "a4", "a5", "a6"] {
        h.reserve(label).await;
    }
    for name in ["b1.dev", "b2.dev", "b3.dev", "a2.app"] {
        h.register(name).await;
    }

    completed_job(h.refresh().await);

    let persisted = h.persisted().await;
    let expected = vec![
        UnblockableDomain::new("a1.app", Reason::Reserved),
        UnblockableDomain::new("a2.app", Reason::Registered),
        UnblockableDomain::new("a3.app", Reason::Reserved),
        UnblockableDomain::new("a4.app", Reason::Reserved),
        UnblockableDomain::new("a5.app", Reason::Reserved),
        UnblockableDomain::new("a6.app", Reason::Reserved),
        UnblockableDomain::new("b1.dev", Reason::Registered),
        UnblockableDomain::new("b2.dev", Reason::Registered),
        UnblockableDomain::new("b3.dev", Reason::Registered),
    ];
    assert_eq!(persisted, expected);

    // One addition report regardless of the store batch size
    let additions = h.sender.batches(ReportKind::Additions);
    assert_eq!(additions.len(), 1);
    assert_eq!(additions[0].len(), 9);
}

#[tokio::test]
async fn no_completed_download_means_nothing_to_do() {
    let mut h = Harness::new().await;
    h.registry = std::sync::Arc::new(bsa_core::MemoryRegistry::new());
    h.registry.enroll_tld("app", h.now()).await;
    h.reserve("blocked1").await;

    let (engine, mut events) = h.engine();
    h.advance();
    assert_eq!(engine.run().await, RunOutcome::NothingToDo);

    assert_eq!(drain(&mut events), vec![bsa_core::EngineEvent::NothingToDo]);
    assert!(h.jobs.recent_jobs(10).await.unwrap().is_empty());
    assert!(h.persisted().await.is_empty());
    assert!(h.sender.calls().is_empty());
}
