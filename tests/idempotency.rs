//! At-most-once guarantees: duplicate payloads, racing ticks, and crash
//! recovery between dispatch and persist.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use common::{harness, harness_with, payload, MockAutomation};
use lucid::adapters::StructuredReportRenderer;
use lucid::domain::{EventOutcome, Stage};
use lucid::{Collaborators, Config, RecordStore, Scheduler};

#[tokio::test]
async fn test_duplicate_payload_collapses_to_one_record() {
    let h = harness();
    h.intake.push(payload("<dup@mail>", "NHS-1"));
    h.intake.push(payload("<dup@mail>", "NHS-1"));

    h.scheduler.run_tick(Utc::now()).await.unwrap();

    let all = h.store.list(None, 100).unwrap();
    assert_eq!(all.len(), 1);
    // One Created event, one test request, one confirmation.
    let events = h.store.events_for(&all[0].id).unwrap();
    assert_eq!(
        events.iter().filter(|e| e.outcome == EventOutcome::Created).count(),
        1
    );
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_replaying_a_duplicate_later_changes_nothing() {
    let h = harness();
    h.intake.push(payload("<dup2@mail>", "NHS-2"));
    h.scheduler.run_tick(Utc::now()).await.unwrap();

    let before = h.store.list(None, 100).unwrap();
    assert_eq!(before[0].stage, Stage::AwaitingReport);

    // The same payload shows up again on a later tick.
    h.intake.push(payload("<dup2@mail>", "NHS-2"));
    h.scheduler.run_tick(Utc::now()).await.unwrap();

    let after = h.store.list(None, 100).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].stage, Stage::AwaitingReport);
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 1);
}

/// Two schedulers over the same store, ticking concurrently: exactly one
/// test request is submitted, the loser of the claim race skips silently.
#[tokio::test]
async fn test_racing_ticks_submit_exactly_once() {
    let store = Arc::new(RecordStore::open_in_memory().unwrap());
    let automation = Arc::new(MockAutomation::default());

    let build = |store: Arc<RecordStore>, automation: Arc<MockAutomation>| {
        let mut config = Config::default();
        config.home = std::env::temp_dir();
        Scheduler::new(
            config,
            store.clone(),
            Collaborators {
                intake: Arc::new(common::MockIntake::default()),
                automation,
                signals: Arc::new(common::MockSignals::default()),
                renderer: Arc::new(StructuredReportRenderer::new()),
                transport: Arc::new(common::MockTransport::default()),
            },
        )
    };
    let a = build(store.clone(), automation.clone());
    let b = build(store.clone(), automation.clone());

    // Seed a record already awaiting its test request.
    let mut referral = lucid::Referral::from_inbound(&payload("<race@mail>", "NHS-3"));
    referral = referral.advanced_to(Stage::AwaitingTest, Utc::now());
    store.insert(&referral).unwrap();

    let now = Utc::now();
    let (ra, rb) = tokio::join!(a.run_tick(now), b.run_tick(now));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(automation.submits.load(Ordering::SeqCst), 1);
    // No failure events; the losing side is a silent skip.
    let events = store.events_for(&referral.id).unwrap();
    assert!(events
        .iter()
        .all(|e| !matches!(e.outcome, EventOutcome::TransientFailure | EventOutcome::PermanentFailure)));
}

/// A record claimed by a crashed tick is recovered by lookup, not by a
/// second submit.
#[tokio::test]
async fn test_claimed_but_unconfirmed_dispatch_is_recovered() {
    let automation = MockAutomation::default();
    automation.preload("NHS-4", "REQ-OLD");
    let h = harness_with(Config::default(), automation);

    let mut referral = lucid::Referral::from_inbound(&payload("<crash@mail>", "NHS-4"));
    referral = referral.advanced_to(Stage::AwaitingTest, Utc::now());
    // Simulate the crash: token persisted, stage never advanced.
    referral.dispatch_token = Some("stale-token".to_string());
    referral.dispatch_started_at = Some(Utc::now());
    h.store.insert(&referral).unwrap();

    h.scheduler.run_tick(Utc::now()).await.unwrap();

    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 0);
    assert_eq!(h.automation.lookups.load(Ordering::SeqCst), 1);
    let stored = h.store.get(&referral.id).unwrap().unwrap();
    assert!(matches!(
        stored.stage,
        Stage::TestRequested | Stage::AwaitingReport
    ));
    assert_eq!(stored.request_receipt.as_deref(), Some("REQ-OLD"));
}

/// Transport deduplicates on the idempotency token, so a send retried
/// after a transient failure cannot double-deliver.
#[tokio::test]
async fn test_retried_sends_reuse_the_same_token() {
    let mut config = Config::default();
    config.retry.initial_delay_secs = 0;
    let h = harness_with(config, MockAutomation::default());
    // First send attempt fails after the claim is persisted.
    h.transport.fail_sends.store(1, Ordering::SeqCst);
    h.intake.push(payload("<retry@mail>", "NHS-5"));

    h.scheduler.run_tick(Utc::now()).await.unwrap();
    // Confirmation failed transiently; retry next tick.
    assert_eq!(h.store.find_in_stage(Stage::Intake).unwrap().len(), 1);

    h.scheduler.run_tick(Utc::now()).await.unwrap();

    let accepted = h.transport.accepted.lock().unwrap();
    let confirmations: Vec<_> = accepted
        .iter()
        .filter(|m| m.recipient == "okafor@clinic.example")
        .collect();
    assert_eq!(confirmations.len(), 1);
    drop(accepted);
    assert_eq!(h.transport.unique_sends(), h.transport.accepted.lock().unwrap().len());
}
