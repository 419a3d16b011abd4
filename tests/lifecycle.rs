//! End-to-end lifecycle tests: a referral travels from inbound payload to
//! delivered report across ticks, with the event log recording every hop.

mod common;

use chrono::Utc;
use common::{harness, payload};
use lucid::adapters::CompletionSignal;
use lucid::domain::{EventOutcome, Stage};

#[tokio::test]
async fn test_referral_reaches_delivery_across_ticks() {
    let h = harness();
    h.intake.push(payload("<ref-1@mail>", "NHS-100"));

    // Tick 1: intake, confirmation, test request, patient notice.
    let now = Utc::now();
    let report = h.scheduler.run_tick(now).await.unwrap();
    assert!(report.advanced >= 4);
    assert!(!report.had_terminal_failures());

    let records = h.store.find_in_stage(Stage::AwaitingReport).unwrap();
    assert_eq!(records.len(), 1);
    let referral = &records[0];
    assert!(referral.confirmed_at.is_some());
    assert!(referral.test_requested_at.is_some());
    assert!(referral.test_link.is_some());
    assert_eq!(h.automation.submits.load(std::sync::atomic::Ordering::SeqCst), 1);
    // Referrer confirmation and patient notice both went out.
    assert_eq!(h.transport.sent_to("okafor@clinic.example"), 1);
    assert_eq!(h.transport.sent_to("patient@example.com"), 1);

    // Tick 2: nothing to do without a completion signal.
    let report = h.scheduler.run_tick(Utc::now()).await.unwrap();
    assert_eq!(report.advanced, 0);
    assert_eq!(report.held, 1);

    // Completion signal arrives; write the raw report it points at.
    let raw_path = h.reports_dir.path().join("raw-100.json");
    tokio::fs::write(&raw_path, br#"{"band": "ii", "score": 42}"#)
        .await
        .unwrap();
    h.signals.push(CompletionSignal {
        signal_id: "sig-100".to_string(),
        referral_id: referral.id.clone(),
        report_ref: raw_path.to_string_lossy().into_owned(),
        observed_at: Utc::now(),
    });

    // Tick 3: detect, process, deliver.
    let report = h.scheduler.run_tick(Utc::now()).await.unwrap();
    assert_eq!(report.advanced, 3);
    assert!(!report.had_terminal_failures());

    let stored = h.store.get(&referral.id).unwrap().unwrap();
    assert_eq!(stored.stage, Stage::Delivered);
    assert!(stored.delivered_at.is_some());
    assert!(stored.processed_report_digest.is_some());
    let out_path = stored.processed_report_path.as_ref().unwrap();
    let content = tokio::fs::read_to_string(out_path).await.unwrap();
    assert!(content.starts_with("# Assessment Report"));

    // Signal consumed exactly once.
    assert_eq!(h.signals.acked.lock().unwrap().as_slice(), ["sig-100"]);
    // Delivery email carried the processed report.
    assert_eq!(h.transport.sent_to("okafor@clinic.example"), 2);

    // Event log tells the whole story in order.
    let events = h.store.events_for(&stored.id).unwrap();
    let outcomes: Vec<EventOutcome> = events.iter().map(|e| e.outcome).collect();
    assert_eq!(outcomes[0], EventOutcome::Created);
    assert_eq!(
        outcomes.iter().filter(|o| **o == EventOutcome::Advanced).count(),
        7
    );
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());

    // Terminal stage stays put on later ticks.
    let report = h.scheduler.run_tick(Utc::now()).await.unwrap();
    assert_eq!(report.advanced, 0);
    assert_eq!(h.store.get(&stored.id).unwrap().unwrap().stage, Stage::Delivered);
}

#[tokio::test]
async fn test_invalid_payload_fails_permanently() {
    let h = harness();
    let mut bad = payload("<ref-2@mail>", "NHS-200");
    bad.referrer_email = None;
    h.intake.push(bad);

    let report = h.scheduler.run_tick(Utc::now()).await.unwrap();
    assert!(report.had_terminal_failures());
    assert_eq!(report.failed, 1);

    let failed = h.store.find_in_stage(Stage::Failed).unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.as_deref().unwrap().contains("referrer"));

    let events = h.store.events_for(&failed[0].id).unwrap();
    assert!(events
        .iter()
        .any(|e| e.outcome == EventOutcome::PermanentFailure));
    // No external dispatch happened for the bad record.
    assert_eq!(h.transport.accepted.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn test_disabled_stage_is_skipped() {
    let mut config = lucid::Config::default();
    config.disabled_stages = vec![Stage::AwaitingTest];
    let h = common::harness_with(config, common::MockAutomation::default());
    h.intake.push(payload("<ref-3@mail>", "NHS-300"));

    h.scheduler.run_tick(Utc::now()).await.unwrap();

    // Record parks in awaiting_test; no request was submitted.
    let parked = h.store.find_in_stage(Stage::AwaitingTest).unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(h.automation.submits.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unmatched_signal_left_for_reconciliation() {
    let h = harness();
    h.signals.push(CompletionSignal {
        signal_id: "sig-ghost".to_string(),
        referral_id: "not-a-referral".to_string(),
        report_ref: "/tmp/nothing.json".to_string(),
        observed_at: Utc::now(),
    });

    h.scheduler.run_tick(Utc::now()).await.unwrap();

    assert!(h.signals.acked.lock().unwrap().is_empty());
    let events = h.store.events_for("not-a-referral").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, EventOutcome::SignalUnmatched);
}
