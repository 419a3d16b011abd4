//! Safety limits through the scheduler: per-subject cool-down, the
//! per-tick dispatch budget, and the proactive anomaly sweep.

mod common;

use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use common::{harness_with, payload, MockAutomation};
use lucid::domain::{EventOutcome, Stage, StageEvent};
use lucid::Config;

#[tokio::test]
async fn test_second_request_for_same_subject_is_deferred() {
    let h = harness_with(Config::default(), MockAutomation::default());

    // Two referrals for the same patient.
    h.intake.push(payload("<s1@mail>", "NHS-SAME"));
    h.intake.push(payload("<s2@mail>", "NHS-SAME"));

    let start = Utc::now();
    let report = h.scheduler.run_tick(start).await.unwrap();
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 1);
    assert_eq!(report.denied, 1);

    // The deferred record kept its stage, consumed no attempt, and holds
    // no dispatch token: nothing fired for it.
    let waiting = h.store.find_in_stage(Stage::AwaitingTest).unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].attempt_count, 0);
    assert_eq!(waiting[0].dispatch_token, None);
    let events = h.store.events_for(&waiting[0].id).unwrap();
    assert!(events
        .iter()
        .any(|e| e.outcome == EventOutcome::SafetyDenied));

    // Denials repeat while the window holds.
    let report = h.scheduler.run_tick(start + Duration::hours(1)).await.unwrap();
    assert_eq!(report.denied, 1);
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 1);

    // Outside the 24h window the deferred record submits its own request
    // rather than recovering the first referral's receipt.
    h.scheduler
        .run_tick(start + Duration::hours(25))
        .await
        .unwrap();
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 2);
    assert_eq!(h.automation.lookups.load(Ordering::SeqCst), 0);
    assert!(h.store.find_in_stage(Stage::AwaitingTest).unwrap().is_empty());

    let mut receipts: Vec<String> = h
        .store
        .list(None, 10)
        .unwrap()
        .into_iter()
        .filter_map(|r| r.request_receipt)
        .collect();
    receipts.sort();
    assert_eq!(receipts, vec!["REQ-1".to_string(), "REQ-2".to_string()]);
}

#[tokio::test]
async fn test_same_subject_cap_holds_under_concurrent_dispatch() {
    // Default parallelism fans same-stage records out concurrently; a slow
    // service keeps both dispatches in flight at once.
    let automation = MockAutomation::default();
    automation.delay_ms.store(200, Ordering::SeqCst);
    let h = harness_with(Config::default(), automation);

    h.intake.push(payload("<c1@mail>", "NHS-RACE"));
    h.intake.push(payload("<c2@mail>", "NHS-RACE"));

    let report = h.scheduler.run_tick(Utc::now()).await.unwrap();
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 1);
    assert_eq!(report.denied, 1);

    let waiting = h.store.find_in_stage(Stage::AwaitingTest).unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].dispatch_token, None);
}

#[tokio::test]
async fn test_tick_budget_spreads_dispatches_across_ticks() {
    let mut config = Config::default();
    config.parallelism = 1;
    config.safety.max_requests_per_tick = 1;
    let h = harness_with(config, MockAutomation::default());

    for i in 0..3 {
        h.intake.push(payload(&format!("<b{i}@mail>"), &format!("NHS-{i}")));
    }

    let start = Utc::now();
    let report = h.scheduler.run_tick(start).await.unwrap();
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 1);
    assert_eq!(report.denied, 2);

    h.scheduler.run_tick(start + Duration::minutes(5)).await.unwrap();
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 2);

    h.scheduler.run_tick(start + Duration::minutes(10)).await.unwrap();
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 3);
    assert!(h.store.find_in_stage(Stage::AwaitingTest).unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_flags_subjects_over_the_daily_cap() {
    let h = harness_with(Config::default(), MockAutomation::default());

    // Seed a record and attribute three requests to its subject within 24h,
    // the kind of volume only a malfunction produces.
    let referral = lucid::Referral::from_inbound(&payload("<an@mail>", "NHS-ANOM"));
    h.store.insert(&referral).unwrap();
    let now = Utc::now();
    for hours_ago in [20, 10, 2] {
        h.store
            .append_event(
                StageEvent::new(&referral.id, EventOutcome::Advanced, "test requested")
                    .with_transition(Stage::AwaitingTest, Stage::TestRequested)
                    .occurred_at(now - Duration::hours(hours_ago)),
            )
            .unwrap();
    }

    let report = h.scheduler.run_tick(now).await.unwrap();
    assert_eq!(report.anomalies_flagged, 1);

    let events = h.store.events_for(&referral.id).unwrap();
    assert!(events
        .iter()
        .any(|e| e.outcome == EventOutcome::AnomalyFlagged));
}

#[tokio::test]
async fn test_resend_is_rate_limited_and_audited() {
    let mut config = Config::default();
    config.parallelism = 1;
    let h = harness_with(config, MockAutomation::default());
    h.intake.push(payload("<rs@mail>", "NHS-RS"));

    let start = Utc::now();
    h.scheduler.run_tick(start).await.unwrap();
    let referral = &h.store.find_in_stage(Stage::AwaitingReport).unwrap()[0];

    // Too soon: the link is only minutes old.
    let err = h
        .scheduler
        .resend_test_request(&referral.id, start + Duration::hours(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("resend allowed after"));

    // A week on, the resend goes through and is audited.
    let later = start + Duration::hours(170);
    let updated = h
        .scheduler
        .resend_test_request(&referral.id, later)
        .await
        .unwrap();
    assert_eq!(updated.resend_count, 1);
    assert_eq!(updated.last_resent_at, Some(later));
    assert_eq!(h.automation.submits.load(Ordering::SeqCst), 2);

    let events = h.store.events_for(&referral.id).unwrap();
    assert!(events.iter().any(|e| e.outcome == EventOutcome::Resent));

    // A second resend the same day is blocked by the subject window.
    let err = h
        .scheduler
        .resend_test_request(&referral.id, later + Duration::hours(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("resend allowed after") || err.to_string().contains("denied"));
}
