//! End-to-end engine scenarios against in-memory fakes

mod support;

use avocado_core::models::{EventSource, SyncStatus, Trigger};
use avocado_core::task_block::has_user_intent;
use avocado_core::{event_fingerprint, staged_uid};
use serde_json::json;
use support::{INTAKE_CAL, STAGE_CAL, USER_CAL, harness, timed_event};

fn task_block_description(editable: &[&str], intent: &str) -> String {
    let fields = editable
        .iter()
        .map(|f| format!("- {f}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "[AI Task]\nlocked: false\nmandatory: false\neditable_fields:\n{fields}\nuser_intent: {intent}\n[/AI Task]"
    )
}

#[tokio::test]
async fn test_fresh_intake_import() {
    let h = harness().await;
    h.caldav
        .insert_event(INTAKE_CAL, timed_event(INTAKE_CAL, "abc", "Gym"));

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);

    let target = staged_uid(INTAKE_CAL, "abc");
    let twin = h.caldav.event(USER_CAL, &target).expect("user twin exists");
    assert_eq!(twin.source, EventSource::User);
    assert_eq!(twin.original_uid, "abc");
    assert_eq!(twin.original_calendar_id, INTAKE_CAL);
    assert!(twin.description.contains("[AI Task]"));

    assert!(h.caldav.uids(INTAKE_CAL).is_empty(), "intake is drained");

    let mirrored = h.caldav.event(STAGE_CAL, &target).expect("stage twin exists");
    assert_eq!(event_fingerprint(&mirrored), event_fingerprint(&twin));

    assert_eq!(h.planner.call_count(), 1, "manual run consults the planner");
    assert!(h.audit_actions().await.contains(&"import_intake_event".to_string()));
}

#[tokio::test]
async fn test_planner_edit_under_intent() {
    let h = harness().await;
    let mut event = timed_event(USER_CAL, "u-1", "Workout");
    event.description = task_block_description(&["start", "end"], "move earlier by 30 min");
    h.caldav.insert_event(USER_CAL, event.clone());

    let start = event.start.unwrap() - chrono::Duration::minutes(30);
    let end = event.end.unwrap() - chrono::Duration::minutes(30);
    h.planner.push_changes(vec![json!({
        "calendar_id": USER_CAL,
        "uid": "u-1",
        "start": start.to_rfc3339(),
        "end": end.to_rfc3339(),
        "summary": "Hacked",
        "reason": "user asked to move earlier",
    })]);

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);
    assert_eq!(outcome.changes_applied, 1);
    assert_eq!(outcome.conflicts, 0);

    let updated = h.caldav.event(USER_CAL, "u-1").unwrap();
    assert_eq!(updated.start.unwrap(), start, "start applied");
    assert_eq!(updated.summary, "Workout", "summary stayed blocked");
    assert!(!has_user_intent(&updated.description), "intent consumed");
    assert!(updated.description.contains("category:"), "category patched in");

    let blocked = h.audits_for("ai_change_blocked_by_editable_fields").await;
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].details()["blocked_fields"], json!(["summary"]));

    let applied = h.audits_for("apply_ai_change").await;
    assert_eq!(applied.len(), 1);
    let details = applied[0].details();
    assert_eq!(details["fields"], json!(["end", "start", "summary"]));
    assert!(details["patch"].as_array().unwrap().len() >= 2);
    assert!(details["expected_etag"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn test_user_edit_racing_planner_conflicts() {
    let h = harness().await;
    let mut event = timed_event(USER_CAL, "u-1", "Workout");
    event.description = task_block_description(&["start", "end"], "move earlier by 30 min");
    h.caldav.insert_event(USER_CAL, event.clone());

    let start = event.start.unwrap() - chrono::Duration::minutes(30);
    h.planner.push_changes(vec![json!({
        "calendar_id": USER_CAL,
        "uid": "u-1",
        "start": start.to_rfc3339(),
    })]);

    // While the planner "thinks", the user edits the event elsewhere.
    let caldav = h.caldav.clone();
    *h.planner.on_generate.lock().unwrap() = Some(Box::new(move || {
        caldav.touch_event(USER_CAL, "u-1");
    }));

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);
    assert_eq!(outcome.changes_applied, 0);
    assert_eq!(outcome.conflicts, 1);

    let untouched = h.caldav.event(USER_CAL, "u-1").unwrap();
    assert_eq!(untouched.start, event.start, "event left as the user had it");
    assert_eq!(h.audits_for("user_modified_after_planning").await.len(), 1);
}

#[tokio::test]
async fn test_scheduled_runs_suppress_identical_payload() {
    let h = harness().await;
    let mut event = timed_event(USER_CAL, "u-1", "Workout");
    event.description = task_block_description(&["start", "end"], "");
    h.caldav.insert_event(USER_CAL, event);

    let first = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(first.status, SyncStatus::Success);
    assert_eq!(h.planner.call_count(), 1);

    // Nothing changed: the scheduled run does not even consider planning.
    let second = h.engine.run_once(Trigger::Scheduled, None).await;
    assert_eq!(second.status, SyncStatus::Success);
    assert_eq!(h.planner.call_count(), 1);
    assert!(h.audits_for("skip_ai_same_payload").await.is_empty());

    // A hygiene mutation forces a replan, but the payload is unchanged, so
    // the scheduled call is suppressed by the fingerprint.
    h.caldav.insert_event(
        STAGE_CAL,
        timed_event(STAGE_CAL, "aaaaaaaaaa:bbbbbbbbbb:ghost", "Ghost"),
    );
    let third = h.engine.run_once(Trigger::Scheduled, None).await;
    assert_eq!(third.status, SyncStatus::Success);
    assert_eq!(third.changes_applied, 0);
    assert_eq!(h.planner.call_count(), 1, "still exactly one planner call");
    assert_eq!(h.audits_for("skip_ai_same_payload").await.len(), 1);
    assert_eq!(h.audits_for("purge_nested_stage_uid").await.len(), 1);
}

#[tokio::test]
async fn test_nested_user_uid_with_twin_is_purged() {
    let h = harness().await;
    h.caldav.insert_event(
        USER_CAL,
        timed_event(USER_CAL, "76044593b8:abc", "Canonical"),
    );
    h.caldav.insert_event(
        USER_CAL,
        timed_event(USER_CAL, "aaaaaaaaaa:76044593b8:abc", "Nested leftover"),
    );

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);

    let uids = h.caldav.uids(USER_CAL);
    assert!(uids.contains(&"76044593b8:abc".to_string()));
    assert!(!uids.contains(&"aaaaaaaaaa:76044593b8:abc".to_string()));
    assert_eq!(h.audits_for("purge_nested_user_uid").await.len(), 1);
    assert_eq!(h.planner.call_count(), 1, "repair forces a replan");
}

#[tokio::test]
async fn test_nested_user_uid_without_twin_is_migrated() {
    let h = harness().await;
    h.caldav.insert_event(
        USER_CAL,
        timed_event(USER_CAL, "aaaaaaaaaa:bbbbbbbbbb:abc", "Orphan nested"),
    );

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);

    let uids = h.caldav.uids(USER_CAL);
    assert!(uids.contains(&"bbbbbbbbbb:abc".to_string()), "collapsed twin created");
    assert!(!uids.contains(&"aaaaaaaaaa:bbbbbbbbbb:abc".to_string()));
    assert_eq!(h.audits_for("migrate_nested_user_uid").await.len(), 1);
}

#[tokio::test]
async fn test_unverified_duplicate_calendar_is_left_alone() {
    let h = harness().await;
    h.caldav.add_calendar("dup-cal", "Avocado User Calendar");
    h.caldav
        .insert_event("dup-cal", timed_event("dup-cal", "evt-1", "Theirs"));

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);

    assert_eq!(h.caldav.uids("dup-cal"), vec!["evt-1".to_string()]);
    assert_eq!(
        h.audits_for("warn_unverified_duplicate_user_calendar").await.len(),
        1
    );
    assert!(h.audits_for("purge_duplicate_user_calendar_event").await.is_empty());
}

#[tokio::test]
async fn test_verified_duplicate_calendar_is_drained() {
    let h = harness().await;
    h.caldav.add_calendar("dup-cal", "Avocado User Calendar");
    h.caldav
        .insert_event("dup-cal", timed_event("dup-cal", "evt-1", "Leftover"));
    h.state
        .set_meta("known_managed_calendar_ids", r#"["dup-cal"]"#)
        .await
        .unwrap();

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);

    assert!(h.caldav.uids("dup-cal").is_empty(), "duplicate drained");
    assert_eq!(
        h.audits_for("purge_duplicate_user_calendar_event").await.len(),
        1
    );
}

#[tokio::test]
async fn test_editable_source_seeds_user_twin() {
    let h = harness().await;
    h.caldav.add_calendar("personal", "Personal");
    let mut source = timed_event("personal", "evt-1", "Dentist");
    source.description = "Bring the referral letter".to_string();
    h.caldav.insert_event("personal", source);

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);

    // The source event got its task block written back once.
    let normalized_source = h.caldav.event("personal", "evt-1").unwrap();
    assert!(normalized_source.description.contains("[AI Task]"));
    assert!(normalized_source.description.contains("Bring the referral letter"));
    assert_eq!(h.caldav.upserts_to("personal").len(), 1);

    let target = staged_uid("personal", "evt-1");
    let twin = h.caldav.event(USER_CAL, &target).expect("seeded twin");
    assert_eq!(twin.source, EventSource::User);
    assert_eq!(twin.original_calendar_id, "personal");
    assert_eq!(twin.original_uid, "evt-1");
    assert_eq!(twin.summary, "Dentist");
    assert_eq!(h.audits_for("seed_user_event").await.len(), 1);

    // A second run is a no-op: no new seeds, no source rewrites.
    let second = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(second.status, SyncStatus::Success);
    assert_eq!(h.caldav.upserts_to("personal").len(), 1);
    assert_eq!(h.audits_for("seed_user_event").await.len(), 1);
}

#[tokio::test]
async fn test_source_intent_propagates_to_twin() {
    let h = harness().await;
    h.caldav.add_calendar("personal", "Personal");
    h.caldav
        .insert_event("personal", timed_event("personal", "evt-1", "Dentist"));

    h.engine.run_once(Trigger::Manual, None).await;
    let target = staged_uid("personal", "evt-1");
    assert!(h.caldav.event(USER_CAL, &target).is_some());

    // The user writes an intent on the source copy, dated in the future of
    // the twin's block.
    let newer = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
    h.caldav.rewrite_description(
        "personal",
        "evt-1",
        &format!(
            "[AI Task]\nlocked: false\nmandatory: false\nuser_intent: move to the evening\nupdated_at: \"{newer}\"\n[/AI Task]"
        ),
    );

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);

    let twin = h.caldav.event(USER_CAL, &target).unwrap();
    assert!(twin.description.contains("move to the evening"));
    assert_eq!(h.audits_for("propagate_user_intent").await.len(), 1);
}

#[tokio::test]
async fn test_immutable_source_is_never_written() {
    let h = harness().await;
    // "work" is an immutable keyword by default.
    h.caldav.add_calendar("work-cal", "Work schedule");
    h.caldav
        .insert_event("work-cal", timed_event("work-cal", "mtg-1", "All hands"));

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);

    assert!(h.caldav.upserts_to("work-cal").is_empty(), "read-only layer");
    let stored = h.caldav.event("work-cal", "mtg-1").unwrap();
    assert!(!stored.description.contains("[AI Task]"));

    // No twin is seeded for immutable sources.
    let target = staged_uid("work-cal", "mtg-1");
    assert!(h.caldav.event(USER_CAL, &target).is_none());

    // But the event is part of the planner payload.
    let requests = h.audits_for("ai_planning_request").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].details()["event_count"], json!(1));
}

#[tokio::test]
async fn test_stage_orphans_are_pruned() {
    let h = harness().await;
    h.caldav
        .insert_event(STAGE_CAL, timed_event(STAGE_CAL, "76044593b8:gone", "Stale"));

    let outcome = h.engine.run_once(Trigger::Scheduled, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);

    assert!(h.caldav.uids(STAGE_CAL).is_empty(), "orphan removed");
    assert_eq!(h.audits_for("purge_stage_orphan_uid").await.len(), 1);
    // The orphan forced a replan on a scheduled trigger.
    assert_eq!(h.planner.call_count(), 1);
}

#[tokio::test]
async fn test_missing_caldav_config_skips_run() {
    let h = harness().await;
    h.config_store
        .update(&json!({"caldav": {"base_url": "", "username": ""}}))
        .unwrap();

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Skipped);
    assert!(outcome.message.contains("Sync skipped"));
    assert_eq!(h.planner.call_count(), 0);

    let runs = h.state.recent_runs(5).await.unwrap();
    assert_eq!(runs[0].status, "skipped");
}

#[tokio::test]
async fn test_transport_failure_records_run_error() {
    let h = harness().await;
    h.caldav
        .fail_listing
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Error);

    let errors = h.audits_for("run_error").await;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].details()["traceback"]
        .as_str()
        .unwrap()
        .contains("listing exploded"));

    let runs = h.state.recent_runs(5).await.unwrap();
    assert_eq!(runs[0].status, "error");

    // The next run converges once the transport recovers.
    h.caldav
        .fail_listing
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let retry = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(retry.status, SyncStatus::Success);
}

#[tokio::test]
async fn test_no_op_change_consumes_intent() {
    let h = harness().await;
    let mut event = timed_event(USER_CAL, "u-1", "Workout");
    event.description = task_block_description(&["start", "end", "summary"], "keep as is");
    h.caldav.insert_event(USER_CAL, event.clone());

    h.planner.push_changes(vec![json!({
        "calendar_id": USER_CAL,
        "uid": "u-1",
        "summary": "Workout",
    })]);

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);
    assert_eq!(outcome.changes_applied, 0);
    assert_eq!(outcome.conflicts, 0);

    assert_eq!(h.audits_for("ai_change_skipped_no_effect").await.len(), 1);
    let stored = h.caldav.event(USER_CAL, "u-1").unwrap();
    assert!(!has_user_intent(&stored.description), "no-op still consumes intent");
}

#[tokio::test]
async fn test_unmatched_change_is_dropped() {
    let h = harness().await;
    h.planner.push_changes(vec![json!({
        "calendar_id": "nowhere",
        "uid": "missing",
        "summary": "Ghost",
    })]);

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);
    assert_eq!(outcome.changes_applied, 0);
    assert_eq!(h.audits_for("ai_change_unmatched").await.len(), 1);
}

#[tokio::test]
async fn test_change_addressed_by_source_uid_is_resolved() {
    let h = harness().await;
    h.caldav.add_calendar("personal", "Personal");
    let mut source = timed_event("personal", "evt-1", "Dentist");
    source.description = task_block_description(&["start", "end", "summary"], "rename this");
    h.caldav.insert_event("personal", source);

    // The planner answers with the source address; the engine maps it to
    // the namespaced user twin.
    h.planner.push_changes(vec![json!({
        "calendar_id": "personal",
        "uid": "evt-1",
        "summary": "Dentist (confirmed)",
    })]);

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.status, SyncStatus::Success);
    assert_eq!(outcome.changes_applied, 1);

    let target = staged_uid("personal", "evt-1");
    let twin = h.caldav.event(USER_CAL, &target).unwrap();
    assert_eq!(twin.summary, "Dentist (confirmed)");
    // The source copy is not touched by the apply.
    assert_eq!(h.caldav.event("personal", "evt-1").unwrap().summary, "Dentist");
}

#[tokio::test]
async fn test_scheduler_runs_startup_and_stops() {
    use avocado_sync::Scheduler;
    use std::sync::Arc;

    let h = harness().await;
    let scheduler = Scheduler::new(Arc::clone(&h.engine));
    scheduler.start();

    // Wait for the startup run to land.
    for _ in 0..100 {
        if !h.state.recent_runs(1).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    scheduler.stop().await;

    let runs = h.state.recent_runs(5).await.unwrap();
    assert!(runs.iter().any(|r| r.trigger == "startup"));

    // Stopping twice is harmless.
    scheduler.stop().await;
}

#[tokio::test]
async fn test_manual_trigger_queues_a_run() {
    use avocado_sync::Scheduler;
    use std::sync::Arc;

    let h = harness().await;
    let scheduler = Scheduler::new(Arc::clone(&h.engine));
    scheduler.start();
    scheduler.trigger_manual();

    for _ in 0..200 {
        let runs = h.state.recent_runs(10).await.unwrap();
        if runs.iter().any(|r| r.trigger == "manual") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    scheduler.stop().await;

    let runs = h.state.recent_runs(10).await.unwrap();
    assert!(runs.iter().any(|r| r.trigger == "manual"));
}

#[tokio::test]
async fn test_locked_event_conflicts() {
    let h = harness().await;
    let mut event = timed_event(USER_CAL, "u-1", "Board meeting");
    event.description =
        "[AI Task]\nlocked: true\nmandatory: false\nuser_intent: try anyway\n[/AI Task]".to_string();
    h.caldav.insert_event(USER_CAL, event);

    h.planner.push_changes(vec![json!({
        "calendar_id": USER_CAL,
        "uid": "u-1",
        "summary": "Moved",
    })]);

    let outcome = h.engine.run_once(Trigger::Manual, None).await;
    assert_eq!(outcome.conflicts, 1);
    assert_eq!(outcome.changes_applied, 0);
    assert_eq!(h.audits_for("event_locked_or_mandatory").await.len(), 1);
    assert_eq!(h.caldav.event(USER_CAL, "u-1").unwrap().summary, "Board meeting");
}
