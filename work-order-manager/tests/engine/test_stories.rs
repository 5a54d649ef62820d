//! Loop/story subsystem: planning, per-story verification, retries,
//! escalation, and regeneration after an aggregate gate rejection.

use super::common::*;
use serde_json::json;
use uuid::Uuid;
use work_order_manager::models::Operation;
use work_order_sdk::{
    CompletionResult, OperationStatus, ResultStatus, Station, StoryStatus, TaskKind, WorkOrderState,
};

/// Start a bug-fix run with an empty context: effective stages collapse to
/// [build (loop), build_review].
async fn start_loop_run(h: &Harness) -> Uuid {
    let wo = seed_work_order(h, &["bug"]).await;
    h.engine
        .start_work_order(wo.id, start_with(&[]))
        .await
        .unwrap();

    let frozen = reload_work_order(h, wo.id).await;
    let refs: Vec<&str> = frozen
        .effective_stages
        .iter()
        .map(|s| s.stage_ref.as_str())
        .collect();
    assert_eq!(refs, vec!["build", "build_review"]);
    wo.id
}

async fn get_op(h: &Harness, id: Uuid) -> Operation {
    h.db.lock().await.get_operation(id).unwrap().unwrap()
}

#[tokio::test]
async fn initiation_plans_stories_and_dispatches_first_build() {
    let h = harness();
    let wo_id = start_loop_run(&h).await;

    let loop_op = sole_in_progress(&h, wo_id).await;
    advance(
        &h,
        loop_op.id,
        ResultStatus::Completed,
        "t1",
        story_batch("b1", 2),
        None,
    )
    .await;

    let db = h.db.lock().await;
    let stories = db.list_stories(loop_op.id).unwrap();
    assert_eq!(stories.len(), 2);
    assert_eq!(stories[0].story_key, "b1-s1");
    assert_eq!(stories[0].status, StoryStatus::Building);
    assert_eq!(stories[1].status, StoryStatus::Pending);

    let op = db.get_operation(loop_op.id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::InProgress);
    assert_eq!(op.current_story_id, Some(stories[0].id));
    drop(db);

    let payload = h.dispatcher.last_payload();
    assert_eq!(payload.kind, TaskKind::StoryBuild);
    assert_eq!(payload.operation_id, loop_op.id);
    assert_eq!(payload.story.as_ref().unwrap().key, "b1-s1");
}

#[tokio::test]
async fn story_build_hands_off_to_transient_verification() {
    let h = harness();
    let wo_id = start_loop_run(&h).await;

    let loop_op = sole_in_progress(&h, wo_id).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t1", story_batch("b1", 2), None).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t2", json!({"diff": "..."}), None).await;

    // Parent waits; the only in-progress operation is the transient verify
    let verify_op = sole_in_progress(&h, wo_id).await;
    assert_ne!(verify_op.id, loop_op.id);
    assert_eq!(verify_op.station, Station::Review);
    assert!(verify_op.loop_config_json.as_deref().unwrap().contains("story_verify"));

    let parent = get_op(&h, loop_op.id).await;
    assert_eq!(parent.status, OperationStatus::Waiting);

    let db = h.db.lock().await;
    let stories = db.list_stories(loop_op.id).unwrap();
    assert_eq!(stories[0].status, StoryStatus::Verifying);
    assert!(stories[0].output_json.as_deref().unwrap().contains("diff"));
    drop(db);

    let payload = h.dispatcher.last_payload();
    assert_eq!(payload.kind, TaskKind::StoryVerify);
    assert_eq!(payload.operation_id, verify_op.id);
    assert_eq!(payload.station, Station::Review);
}

#[tokio::test]
async fn waiting_parent_refuses_direct_completions() {
    let h = harness();
    let wo_id = start_loop_run(&h).await;

    let loop_op = sole_in_progress(&h, wo_id).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t1", story_batch("b1", 1), None).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t2", json!({}), None).await;

    // While its transient verification is in flight, the parent only
    // advances through that verify operation
    let before = h.dispatcher.dispatch_count();
    assert!(h
        .engine
        .advance_on_completion(
            loop_op.id,
            CompletionResult::new(ResultStatus::Completed, "t3"),
        )
        .await
        .is_err());
    assert_eq!(h.dispatcher.dispatch_count(), before);

    let parent = get_op(&h, loop_op.id).await;
    assert_eq!(parent.status, OperationStatus::Waiting);
}

#[tokio::test]
async fn verified_story_advances_to_the_next() {
    let h = harness();
    let wo_id = start_loop_run(&h).await;

    let loop_op = sole_in_progress(&h, wo_id).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t1", story_batch("b1", 2), None).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t2", json!({}), None).await;

    let verify_op = sole_in_progress(&h, wo_id).await;
    advance(&h, verify_op.id, ResultStatus::Approved, "t3", json!({}), None).await;

    let db = h.db.lock().await;
    let stories = db.list_stories(loop_op.id).unwrap();
    assert_eq!(stories[0].status, StoryStatus::Done);
    assert_eq!(stories[1].status, StoryStatus::Building);

    let parent = db.get_operation(loop_op.id).unwrap().unwrap();
    assert_eq!(parent.status, OperationStatus::InProgress);
    assert_eq!(parent.current_story_id, Some(stories[1].id));

    // Story verification leaves a durable approval
    let approvals = db.list_approvals(wo_id).unwrap();
    assert_eq!(approvals.len(), 1);
    drop(db);

    let payload = h.dispatcher.last_payload();
    assert_eq!(payload.kind, TaskKind::StoryBuild);
    assert_eq!(payload.story.as_ref().unwrap().key, "b1-s2");
}

#[tokio::test]
async fn rejected_story_retries_with_feedback_then_escalates() {
    let h = harness();
    let wo_id = start_loop_run(&h).await;

    let loop_op = sole_in_progress(&h, wo_id).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t1", story_batch("b1", 1), None).await;

    // Default budget is 2 retries; the 3rd rejection escalates
    let mut tick = 1;
    for attempt in 1..=3 {
        tick += 1;
        advance(&h, loop_op.id, ResultStatus::Completed, &format!("t{}", tick), json!({}), None)
            .await;
        let verify_op = sole_in_progress(&h, wo_id).await;
        tick += 1;
        advance(
            &h,
            verify_op.id,
            ResultStatus::Rejected,
            &format!("t{}", tick),
            json!({}),
            Some("does not meet acceptance criteria"),
        )
        .await;

        let db = h.db.lock().await;
        let story = &db.list_stories(loop_op.id).unwrap()[0];
        assert_eq!(story.retry_count, attempt);
        if attempt < 3 {
            assert_eq!(story.status, StoryStatus::Building);
            drop(db);
            let payload = h.dispatcher.last_payload();
            assert_eq!(payload.kind, TaskKind::StoryBuild);
            assert_eq!(
                payload.feedback.as_deref(),
                Some("does not meet acceptance criteria")
            );
        } else {
            assert_eq!(story.status, StoryStatus::Failed);
            let parent = db.get_operation(loop_op.id).unwrap().unwrap();
            assert_eq!(parent.status, OperationStatus::Blocked);
            assert!(parent.escalation_reason.is_some());
            drop(db);
            let wo = reload_work_order(&h, wo_id).await;
            assert_eq!(wo.state, WorkOrderState::Blocked);
        }
    }
}

#[tokio::test]
async fn last_story_completes_the_loop_and_reaches_the_gate() {
    let h = harness();
    let wo_id = start_loop_run(&h).await;

    let loop_op = sole_in_progress(&h, wo_id).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t1", story_batch("b1", 1), None).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t2", json!({}), None).await;
    let verify_op = sole_in_progress(&h, wo_id).await;
    advance(&h, verify_op.id, ResultStatus::Approved, "t3", json!({}), None).await;

    let parent = get_op(&h, loop_op.id).await;
    assert_eq!(parent.status, OperationStatus::Completed);
    assert!(parent.current_story_id.is_none());

    // A genuine operation for the aggregate gate, not a transient one
    let gate_op = sole_in_progress(&h, wo_id).await;
    assert_eq!(gate_op.station, Station::Review);
    assert!(gate_op.loop_config_json.is_none());
    let payload = h.dispatcher.last_payload();
    assert_eq!(payload.kind, TaskKind::Stage);
    assert_eq!(payload.stage_ref, "build_review");
}

#[tokio::test]
async fn empty_batch_completes_the_stage_outright() {
    let h = harness();
    let wo_id = start_loop_run(&h).await;

    let loop_op = sole_in_progress(&h, wo_id).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t1", json!({}), None).await;

    let parent = get_op(&h, loop_op.id).await;
    assert_eq!(parent.status, OperationStatus::Completed);
    let payload = h.dispatcher.last_payload();
    assert_eq!(payload.stage_ref, "build_review");
}

#[tokio::test]
async fn gate_rejection_regenerates_a_fresh_smaller_batch() {
    let h = harness();
    let wo_id = start_loop_run(&h).await;

    // First pass: two stories, both verified, gate reached
    let first_loop = sole_in_progress(&h, wo_id).await;
    advance(&h, first_loop.id, ResultStatus::Completed, "t1", story_batch("b1", 2), None).await;
    for tick in [2, 4] {
        advance(&h, first_loop.id, ResultStatus::Completed, &format!("t{}", tick), json!({}), None)
            .await;
        let verify_op = sole_in_progress(&h, wo_id).await;
        advance(
            &h,
            verify_op.id,
            ResultStatus::Approved,
            &format!("t{}", tick + 1),
            json!({}),
            None,
        )
        .await;
    }

    // The aggregate gate rejects the whole loop stage
    let gate_op = sole_in_progress(&h, wo_id).await;
    advance(
        &h,
        gate_op.id,
        ResultStatus::Rejected,
        "t6",
        json!({}),
        Some("stories missed the edge cases"),
    )
    .await;

    // Old batch purged, a new loop operation started over
    let second_loop = sole_in_progress(&h, wo_id).await;
    assert_ne!(second_loop.id, first_loop.id);
    {
        let db = h.db.lock().await;
        assert!(db.list_stories(first_loop.id).unwrap().is_empty());
    }

    // Second, smaller batch under a different key prefix
    advance(&h, second_loop.id, ResultStatus::Completed, "t7", story_batch("b2", 1), None).await;
    let db = h.db.lock().await;
    let stories = db.list_stories(second_loop.id).unwrap();
    assert_eq!(stories.len(), 1);
    assert_eq!(stories[0].story_key, "b2-s1");
}
