//! End-to-end pipeline scenarios.

use super::common::*;
use serde_json::json;
use uuid::Uuid;
use work_order_sdk::{OperationStatus, ResultStatus, TaskKind, WorkOrderState};

/// At most one in-progress operation per work order, checked between steps.
async fn assert_wip_bound(h: &Harness, wo_id: Uuid) {
    let db = h.db.lock().await;
    assert!(db.in_progress_count(wo_id).unwrap() <= 1);
}

#[tokio::test]
async fn bug_fix_pipeline_with_rework_ships() {
    let h = harness();
    let wo = seed_work_order(&h, &["bug"]).await;
    h.engine
        .start_work_order(
            wo.id,
            start_with(&[
                ("hasUnknowns", json!(true)),
                ("touchesSecurity", json!(true)),
            ]),
        )
        .await
        .unwrap();

    let frozen = reload_work_order(&h, wo.id).await;
    let refs: Vec<&str> = frozen
        .effective_stages
        .iter()
        .map(|s| s.stage_ref.as_str())
        .collect();
    assert_eq!(
        refs,
        vec!["plan", "plan_review", "build", "build_review", "security"]
    );

    let mut tick = 0;
    let mut step = |status: ResultStatus, output: serde_json::Value, feedback: Option<&'static str>| {
        tick += 1;
        (status, format!("t{}", tick), output, feedback)
    };

    // Plan rejected once, then approved
    let script = vec![
        step(ResultStatus::Completed, json!({}), None),
        step(ResultStatus::Rejected, json!({}), Some("plan too vague")),
        step(ResultStatus::Completed, json!({}), None),
        step(ResultStatus::Approved, json!({}), None),
        // Loop initiation: two stories
        step(ResultStatus::Completed, story_batch("b1", 2), None),
        // Story 1 build, rejected once in verification, rebuilt, approved
        step(ResultStatus::Completed, json!({}), None),
        step(ResultStatus::Rejected, json!({}), Some("tests missing")),
        step(ResultStatus::Completed, json!({}), None),
        step(ResultStatus::Approved, json!({}), None),
        // Story 2 build and verification
        step(ResultStatus::Completed, json!({}), None),
        step(ResultStatus::Approved, json!({}), None),
        // Aggregate build review rejected once: loop regenerates
        step(ResultStatus::Rejected, json!({}), Some("missed edge cases")),
        step(ResultStatus::Completed, story_batch("b2", 1), None),
        step(ResultStatus::Completed, json!({}), None),
        step(ResultStatus::Approved, json!({}), None),
        // Second build review approves, then security approves
        step(ResultStatus::Approved, json!({}), None),
        step(ResultStatus::Approved, json!({}), None),
    ];

    for (status, token, output, feedback) in script {
        let op = sole_in_progress(&h, wo.id).await;
        advance(&h, op.id, status, &token, output, feedback).await;
        assert_wip_bound(&h, wo.id).await;
    }

    let wo = reload_work_order(&h, wo.id).await;
    assert_eq!(wo.state, WorkOrderState::Shipped);
    assert!(wo.shipped_at.is_some());

    // Dispatch volume reflects the rework churn
    assert!(h.dispatcher.dispatch_count() > 8);

    // Rework evidence: both the plan review and the build review looped back
    let db = h.db.lock().await;
    let rework_ops = db
        .list_operations(wo.id)
        .unwrap()
        .into_iter()
        .filter(|o| o.status == OperationStatus::Rework)
        .count();
    assert_eq!(rework_ops, 2);
    assert_eq!(db.count_activities_of_kind("rework_started").unwrap(), 2);
    drop(db);

    // Exactly one completion notification, to the coordinator channel
    let notifications = h.dispatcher.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].0, "coordinator");
}

#[tokio::test]
async fn security_audit_with_code_changes_takes_two_dispatches() {
    let h = harness();
    let wo = seed_work_order(&h, &["security-audit"]).await;
    h.engine
        .start_work_order(wo.id, start_with(&[("hasCodeChanges", json!(true))]))
        .await
        .unwrap();

    let security_op = sole_in_progress(&h, wo.id).await;
    advance(&h, security_op.id, ResultStatus::Completed, "t1", json!({}), None).await;
    let gate_op = sole_in_progress(&h, wo.id).await;
    advance(&h, gate_op.id, ResultStatus::Approved, "t2", json!({}), None).await;

    let wo = reload_work_order(&h, wo.id).await;
    assert_eq!(wo.state, WorkOrderState::Shipped);

    // Inactive stages never materialized
    assert_eq!(h.dispatcher.dispatch_count(), 2);
    let db = h.db.lock().await;
    let ops = db.list_operations(wo.id).unwrap();
    assert_eq!(ops.len(), 2);
    assert!(ops
        .iter()
        .all(|o| o.status != OperationStatus::Rework));
    drop(db);

    assert_eq!(h.dispatcher.notifications().len(), 1);
}

#[tokio::test]
async fn feature_pipeline_activates_conditional_stages() {
    let h = harness();
    let wo = seed_work_order(&h, &[]).await;
    h.engine
        .start_work_order(
            wo.id,
            start_with(&[
                ("hasCodeChanges", json!(true)),
                ("isDeployable", json!(true)),
            ]),
        )
        .await
        .unwrap();

    let frozen = reload_work_order(&h, wo.id).await;
    assert_eq!(frozen.workflow_id.as_deref(), Some("feature"));
    let refs: Vec<&str> = frozen
        .effective_stages
        .iter()
        .map(|s| s.stage_ref.as_str())
        .collect();
    assert_eq!(
        refs,
        vec![
            "plan",
            "plan_review",
            "build",
            "build_review",
            "testing",
            "security"
        ]
    );

    // Straight run: no rejections anywhere
    let script = vec![
        (ResultStatus::Completed, json!({})),
        (ResultStatus::Approved, json!({})),
        (ResultStatus::Completed, story_batch("b1", 1)),
        (ResultStatus::Completed, json!({})),
        (ResultStatus::Approved, json!({})),
        (ResultStatus::Approved, json!({})),
        (ResultStatus::Completed, json!({})),
        (ResultStatus::Approved, json!({})),
    ];
    for (i, (status, output)) in script.into_iter().enumerate() {
        let op = sole_in_progress(&h, wo.id).await;
        advance(&h, op.id, status, &format!("t{}", i + 1), output, None).await;
        assert_wip_bound(&h, wo.id).await;
    }

    let wo = reload_work_order(&h, wo.id).await;
    assert_eq!(wo.state, WorkOrderState::Shipped);
    assert_eq!(h.dispatcher.notifications().len(), 1);
}

#[tokio::test]
async fn empty_effective_sequence_ships_immediately() {
    let h = harness();
    let wo = seed_work_order(&h, &["security-audit"]).await;
    // Nothing activates: no unknowns, no changes, no findings
    h.engine
        .start_work_order(wo.id, start_with(&[]))
        .await
        .unwrap();

    let wo = reload_work_order(&h, wo.id).await;
    assert_eq!(wo.state, WorkOrderState::Shipped);
    assert!(wo.effective_stages.is_empty());
    assert_eq!(h.dispatcher.dispatch_count(), 0);
    assert_eq!(h.dispatcher.notifications().len(), 1);
}

#[tokio::test]
async fn dispatched_tasks_carry_task_kinds_for_workers() {
    let h = harness();
    let wo = seed_work_order(&h, &["bug"]).await;
    h.engine
        .start_work_order(wo.id, start_with(&[]))
        .await
        .unwrap();

    let loop_op = sole_in_progress(&h, wo.id).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t1", story_batch("b1", 1), None).await;
    advance(&h, loop_op.id, ResultStatus::Completed, "t2", json!({}), None).await;

    let kinds: Vec<TaskKind> = h.dispatcher.payloads().iter().map(|p| p.kind).collect();
    assert_eq!(
        kinds,
        vec![TaskKind::Stage, TaskKind::StoryBuild, TaskKind::StoryVerify]
    );
}
