//! Pure transition classification
//!
//! Given the rows an engine invocation snapshotted, decide which transition
//! applies. No I/O happens here; the engine executes whatever this returns.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use uuid::Uuid;
use work_order_sdk::{
    CompletionResult, ExecutionType, LoopConfig, ResultStatus, StageConfig, Station,
    WorkflowConfig,
};

use crate::models::{Operation, WorkOrder};

/// The transition a completion triggers.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A sequential stage (or review gate) succeeded; advance or ship.
    StageDone { approved: bool },
    /// A review gate rejected the stage it gates; loop back or escalate.
    GateRejected { gated_ref: String },
    /// Non-retryable rejection; block the work order.
    Veto,
    /// A loop stage's initiation completed; its output carries the story batch.
    LoopPlanned,
    /// A story build finished; dispatch its transient verification.
    StoryBuilt { story_id: Uuid },
    /// A transient verification approved its story.
    VerifyApproved {
        parent_operation_id: Uuid,
        story_id: Uuid,
    },
    /// A transient verification rejected its story.
    VerifyRejected {
        parent_operation_id: Uuid,
        story_id: Uuid,
    },
}

/// Classify a completion against the operation it targets.
///
/// A `vetoed` status short-circuits everything else. Transient verification
/// operations are recognized by their loop metadata; a malformed or
/// unrecognized shape means "normal stage operation".
pub fn classify(
    work_order: &WorkOrder,
    operation: &Operation,
    result: &CompletionResult,
) -> Result<Transition> {
    if result.status == ResultStatus::Vetoed {
        return Ok(Transition::Veto);
    }

    if let Some(LoopConfig::StoryVerify {
        parent_operation_id,
        story_id,
        ..
    }) = LoopConfig::parse(operation.loop_config_json.as_deref())
    {
        return match result.status {
            ResultStatus::Approved | ResultStatus::Completed => Ok(Transition::VerifyApproved {
                parent_operation_id,
                story_id,
            }),
            ResultStatus::Rejected => Ok(Transition::VerifyRejected {
                parent_operation_id,
                story_id,
            }),
            ResultStatus::Vetoed => unreachable!("vetoed handled above"),
        };
    }

    if operation.execution_type == ExecutionType::Loop {
        return match operation.current_story_id {
            None => Ok(Transition::LoopPlanned),
            Some(story_id) => Ok(Transition::StoryBuilt { story_id }),
        };
    }

    let stage = work_order
        .stage_at(operation.workflow_stage_index)
        .ok_or_else(|| {
            anyhow!(
                "Operation {} references stage index {} outside the effective sequence",
                operation.id,
                operation.workflow_stage_index
            )
        })?;

    if stage.is_review_gate() {
        let gated_ref = stage
            .review_gate_for
            .clone()
            .unwrap_or_default();
        return match result.status {
            ResultStatus::Approved | ResultStatus::Completed => {
                Ok(Transition::StageDone { approved: true })
            }
            ResultStatus::Rejected => Ok(Transition::GateRejected { gated_ref }),
            ResultStatus::Vetoed => unreachable!("vetoed handled above"),
        };
    }

    // Plain sequential stage: rejected without a gate is still a veto-free
    // failure signal, treated as a rejection of the stage by itself. There is
    // no gate to loop back from, so it blocks the work order.
    match result.status {
        ResultStatus::Completed | ResultStatus::Approved => {
            Ok(Transition::StageDone { approved: false })
        }
        ResultStatus::Rejected => Ok(Transition::Veto),
        ResultStatus::Vetoed => unreachable!("vetoed handled above"),
    }
}

/// Evaluate every activation predicate once against the start-time context,
/// producing the frozen effective stage sequence. Inactive stages never
/// materialize; a review gate whose gated stage is inactive is dropped too.
pub fn effective_stages(workflow: &WorkflowConfig, context: &Map<String, Value>) -> Vec<StageConfig> {
    let mut effective: Vec<StageConfig> = Vec::new();
    for stage in &workflow.stages {
        let active = stage
            .activation
            .as_ref()
            .map(|predicate| predicate.is_active(context))
            .unwrap_or(true);
        if !active {
            continue;
        }
        if let Some(target) = &stage.review_gate_for {
            if !effective.iter().any(|s| &s.stage_ref == target) {
                continue;
            }
        }
        effective.push(stage.clone());
    }
    effective
}

/// The capability that verifies stories of a loop stage: the capability of
/// the review gate covering that stage, falling back to Review when the
/// effective sequence has no gate for it.
pub fn verifier_station(effective: &[StageConfig], loop_stage_ref: &str) -> Station {
    effective
        .iter()
        .find(|stage| stage.review_gate_for.as_deref() == Some(loop_stage_ref))
        .map(|stage| stage.capability)
        .unwrap_or(Station::Review)
}
