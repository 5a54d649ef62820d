//! Agent resolution and task delivery
//!
//! Dispatch is fire-and-forget: the engine resolves a worker, hands the
//! payload to the dispatcher, and records the outcome. Failure to resolve or
//! deliver never fails the engine invocation; the operation is persisted as
//! blocked and surfaced for external intervention.

use work_order_sdk::{
    AgentResolver, DeliveryHandle, Dispatcher, StageConfig, TaskKind, TaskPayload,
};

use crate::models::{Operation, OperationStory, WorkOrder};

/// What happened when the engine tried to hand a task to a worker.
pub struct DispatchAttempt {
    pub agent_id: Option<String>,
    pub handle: Option<DeliveryHandle>,
    pub failure: Option<String>,
}

impl DispatchAttempt {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Payload for a whole-stage task (initial dispatch or rework loopback).
pub fn stage_payload(
    work_order: &WorkOrder,
    operation: &Operation,
    stage: &StageConfig,
    feedback: Option<String>,
) -> TaskPayload {
    TaskPayload {
        work_order_id: work_order.id,
        operation_id: operation.id,
        kind: TaskKind::Stage,
        stage_ref: stage.stage_ref.clone(),
        station: stage.capability,
        context: work_order.context.clone(),
        feedback,
        story: None,
    }
}

/// Payload for a single-story build or its transient verification.
pub fn story_payload(
    work_order: &WorkOrder,
    operation: &Operation,
    stage_ref: &str,
    kind: TaskKind,
    story: &OperationStory,
    feedback: Option<String>,
) -> TaskPayload {
    TaskPayload {
        work_order_id: work_order.id,
        operation_id: operation.id,
        kind,
        stage_ref: stage_ref.to_string(),
        station: operation.station,
        context: work_order.context.clone(),
        feedback,
        story: Some(story.spec()),
    }
}

/// Resolve a worker for the payload's station and deliver the task.
/// "No worker available" and delivery errors both come back as a failure
/// reason, never as an Err.
pub async fn attempt(
    agents: &dyn AgentResolver,
    dispatcher: &dyn Dispatcher,
    payload: TaskPayload,
) -> DispatchAttempt {
    let station = payload.station;
    let agent = match agents.resolve(station).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            return DispatchAttempt {
                agent_id: None,
                handle: None,
                failure: Some(format!("No agent available for station {}", station)),
            };
        }
        Err(e) => {
            return DispatchAttempt {
                agent_id: None,
                handle: None,
                failure: Some(format!("Agent resolution failed: {}", e)),
            };
        }
    };

    match dispatcher.dispatch(&agent, payload).await {
        Ok(handle) => DispatchAttempt {
            agent_id: Some(agent.id),
            handle: Some(handle),
            failure: None,
        },
        Err(e) => {
            let failure = format!("Dispatch to {} failed: {}", agent.id, e);
            DispatchAttempt {
                agent_id: Some(agent.id),
                handle: None,
                failure: Some(failure),
            }
        }
    }
}
