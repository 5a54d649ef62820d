//! Audit-record construction
//!
//! Every meaningful transition appends one or more [`Activity`] rows. This
//! module centralizes the kind names and the builders so the engine reads as
//! transition logic, not row plumbing.

use chrono::Local;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{Activity, ActorType};

/// Activity kind names, as persisted in the `kind` column.
pub mod kind {
    pub const WORK_ORDER_STARTED: &str = "work_order_started";
    pub const DISPATCHED: &str = "dispatched";
    pub const DISPATCH_FAILED: &str = "dispatch_failed";
    pub const STAGE_COMPLETED: &str = "stage_completed";
    pub const STAGE_APPROVED: &str = "stage_approved";
    pub const STAGE_REJECTED: &str = "stage_rejected";
    pub const REWORK_STARTED: &str = "rework_started";
    pub const VETOED: &str = "vetoed";
    pub const ESCALATED: &str = "escalated";
    pub const STORIES_PLANNED: &str = "stories_planned";
    pub const STORY_BUILD_COMPLETED: &str = "story_build_completed";
    pub const STORY_VERIFIED: &str = "story_verified";
    pub const STORY_REJECTED: &str = "story_rejected";
    pub const WORK_ORDER_SHIPPED: &str = "work_order_shipped";
    pub const NOTIFICATION_SENT: &str = "notification_sent";
}

/// Entity type names for the `entity_type` column.
pub mod entity {
    pub const WORK_ORDER: &str = "work_order";
    pub const OPERATION: &str = "operation";
    pub const STORY: &str = "story";
}

/// An engine-authored activity for a work order entity.
pub fn for_work_order(kind: &str, work_order_id: Uuid, summary: impl Into<String>) -> Activity {
    engine_activity(kind, entity::WORK_ORDER, work_order_id, summary)
}

/// An engine-authored activity for an operation entity.
pub fn for_operation(kind: &str, operation_id: Uuid, summary: impl Into<String>) -> Activity {
    engine_activity(kind, entity::OPERATION, operation_id, summary)
}

/// An engine-authored activity for a story entity.
pub fn for_story(kind: &str, story_id: Uuid, summary: impl Into<String>) -> Activity {
    engine_activity(kind, entity::STORY, story_id, summary)
}

fn engine_activity(
    kind: &str,
    entity_type: &str,
    entity_id: Uuid,
    summary: impl Into<String>,
) -> Activity {
    Activity {
        id: 0,
        ts: Local::now(),
        kind: kind.to_string(),
        actor: "engine".to_string(),
        actor_type: ActorType::Engine,
        actor_agent_id: None,
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        summary: summary.into(),
        payload_json: None,
    }
}

/// Attach a serializable payload to an activity.
pub fn with_payload<T: Serialize>(mut activity: Activity, payload: &T) -> Activity {
    activity.payload_json = serde_json::to_string(payload).ok();
    activity
}

/// Attribute an activity to the agent that triggered it.
pub fn by_agent(mut activity: Activity, agent_id: impl Into<String>) -> Activity {
    let agent_id = agent_id.into();
    activity.actor = agent_id.clone();
    activity.actor_type = ActorType::Agent;
    activity.actor_agent_id = Some(agent_id);
    activity
}
