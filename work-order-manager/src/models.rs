//! Persisted entities for the work-order stage engine
//!
//! Rows are created and mutated only through [`crate::database`]; the engine
//! never deletes operations or activities. Status enums live in the SDK so
//! external collaborators share them.

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use uuid::Uuid;
use work_order_sdk::{
    ExecutionType, OperationStatus, StageConfig, Station, StorySpec, StoryStatus, WorkOrderState,
};

/// The overall unit of work driven through a pipeline.
///
/// `state`, `current_stage`, `blocked_reason`, and `shipped_at` are mutated
/// only by the engine. `effective_stages` is the stage list frozen at start
/// time; `current_stage` indexes into it.
#[derive(Debug, Clone)]
pub struct WorkOrder {
    pub id: Uuid,
    pub title: String,
    pub goal: String,
    pub state: WorkOrderState,
    pub workflow_id: Option<String>,
    pub current_stage: usize,
    pub priority: i64,
    pub tags: Vec<String>,
    pub blocked_reason: Option<String>,
    pub shipped_at: Option<DateTime<Local>>,
    /// Start-time context, frozen when the work order starts.
    pub context: Map<String, Value>,
    /// Effective stage sequence for this run; empty until started.
    pub effective_stages: Vec<StageConfig>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl WorkOrder {
    pub fn new(title: impl Into<String>, goal: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            goal: goal.into(),
            state: WorkOrderState::Planned,
            workflow_id: None,
            current_stage: 0,
            priority: 0,
            tags: Vec::new(),
            blocked_reason: None,
            shipped_at: None,
            context: Map::new(),
            effective_stages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Stage descriptor at an effective index, if in range.
    pub fn stage_at(&self, index: usize) -> Option<&StageConfig> {
        self.effective_stages.get(index)
    }

    /// Effective index of a stage ref, used to resolve rework loopbacks.
    pub fn stage_index_of(&self, stage_ref: &str) -> Option<usize> {
        self.effective_stages
            .iter()
            .position(|s| s.stage_ref == stage_ref)
    }
}

/// One execution attempt of a stage (or loop iteration / story verification).
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: Uuid,
    pub work_order_id: Uuid,
    pub station: Station,
    pub workflow_stage_index: usize,
    pub status: OperationStatus,
    pub execution_type: ExecutionType,
    /// Rework loopback counter for the stage this operation belongs to.
    pub iteration_count: u32,
    /// Back-reference to the rejecting gate operation on a loopback.
    pub loop_target_op_id: Option<Uuid>,
    /// Opaque tagged metadata; see `work_order_sdk::LoopConfig`.
    pub loop_config_json: Option<String>,
    pub current_story_id: Option<Uuid>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_count: u32,
    pub assignee_agent_ids: Vec<String>,
    pub blocked_reason: Option<String>,
    pub escalation_reason: Option<String>,
    pub escalated_at: Option<DateTime<Local>>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Local>>,
    pub last_claimed_at: Option<DateTime<Local>>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl Operation {
    pub fn new(
        work_order_id: Uuid,
        station: Station,
        workflow_stage_index: usize,
        execution_type: ExecutionType,
    ) -> Self {
        let now = Local::now();
        Self {
            id: Uuid::new_v4(),
            work_order_id,
            station,
            workflow_stage_index,
            status: OperationStatus::Pending,
            execution_type,
            iteration_count: 0,
            loop_target_op_id: None,
            loop_config_json: None,
            current_story_id: None,
            retry_count: 0,
            max_retries: 0,
            timeout_count: 0,
            assignee_agent_ids: Vec::new(),
            blocked_reason: None,
            escalation_reason: None,
            escalated_at: None,
            claimed_by: None,
            claim_expires_at: None,
            last_claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One decomposed unit of a loop stage.
#[derive(Debug, Clone)]
pub struct OperationStory {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub work_order_id: Uuid,
    pub story_index: usize,
    pub story_key: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: String,
    pub status: StoryStatus,
    pub output_json: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl OperationStory {
    /// The worker-facing view of this story, carried in task payloads.
    pub fn spec(&self) -> StorySpec {
        StorySpec {
            key: self.story_key.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            acceptance_criteria: self.acceptance_criteria.clone(),
        }
    }
}

/// Who performed the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Engine,
    Agent,
    Human,
}

/// Append-only audit record. Never mutated after insert.
#[derive(Debug, Clone)]
pub struct Activity {
    /// SQLite rowid; 0 until inserted.
    pub id: i64,
    pub ts: DateTime<Local>,
    pub kind: String,
    pub actor: String,
    pub actor_type: ActorType,
    pub actor_agent_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub summary: String,
    pub payload_json: Option<String>,
}

/// Durable approval record written when a review gate (or story
/// verification) approves work.
#[derive(Debug, Clone)]
pub struct Approval {
    pub id: i64,
    pub work_order_id: Uuid,
    pub operation_id: Uuid,
    pub stage_ref: String,
    pub approved_by: String,
    pub ts: DateTime<Local>,
}

/// Command-execution receipt reported in a completion's output.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub id: i64,
    pub work_order_id: Uuid,
    pub operation_id: Uuid,
    pub command: String,
    pub exit_code: Option<i64>,
    pub summary: Option<String>,
    pub ts: DateTime<Local>,
}

/// Produced artifact reference owned by the work order.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: i64,
    pub work_order_id: Uuid,
    pub operation_id: Uuid,
    pub kind: String,
    pub uri: String,
    pub label: Option<String>,
    pub ts: DateTime<Local>,
}
