// Re-export async trait for convenience
pub use async_trait::async_trait;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Capability domains a stage can be bound to. Agent resolution matches
/// workers against these tags rather than any open-ended lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Station {
    Planning,
    Build,
    Review,
    Security,
    Testing,
    Coordination,
}

impl Station {
    pub fn as_str(&self) -> &'static str {
        match self {
            Station::Planning => "planning",
            Station::Build => "build",
            Station::Review => "review",
            Station::Security => "security",
            Station::Testing => "testing",
            Station::Coordination => "coordination",
        }
    }
}

impl std::fmt::Display for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work order lifecycle states. Shipped, Blocked, and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderState {
    Planned,
    Active,
    Blocked,
    Cancelled,
    Shipped,
}

impl WorkOrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkOrderState::Shipped | WorkOrderState::Blocked | WorkOrderState::Cancelled
        )
    }
}

/// Operation status. At most one operation per work order may be InProgress;
/// Waiting marks a loop parent whose transient verify operation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Waiting,
    Completed,
    Rework,
    Blocked,
    Cancelled,
}

/// How a stage executes: one sequential attempt, or decomposed into stories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Sequential,
    Loop,
}

/// Per-story lifecycle within a loop stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Building,
    Verifying,
    Done,
    Failed,
}

/// Outcome a worker reports for a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Approved,
    Rejected,
    Vetoed,
    Completed,
}

/// A produced artifact reference carried in a completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub kind: String,
    pub uri: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// A completion result delivered by a worker for one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub status: ResultStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    /// Caller-supplied idempotency token; a duplicate (operation, token)
    /// pair is rejected before any state is mutated.
    pub completion_token: String,
}

impl CompletionResult {
    pub fn new(status: ResultStatus, token: impl Into<String>) -> Self {
        Self {
            status,
            output: Value::Null,
            feedback: None,
            artifacts: Vec::new(),
            completion_token: token.into(),
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }
}

/// One decomposed unit of a loop stage, as specified by the planning worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorySpec {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
}

/// A concrete worker identity returned by agent resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    pub station: Station,
}

/// What kind of task a dispatch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Stage,
    StoryBuild,
    StoryVerify,
}

/// The payload delivered to a worker's execution channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub work_order_id: Uuid,
    pub operation_id: Uuid,
    pub kind: TaskKind,
    pub stage_ref: String,
    pub station: Station,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Reviewer feedback carried into a rework or story-retry dispatch.
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub story: Option<StorySpec>,
}

/// Handle returned by the dispatcher for one delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryHandle {
    pub id: Uuid,
    pub channel: String,
}

impl DeliveryHandle {
    pub fn new(id: Uuid, channel: String) -> Self {
        Self { id, channel }
    }
}

/// Why the catalog picked a workflow for a work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    ExplicitOverride,
    RuleMatch,
    Default,
}

/// Result of workflow resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResolution {
    pub workflow_id: String,
    pub reason: ResolutionReason,
    #[serde(default)]
    pub matched_rule_id: Option<String>,
}

/// Activation predicate evaluated once against the start-time context.
/// The stage is active iff at least one listed context key is truthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationPredicate {
    pub any_of: Vec<String>,
}

impl ActivationPredicate {
    pub fn is_active(&self, context: &Map<String, Value>) -> bool {
        self.any_of
            .iter()
            .any(|key| context.get(key).map(is_truthy).unwrap_or(false))
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// One stage descriptor in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(rename = "ref")]
    pub stage_ref: String,
    pub capability: Station,
    /// If set, this stage is a review gate for the named preceding stage.
    #[serde(default)]
    pub review_gate_for: Option<String>,
    /// Loop stages decompose into independently built and verified stories.
    #[serde(default)]
    pub is_loop: bool,
    #[serde(default)]
    pub activation: Option<ActivationPredicate>,
}

impl StageConfig {
    pub fn is_review_gate(&self) -> bool {
        self.review_gate_for.is_some()
    }
}

/// An ordered stage pipeline, immutable once loaded for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,
    pub name: String,
    pub stages: Vec<StageConfig>,
}

/// Opaque discriminated metadata stored on an operation's loop_config_json
/// column. Only recognized, well-formed shapes parse; anything else is
/// treated as a normal stage operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum LoopConfig {
    StoryVerify {
        parent_operation_id: Uuid,
        story_id: Uuid,
        loop_stage_index: usize,
    },
}

impl LoopConfig {
    /// Strict parse: malformed or unrecognized shapes yield None, never an
    /// error. Callers treat "not story_verify" and "not parseable" the same.
    pub fn parse(raw: Option<&str>) -> Option<LoopConfig> {
        raw.and_then(|s| serde_json::from_str(s).ok())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Result type for contract operations
pub type ContractResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Workflow catalog: resolves which workflow applies to a work order and
/// loads stage definitions. Backed by configuration, so the contract is
/// synchronous.
pub trait WorkflowCatalog: Send + Sync {
    /// Resolve a workflow id: explicit override wins, else tag-rule match,
    /// else the catalog default.
    fn resolve(
        &self,
        requested: Option<&str>,
        tags: &[String],
    ) -> ContractResult<WorkflowResolution>;

    /// Load a workflow's ordered stage list. Unknown id is an error.
    fn load(&self, workflow_id: &str) -> ContractResult<WorkflowConfig>;
}

/// Resolves a stage capability to a concrete worker. "No worker available"
/// is a normal, representable outcome, not an error path.
#[async_trait]
pub trait AgentResolver: Send + Sync {
    async fn resolve(&self, station: Station) -> ContractResult<Option<AgentIdentity>>;
}

/// Delivers task payloads to worker execution channels and plain messages
/// to the coordinator channel. Best-effort, at-least-once from the
/// engine's point of view.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        agent: &AgentIdentity,
        payload: TaskPayload,
    ) -> ContractResult<DeliveryHandle>;

    async fn notify(&self, channel: &str, message: &str) -> ContractResult<()>;
}

/// Structured engine events emitted to stderr for dashboards to tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineLog {
    /// Work order started and first stage dispatched
    WorkOrderStarted {
        work_order_id: Uuid,
        workflow_id: String,
        stages: usize,
    },
    /// A stage task was dispatched to an agent
    Dispatched {
        work_order_id: Uuid,
        operation_id: Uuid,
        stage_ref: String,
        agent_id: String,
    },
    /// Dispatch failed: no agent resolved for the capability
    DispatchFailed {
        work_order_id: Uuid,
        stage_ref: String,
        reason: String,
    },
    /// A stage completed or was approved
    StageCompleted {
        work_order_id: Uuid,
        operation_id: Uuid,
        stage_ref: String,
    },
    /// A review gate rejected the gated stage
    StageRejected {
        work_order_id: Uuid,
        operation_id: Uuid,
        stage_ref: String,
        iteration: u32,
    },
    /// A story batch was planned for a loop stage
    StoriesPlanned {
        work_order_id: Uuid,
        operation_id: Uuid,
        count: usize,
    },
    /// A story passed or failed verification
    StoryVerified {
        work_order_id: Uuid,
        story_key: String,
        passed: bool,
    },
    /// Retry budget exhausted, surfaced for external intervention
    Escalated {
        work_order_id: Uuid,
        operation_id: Uuid,
        reason: String,
    },
    /// Work order reached a terminal blocked state
    Blocked {
        work_order_id: Uuid,
        reason: String,
    },
    /// Work order shipped
    Shipped { work_order_id: Uuid },
}

impl EngineLog {
    /// Emit this event to stderr for external tailing
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            use std::io::Write;
            eprintln!("__WO_EVENT__:{}", json);
            // Force flush stderr in async/concurrent contexts
            let _ = std::io::stderr().flush();
        }
    }
}

/// Helper macros for engine event logging
#[macro_export]
macro_rules! log_dispatched {
    ($wo:expr, $op:expr, $stage:expr, $agent:expr) => {
        $crate::EngineLog::Dispatched {
            work_order_id: $wo,
            operation_id: $op,
            stage_ref: $stage.to_string(),
            agent_id: $agent.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_dispatch_failed {
    ($wo:expr, $stage:expr, $reason:expr) => {
        $crate::EngineLog::DispatchFailed {
            work_order_id: $wo,
            stage_ref: $stage.to_string(),
            reason: $reason.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_stage_complete {
    ($wo:expr, $op:expr, $stage:expr) => {
        $crate::EngineLog::StageCompleted {
            work_order_id: $wo,
            operation_id: $op,
            stage_ref: $stage.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_stage_rejected {
    ($wo:expr, $op:expr, $stage:expr, $iter:expr) => {
        $crate::EngineLog::StageRejected {
            work_order_id: $wo,
            operation_id: $op,
            stage_ref: $stage.to_string(),
            iteration: $iter,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_escalated {
    ($wo:expr, $op:expr, $reason:expr) => {
        $crate::EngineLog::Escalated {
            work_order_id: $wo,
            operation_id: $op,
            reason: $reason.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_shipped {
    ($wo:expr) => {
        $crate::EngineLog::Shipped { work_order_id: $wo }.emit();
    };
}
