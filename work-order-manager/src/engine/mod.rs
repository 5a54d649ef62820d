//! The stage-transition engine
//!
//! The engine has no scheduling loop of its own. It is invoked per external
//! event: [`Engine::start_work_order`] when a work order should begin moving,
//! and [`Engine::advance_on_completion`] when a worker reports a result.
//! Each invocation runs in phases:
//!
//! 1. snapshot the affected rows under the store lock,
//! 2. classify the transition (pure, see [`transition`]),
//! 3. perform agent resolution and dispatch (async, lock released),
//! 4. commit every affected row in one transaction.
//!
//! The commit reserves the completion token first; a duplicate delivery
//! rolls the whole transaction back and surfaces as
//! [`AdvanceOutcome::DuplicateCompletion`]. Because dispatch happens before
//! the commit, delivery is at-least-once; the token guard is what keeps
//! state transitions exactly-once.

pub mod dispatch;
pub mod stories;
pub mod transition;

use anyhow::{anyhow, Result};
use chrono::Local;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use work_order_sdk::{
    log_dispatch_failed, log_dispatched, log_escalated, log_shipped, log_stage_complete,
    log_stage_rejected, AgentResolver, CompletionResult, Dispatcher, EngineLog, ExecutionType,
    LoopConfig, OperationStatus, StageConfig, StoryStatus, TaskKind, WorkOrderState,
    WorkflowCatalog,
};

use crate::activity::{self, kind};
use crate::config::EngineConfig;
use crate::database::{Database, UnitOfWork};
use crate::models::{Activity, Approval, Artifact, Operation, OperationStory, Receipt, WorkOrder};

use dispatch::DispatchAttempt;
use transition::Transition;

/// Options for starting a work order.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Start-time context the activation predicates are evaluated against.
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Explicit workflow override; wins over tag rules and the default.
    pub workflow_override: Option<String>,
}

/// What a completion delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The transition was applied.
    Applied,
    /// The `(operation, token)` pair was already processed; nothing changed.
    DuplicateCompletion,
}

/// Row mutations accumulated by one invocation and applied in one
/// transaction.
#[derive(Default)]
struct Writes {
    work_order: Option<WorkOrder>,
    insert_ops: Vec<Operation>,
    update_ops: Vec<Operation>,
    insert_stories: Vec<OperationStory>,
    update_stories: Vec<OperationStory>,
    purge_stories_of: Vec<Uuid>,
    activities: Vec<Activity>,
    approvals: Vec<Approval>,
    receipts: Vec<Receipt>,
    artifacts: Vec<Artifact>,
}

impl Writes {
    fn apply(self, uow: &UnitOfWork) -> Result<()> {
        for operation_id in &self.purge_stories_of {
            uow.purge_stories(*operation_id)?;
        }
        if let Some(wo) = &self.work_order {
            uow.update_work_order(wo)?;
        }
        for op in &self.update_ops {
            uow.update_operation(op)?;
        }
        for op in &self.insert_ops {
            uow.insert_operation(op)?;
        }
        uow.insert_stories(&self.insert_stories)?;
        for story in &self.update_stories {
            uow.update_story(story)?;
        }
        for activity in &self.activities {
            uow.append_activity(activity)?;
        }
        for approval in &self.approvals {
            uow.insert_approval(approval)?;
        }
        for receipt in &self.receipts {
            uow.insert_receipt(receipt)?;
        }
        for artifact in &self.artifacts {
            uow.insert_artifact(artifact)?;
        }
        Ok(())
    }
}

pub struct Engine {
    db: Arc<Mutex<Database>>,
    catalog: Arc<dyn WorkflowCatalog>,
    agents: Arc<dyn AgentResolver>,
    dispatcher: Arc<dyn Dispatcher>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        db: Arc<Mutex<Database>>,
        catalog: Arc<dyn WorkflowCatalog>,
        agents: Arc<dyn AgentResolver>,
        dispatcher: Arc<dyn Dispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            catalog,
            agents,
            dispatcher,
            config,
        }
    }

    /// Resolve a workflow, freeze the effective stage sequence, and dispatch
    /// the first stage. Fails without committing anything when the work
    /// order is not in `planned` state or the workflow cannot be resolved.
    pub async fn start_work_order(&self, work_order_id: Uuid, options: StartOptions) -> Result<()> {
        let mut wo = {
            let db = self.db.lock().await;
            db.get_work_order(work_order_id)?
                .ok_or_else(|| anyhow!("Unknown work order: {}", work_order_id))?
        };
        if wo.state != WorkOrderState::Planned {
            return Err(anyhow!(
                "Work order {} has already been started",
                work_order_id
            ));
        }

        let resolution = self
            .catalog
            .resolve(options.workflow_override.as_deref(), &wo.tags)
            .map_err(contract_err)?;
        let workflow = self
            .catalog
            .load(&resolution.workflow_id)
            .map_err(contract_err)?;

        wo.context = options.context;
        wo.effective_stages = transition::effective_stages(&workflow, &wo.context);
        wo.workflow_id = Some(resolution.workflow_id.clone());
        wo.current_stage = 0;
        wo.state = WorkOrderState::Active;

        EngineLog::WorkOrderStarted {
            work_order_id: wo.id,
            workflow_id: resolution.workflow_id.clone(),
            stages: wo.effective_stages.len(),
        }
        .emit();

        let mut writes = Writes::default();
        writes.activities.push(activity::with_payload(
            activity::for_work_order(
                kind::WORK_ORDER_STARTED,
                wo.id,
                format!(
                    "Started with workflow '{}' ({} effective stages)",
                    resolution.workflow_id,
                    wo.effective_stages.len()
                ),
            ),
            &resolution,
        ));

        // No stage activates for this context: nothing to do, ship outright
        let shipped = if wo.effective_stages.is_empty() {
            self.mark_shipped(&mut wo, &mut writes);
            true
        } else {
            let stage = wo.effective_stages[0].clone();
            let (op, attempt) = self.dispatch_stage(&wo, &stage, 0, None, None).await;
            writes.activities.push(dispatch_activity(&op, &stage, &attempt));
            writes.insert_ops.push(op);
            false
        };
        writes.work_order = Some(wo.clone());

        {
            let db = self.db.lock().await;
            db.unit_of_work(|uow| writes.apply(uow))?;
        }
        if shipped {
            self.notify_shipped(&wo).await;
        }
        Ok(())
    }

    /// Ingest a worker's completion result for an operation and apply the
    /// resulting transition. A duplicate `(operation, token)` delivery is a
    /// no-op surfaced as [`AdvanceOutcome::DuplicateCompletion`].
    pub async fn advance_on_completion(
        &self,
        operation_id: Uuid,
        result: CompletionResult,
    ) -> Result<AdvanceOutcome> {
        let (wo, op) = {
            let db = self.db.lock().await;
            let op = db
                .get_operation(operation_id)?
                .ok_or_else(|| anyhow!("Unknown operation: {}", operation_id))?;
            let wo = db
                .get_work_order(op.work_order_id)?
                .ok_or_else(|| anyhow!("Operation {} has no work order", operation_id))?;
            // Cheap duplicate check before any external calls; the token
            // insert inside the commit closes the remaining race.
            if db.has_completion_token(operation_id, &result.completion_token)? {
                return Ok(AdvanceOutcome::DuplicateCompletion);
            }
            (wo, op)
        };

        if wo.state.is_terminal() {
            return Err(anyhow!(
                "Work order {} is terminal; completion for operation {} ignored",
                wo.id,
                operation_id
            ));
        }
        if op.status != OperationStatus::InProgress {
            return Err(anyhow!(
                "Operation {} is not in progress; cannot apply completion",
                operation_id
            ));
        }

        match transition::classify(&wo, &op, &result)? {
            Transition::StageDone { approved } => {
                self.handle_stage_done(wo, op, result, approved).await
            }
            Transition::GateRejected { gated_ref } => {
                self.handle_gate_rejected(wo, op, result, gated_ref).await
            }
            Transition::Veto => self.handle_veto(wo, op, result).await,
            Transition::LoopPlanned => self.handle_loop_planned(wo, op, result).await,
            Transition::StoryBuilt { story_id } => {
                self.handle_story_built(wo, op, result, story_id).await
            }
            Transition::VerifyApproved {
                parent_operation_id,
                story_id,
            } => {
                self.handle_verify(wo, op, result, parent_operation_id, story_id, true)
                    .await
            }
            Transition::VerifyRejected {
                parent_operation_id,
                story_id,
            } => {
                self.handle_verify(wo, op, result, parent_operation_id, story_id, false)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Transition handlers
    // ------------------------------------------------------------------

    /// A sequential stage or review gate succeeded: advance or ship.
    async fn handle_stage_done(
        &self,
        mut wo: WorkOrder,
        mut op: Operation,
        result: CompletionResult,
        approved: bool,
    ) -> Result<AdvanceOutcome> {
        let stage = self.stage_of(&wo, &op)?;
        let mut writes = Writes::default();

        op.status = OperationStatus::Completed;
        self.record_outputs(&mut writes, &op, &result);
        if approved {
            writes.approvals.push(approval_row(&wo, &op, &stage.stage_ref));
        }
        let completed = activity::for_operation(
            if approved {
                kind::STAGE_APPROVED
            } else {
                kind::STAGE_COMPLETED
            },
            op.id,
            format!("Stage '{}' {}", stage.stage_ref, if approved { "approved" } else { "completed" }),
        );
        writes.activities.push(attributed(completed, &op));
        log_stage_complete!(wo.id, op.id, stage.stage_ref);
        let op_id = op.id;
        writes.update_ops.push(op);

        let shipped = self.advance_work_order(&mut wo, &mut writes).await?;
        writes.work_order = Some(wo.clone());

        let outcome = self
            .commit_for(op_id, &result.completion_token, writes)
            .await?;
        if outcome == AdvanceOutcome::Applied && shipped {
            self.notify_shipped(&wo).await;
        }
        Ok(outcome)
    }

    /// A review gate rejected the stage it gates: loop back with feedback,
    /// or escalate when the bound is exhausted.
    async fn handle_gate_rejected(
        &self,
        mut wo: WorkOrder,
        mut gate_op: Operation,
        result: CompletionResult,
        gated_ref: String,
    ) -> Result<AdvanceOutcome> {
        let gate_stage = self.stage_of(&wo, &gate_op)?;
        let mut writes = Writes::default();

        // Loopbacks are bounded across the whole run, not per gate attempt:
        // every prior rejection left a rework-marked operation at this index
        let history = {
            let db = self.db.lock().await;
            db.list_operations(wo.id)?
        };
        let prior_loopbacks = history
            .iter()
            .filter(|o| {
                o.id != gate_op.id
                    && o.workflow_stage_index == gate_op.workflow_stage_index
                    && o.status == OperationStatus::Rework
            })
            .count() as u32;

        gate_op.status = OperationStatus::Rework;
        gate_op.iteration_count = prior_loopbacks + 1;
        log_stage_rejected!(wo.id, gate_op.id, gate_stage.stage_ref, gate_op.iteration_count);
        let rejected = activity::for_operation(
            kind::STAGE_REJECTED,
            gate_op.id,
            format!(
                "Gate '{}' rejected '{}' (loopback {}): {}",
                gate_stage.stage_ref,
                gated_ref,
                gate_op.iteration_count,
                result.feedback.as_deref().unwrap_or("no feedback")
            ),
        );
        writes.activities.push(attributed(rejected, &gate_op));

        if gate_op.iteration_count > self.config.max_rework_loopbacks {
            let reason = format!(
                "Rework bound exhausted for stage '{}' after {} loopbacks",
                gated_ref, self.config.max_rework_loopbacks
            );
            gate_op.escalation_reason = Some(reason.clone());
            gate_op.escalated_at = Some(Local::now());
            wo.state = WorkOrderState::Blocked;
            wo.blocked_reason = Some(reason.clone());
            writes.activities.push(activity::for_work_order(
                kind::ESCALATED,
                wo.id,
                reason.clone(),
            ));
            log_escalated!(wo.id, gate_op.id, reason);
        } else {
            let target_index = wo.stage_index_of(&gated_ref).ok_or_else(|| {
                anyhow!(
                    "Gate '{}' reviews stage '{}' which is not in the effective sequence",
                    gate_stage.stage_ref,
                    gated_ref
                )
            })?;
            let target_stage = wo.effective_stages[target_index].clone();
            wo.current_stage = target_index;

            // A loop stage reworked from scratch gets a fresh story batch;
            // the old one is purged
            if target_stage.is_loop {
                writes.purge_stories_of = history
                    .iter()
                    .filter(|o| {
                        o.workflow_stage_index == target_index
                            && o.execution_type == ExecutionType::Loop
                    })
                    .map(|o| o.id)
                    .collect();
            }

            writes.activities.push(activity::for_work_order(
                kind::REWORK_STARTED,
                wo.id,
                format!(
                    "Looping back to stage '{}' (attempt {})",
                    gated_ref,
                    gate_op.iteration_count + 1
                ),
            ));
            let (mut new_op, attempt) = self
                .dispatch_stage(
                    &wo,
                    &target_stage,
                    target_index,
                    result.feedback.clone(),
                    Some(gate_op.id),
                )
                .await;
            // The redo operation carries which loopback it is
            new_op.iteration_count = gate_op.iteration_count;
            writes
                .activities
                .push(dispatch_activity(&new_op, &target_stage, &attempt));
            writes.insert_ops.push(new_op);
        }

        let gate_op_id = gate_op.id;
        writes.update_ops.push(gate_op);
        writes.work_order = Some(wo.clone());
        self.commit_for(gate_op_id, &result.completion_token, writes)
            .await
    }

    /// A vetoed result blocks the work order outright; no auto-dispatch.
    async fn handle_veto(
        &self,
        mut wo: WorkOrder,
        mut op: Operation,
        result: CompletionResult,
    ) -> Result<AdvanceOutcome> {
        let reason = result
            .feedback
            .clone()
            .unwrap_or_else(|| "Vetoed without feedback".to_string());

        op.status = OperationStatus::Blocked;
        op.blocked_reason = Some(reason.clone());
        wo.state = WorkOrderState::Blocked;
        wo.blocked_reason = Some(reason.clone());

        EngineLog::Blocked {
            work_order_id: wo.id,
            reason: reason.clone(),
        }
        .emit();

        let mut writes = Writes::default();
        writes.activities.push(activity::for_work_order(
            kind::VETOED,
            wo.id,
            format!("Vetoed at operation {}: {}", op.id, reason),
        ));
        let op_id = op.id;
        writes.update_ops.push(op);
        writes.work_order = Some(wo.clone());
        self.commit_for(op_id, &result.completion_token, writes).await
    }

    /// A loop stage's initiation completed: persist the story batch and
    /// dispatch the first build. An empty batch completes the stage outright.
    async fn handle_loop_planned(
        &self,
        wo: WorkOrder,
        mut op: Operation,
        result: CompletionResult,
    ) -> Result<AdvanceOutcome> {
        let mut batch =
            stories::parse_story_batch(&result.output, &op, self.config.max_story_retries)?;
        if batch.is_empty() {
            return self.handle_stage_done(wo, op, result, false).await;
        }

        let stage = self.stage_of(&wo, &op)?;
        let mut writes = Writes::default();
        self.record_outputs(&mut writes, &op, &result);

        batch[0].status = StoryStatus::Building;
        let first = batch[0].clone();
        op.current_story_id = Some(first.id);

        EngineLog::StoriesPlanned {
            work_order_id: wo.id,
            operation_id: op.id,
            count: batch.len(),
        }
        .emit();
        writes.activities.push(activity::with_payload(
            activity::for_operation(
                kind::STORIES_PLANNED,
                op.id,
                format!("Planned {} stories for stage '{}'", batch.len(), stage.stage_ref),
            ),
            &json!({ "keys": batch.iter().map(|s| s.story_key.clone()).collect::<Vec<_>>() }),
        ));
        writes.insert_stories = batch;

        self.dispatch_story(
            &wo,
            &mut op,
            &stage.stage_ref,
            TaskKind::StoryBuild,
            &first,
            None,
            &mut writes,
        )
        .await;

        let op_id = op.id;
        writes.update_ops.push(op);
        self.commit_for(op_id, &result.completion_token, writes).await
    }

    /// A story build finished: hand the story to a transient verification
    /// operation staffed by the gate's capability.
    async fn handle_story_built(
        &self,
        wo: WorkOrder,
        mut op: Operation,
        result: CompletionResult,
        story_id: Uuid,
    ) -> Result<AdvanceOutcome> {
        let mut story = {
            let db = self.db.lock().await;
            db.get_story(story_id)?
                .ok_or_else(|| anyhow!("Operation {} points at unknown story {}", op.id, story_id))?
        };
        let stage = self.stage_of(&wo, &op)?;
        let mut writes = Writes::default();
        self.record_outputs(&mut writes, &op, &result);

        story.status = StoryStatus::Verifying;
        story.output_json = Some(result.output.to_string());
        writes.activities.push(activity::for_story(
            kind::STORY_BUILD_COMPLETED,
            story.id,
            format!("Story '{}' built; sending to verification", story.story_key),
        ));

        let verifier = transition::verifier_station(&wo.effective_stages, &stage.stage_ref);
        let mut verify_op = Operation::new(
            wo.id,
            verifier,
            op.workflow_stage_index,
            ExecutionType::Sequential,
        );
        verify_op.status = OperationStatus::InProgress;
        verify_op.loop_config_json = Some(
            LoopConfig::StoryVerify {
                parent_operation_id: op.id,
                story_id: story.id,
                loop_stage_index: op.workflow_stage_index,
            }
            .to_json(),
        );

        self.dispatch_story(
            &wo,
            &mut verify_op,
            &stage.stage_ref,
            TaskKind::StoryVerify,
            &story,
            None,
            &mut writes,
        )
        .await;

        // The parent waits while its transient verification is in flight
        op.status = OperationStatus::Waiting;

        writes.update_stories.push(story);
        writes.insert_ops.push(verify_op);
        let op_id = op.id;
        writes.update_ops.push(op);
        self.commit_for(op_id, &result.completion_token, writes).await
    }

    /// A transient verification reported on its story: advance the loop,
    /// retry the build with feedback, or escalate.
    async fn handle_verify(
        &self,
        mut wo: WorkOrder,
        mut verify_op: Operation,
        result: CompletionResult,
        parent_operation_id: Uuid,
        story_id: Uuid,
        passed: bool,
    ) -> Result<AdvanceOutcome> {
        let (mut parent, mut story) = {
            let db = self.db.lock().await;
            let parent = db.get_operation(parent_operation_id)?.ok_or_else(|| {
                anyhow!("Verification references unknown operation {}", parent_operation_id)
            })?;
            let story = db
                .get_story(story_id)?
                .ok_or_else(|| anyhow!("Verification references unknown story {}", story_id))?;
            (parent, story)
        };
        let stage = self.stage_of(&wo, &parent)?;
        let mut writes = Writes::default();

        verify_op.status = OperationStatus::Completed;
        EngineLog::StoryVerified {
            work_order_id: wo.id,
            story_key: story.story_key.clone(),
            passed,
        }
        .emit();

        let mut shipped = false;
        if passed {
            story.status = StoryStatus::Done;
            writes.approvals.push(approval_row(&wo, &verify_op, &stage.stage_ref));
            let verified = activity::for_story(
                kind::STORY_VERIFIED,
                story.id,
                format!("Story '{}' verified", story.story_key),
            );
            writes.activities.push(attributed(verified, &verify_op));

            let next = {
                let db = self.db.lock().await;
                db.next_pending_story(parent.id)?
            };
            match next {
                Some(mut next_story) => {
                    next_story.status = StoryStatus::Building;
                    parent.status = OperationStatus::InProgress;
                    parent.current_story_id = Some(next_story.id);
                    self.dispatch_story(
                        &wo,
                        &mut parent,
                        &stage.stage_ref,
                        TaskKind::StoryBuild,
                        &next_story,
                        None,
                        &mut writes,
                    )
                    .await;
                    writes.update_stories.push(next_story);
                }
                None => {
                    parent.status = OperationStatus::Completed;
                    parent.current_story_id = None;
                    writes.activities.push(activity::for_operation(
                        kind::STAGE_COMPLETED,
                        parent.id,
                        format!("All stories of stage '{}' verified", stage.stage_ref),
                    ));
                    log_stage_complete!(wo.id, parent.id, stage.stage_ref);
                    shipped = self.advance_work_order(&mut wo, &mut writes).await?;
                    writes.work_order = Some(wo.clone());
                }
            }
        } else {
            story.retry_count += 1;
            let rejected = activity::for_story(
                kind::STORY_REJECTED,
                story.id,
                format!(
                    "Story '{}' rejected (attempt {}): {}",
                    story.story_key,
                    story.retry_count,
                    result.feedback.as_deref().unwrap_or("no feedback")
                ),
            );
            writes.activities.push(attributed(rejected, &verify_op));

            if story.retry_count > story.max_retries {
                let reason = format!(
                    "Story '{}' failed verification {} times",
                    story.story_key, story.retry_count
                );
                story.status = StoryStatus::Failed;
                parent.status = OperationStatus::Blocked;
                parent.escalation_reason = Some(reason.clone());
                parent.escalated_at = Some(Local::now());
                wo.state = WorkOrderState::Blocked;
                wo.blocked_reason = Some(reason.clone());
                writes.work_order = Some(wo.clone());
                writes.activities.push(activity::for_work_order(
                    kind::ESCALATED,
                    wo.id,
                    reason.clone(),
                ));
                log_escalated!(wo.id, parent.id, reason);
            } else {
                story.status = StoryStatus::Building;
                parent.status = OperationStatus::InProgress;
                parent.current_story_id = Some(story.id);
                self.dispatch_story(
                    &wo,
                    &mut parent,
                    &stage.stage_ref,
                    TaskKind::StoryBuild,
                    &story,
                    result.feedback.clone(),
                    &mut writes,
                )
                .await;
            }
        }

        writes.update_stories.push(story);
        writes.update_ops.push(parent);
        writes.update_ops.push(verify_op.clone());

        let outcome = self
            .commit_for(verify_op.id, &result.completion_token, writes)
            .await?;
        if outcome == AdvanceOutcome::Applied && shipped {
            self.notify_shipped(&wo).await;
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    fn stage_of(&self, wo: &WorkOrder, op: &Operation) -> Result<StageConfig> {
        wo.stage_at(op.workflow_stage_index).cloned().ok_or_else(|| {
            anyhow!(
                "Operation {} references stage index {} outside the effective sequence",
                op.id,
                op.workflow_stage_index
            )
        })
    }

    /// Move to the next effective stage (dispatching it), or ship when none
    /// remain. Returns true when the work order shipped; the caller sends
    /// the single completion notification after the commit succeeds.
    async fn advance_work_order(&self, wo: &mut WorkOrder, writes: &mut Writes) -> Result<bool> {
        let next = wo.current_stage + 1;
        if next >= wo.effective_stages.len() {
            self.mark_shipped(wo, writes);
            return Ok(true);
        }

        wo.current_stage = next;
        let stage = wo.effective_stages[next].clone();
        let (op, attempt) = self.dispatch_stage(wo, &stage, next, None, None).await;
        writes.activities.push(dispatch_activity(&op, &stage, &attempt));
        writes.insert_ops.push(op);
        Ok(false)
    }

    fn mark_shipped(&self, wo: &mut WorkOrder, writes: &mut Writes) {
        wo.state = WorkOrderState::Shipped;
        wo.shipped_at = Some(Local::now());
        writes.activities.push(activity::for_work_order(
            kind::WORK_ORDER_SHIPPED,
            wo.id,
            format!("Shipped: {}", wo.title),
        ));
    }

    /// Send the single "work order complete" notification. Called only
    /// after the shipping transaction committed; best-effort.
    async fn notify_shipped(&self, wo: &WorkOrder) {
        log_shipped!(wo.id);
        let message = format!("Work order complete: {} ({})", wo.title, wo.id);
        if self
            .dispatcher
            .notify(&self.config.coordinator_channel, &message)
            .await
            .is_ok()
        {
            let db = self.db.lock().await;
            let _ = db.unit_of_work(|uow| {
                uow.append_activity(&activity::for_work_order(
                    kind::NOTIFICATION_SENT,
                    wo.id,
                    format!(
                        "Completion notification sent to '{}'",
                        self.config.coordinator_channel
                    ),
                ))
            });
        }
    }

    /// Create and dispatch an operation for a whole stage. Dispatch failure
    /// yields a blocked operation, never an error.
    async fn dispatch_stage(
        &self,
        wo: &WorkOrder,
        stage: &StageConfig,
        index: usize,
        feedback: Option<String>,
        loop_target: Option<Uuid>,
    ) -> (Operation, DispatchAttempt) {
        let execution_type = if stage.is_loop {
            ExecutionType::Loop
        } else {
            ExecutionType::Sequential
        };
        let mut op = Operation::new(wo.id, stage.capability, index, execution_type);
        op.loop_target_op_id = loop_target;
        op.max_retries = self.config.max_rework_loopbacks;

        let payload = dispatch::stage_payload(wo, &op, stage, feedback);
        let attempt = dispatch::attempt(self.agents.as_ref(), self.dispatcher.as_ref(), payload).await;
        if attempt.succeeded() {
            op.status = OperationStatus::InProgress;
            if let Some(agent_id) = &attempt.agent_id {
                op.assignee_agent_ids.push(agent_id.clone());
            }
            log_dispatched!(
                wo.id,
                op.id,
                stage.stage_ref,
                attempt.agent_id.clone().unwrap_or_default()
            );
        } else {
            op.status = OperationStatus::Blocked;
            op.blocked_reason = attempt.failure.clone();
            log_dispatch_failed!(
                wo.id,
                stage.stage_ref,
                attempt.failure.clone().unwrap_or_default()
            );
        }
        (op, attempt)
    }

    /// Dispatch a story-scoped task (build or verify) under an existing
    /// operation, mutating it in place on failure.
    async fn dispatch_story(
        &self,
        wo: &WorkOrder,
        op: &mut Operation,
        stage_ref: &str,
        task_kind: TaskKind,
        story: &OperationStory,
        feedback: Option<String>,
        writes: &mut Writes,
    ) {
        let payload = dispatch::story_payload(wo, op, stage_ref, task_kind, story, feedback);
        let attempt = dispatch::attempt(self.agents.as_ref(), self.dispatcher.as_ref(), payload).await;
        if attempt.succeeded() {
            if let Some(agent_id) = &attempt.agent_id {
                if !op.assignee_agent_ids.contains(agent_id) {
                    op.assignee_agent_ids.push(agent_id.clone());
                }
            }
            log_dispatched!(
                wo.id,
                op.id,
                stage_ref,
                attempt.agent_id.clone().unwrap_or_default()
            );
            let mut a = activity::for_operation(
                kind::DISPATCHED,
                op.id,
                format!("Dispatched story '{}' ({:?})", story.story_key, task_kind),
            );
            if let Some(handle) = &attempt.handle {
                a = activity::with_payload(a, handle);
            }
            writes.activities.push(a);
        } else {
            op.status = OperationStatus::Blocked;
            op.blocked_reason = attempt.failure.clone();
            log_dispatch_failed!(
                wo.id,
                stage_ref,
                attempt.failure.clone().unwrap_or_default()
            );
            writes.activities.push(activity::for_operation(
                kind::DISPATCH_FAILED,
                op.id,
                attempt.failure.clone().unwrap_or_default(),
            ));
        }
    }

    /// Receipts and artifacts reported alongside a completion.
    fn record_outputs(&self, writes: &mut Writes, op: &Operation, result: &CompletionResult) {
        writes
            .receipts
            .extend(stories::parse_receipts(&result.output, op));
        for spec in &result.artifacts {
            writes.artifacts.push(Artifact {
                id: 0,
                work_order_id: op.work_order_id,
                operation_id: op.id,
                kind: spec.kind.clone(),
                uri: spec.uri.clone(),
                label: spec.label.clone(),
                ts: Local::now(),
            });
        }
    }

    /// Commit the invocation's writes, reserving the completion token for
    /// the operation the completion targeted.
    async fn commit_for(
        &self,
        operation_id: Uuid,
        token: &str,
        writes: Writes,
    ) -> Result<AdvanceOutcome> {
        let db = self.db.lock().await;
        db.unit_of_work(|uow| {
            if !uow.try_insert_completion_token(operation_id, token)? {
                return Ok(AdvanceOutcome::DuplicateCompletion);
            }
            writes.apply(uow)?;
            Ok(AdvanceOutcome::Applied)
        })
    }
}

fn contract_err(e: Box<dyn std::error::Error + Send + Sync>) -> anyhow::Error {
    anyhow!("{}", e)
}

/// Attribute a completion-path activity to the agent that reported the
/// result, falling back to the engine when the operation was never assigned.
fn attributed(activity: Activity, op: &Operation) -> Activity {
    match op
        .claimed_by
        .clone()
        .or_else(|| op.assignee_agent_ids.first().cloned())
    {
        Some(agent_id) => activity::by_agent(activity, agent_id),
        None => activity,
    }
}

fn approval_row(wo: &WorkOrder, op: &Operation, stage_ref: &str) -> Approval {
    Approval {
        id: 0,
        work_order_id: wo.id,
        operation_id: op.id,
        stage_ref: stage_ref.to_string(),
        approved_by: op
            .claimed_by
            .clone()
            .or_else(|| op.assignee_agent_ids.first().cloned())
            .unwrap_or_else(|| "engine".to_string()),
        ts: Local::now(),
    }
}

fn dispatch_activity(op: &Operation, stage: &StageConfig, attempt: &DispatchAttempt) -> Activity {
    if attempt.succeeded() {
        let mut a = activity::for_operation(
            kind::DISPATCHED,
            op.id,
            format!(
                "Dispatched stage '{}' to {}",
                stage.stage_ref,
                attempt.agent_id.as_deref().unwrap_or("unknown")
            ),
        );
        if let Some(handle) = &attempt.handle {
            a = activity::with_payload(a, handle);
        }
        a
    } else {
        activity::for_operation(
            kind::DISPATCH_FAILED,
            op.id,
            attempt
                .failure
                .clone()
                .unwrap_or_else(|| "Dispatch failed".to_string()),
        )
    }
}
