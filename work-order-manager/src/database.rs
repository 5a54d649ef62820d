//! SQLite store for work orders, operations, stories, and the audit trail
//!
//! The engine consumes this module as its durable-store contract: plain reads
//! on [`Database`], and all mutations of one engine invocation batched
//! through [`Database::unit_of_work`] so a transition commits all-or-nothing.
//! The completion-token uniqueness constraint lives here too; inserting the
//! token inside the same transaction as the transition is the whole
//! idempotency mechanism.
//!
//! # Database Schema
//!
//! 1. **work_orders** - work order state, frozen context and effective stages
//! 2. **operations** - one row per stage attempt (never deleted)
//! 3. **operation_stories** - decomposed loop-stage stories
//! 4. **activities** - append-only audit records
//! 5. **approvals / receipts / artifacts** - side records owned by the work order
//! 6. **completion_tokens** - `(operation_id, token)` uniqueness for idempotency
//! 7. **schema_version** - migrations
//!
//! WAL mode is enabled by default for better concurrent access.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Local};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::PathBuf;
use uuid::Uuid;
use work_order_sdk::{ExecutionType, OperationStatus, Station, StoryStatus, WorkOrderState};

use crate::models::{
    Activity, ActorType, Approval, Artifact, Operation, OperationStory, Receipt, WorkOrder,
};

/// Database wrapper for work-order persistence
pub struct Database {
    conn: Connection,
}

/// Per-workflow work order counts
#[derive(Debug, Clone)]
pub struct WorkflowStats {
    pub total: usize,
    pub shipped: usize,
    pub blocked: usize,
    pub active: usize,
}

impl Database {
    /// Create a new database connection at the specified path
    pub fn new(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent access
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // Enable foreign key constraints
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self { conn })
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Initialize database schema with all tables and indexes
    pub fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS work_orders (
                id TEXT PRIMARY KEY,

                title TEXT NOT NULL,
                goal TEXT NOT NULL,

                -- Lifecycle (mutated only by the engine)
                state TEXT NOT NULL,
                workflow_id TEXT,
                current_stage INTEGER NOT NULL DEFAULT 0,
                blocked_reason TEXT,
                shipped_at TEXT,

                priority INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',

                -- Frozen at StartWorkOrder
                context_json TEXT NOT NULL DEFAULT '{}',
                effective_stages_json TEXT NOT NULL DEFAULT '[]',

                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_work_orders_state ON work_orders(state);
            CREATE INDEX IF NOT EXISTS idx_work_orders_workflow ON work_orders(workflow_id);
            "#,
        )?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                work_order_id TEXT NOT NULL,

                station TEXT NOT NULL,
                workflow_stage_index INTEGER NOT NULL,
                status TEXT NOT NULL,
                execution_type TEXT NOT NULL,

                -- Rework / loop bookkeeping
                iteration_count INTEGER NOT NULL DEFAULT 0,
                loop_target_op_id TEXT,
                loop_config_json TEXT,
                current_story_id TEXT,

                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                timeout_count INTEGER NOT NULL DEFAULT 0,
                assignee_agent_ids TEXT NOT NULL DEFAULT '[]',

                blocked_reason TEXT,
                escalation_reason TEXT,
                escalated_at TEXT,

                -- Lease fields for out-of-process claims
                claimed_by TEXT,
                claim_expires_at TEXT,
                last_claimed_at TEXT,

                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,

                FOREIGN KEY(work_order_id) REFERENCES work_orders(id)
            );

            CREATE INDEX IF NOT EXISTS idx_operations_work_order ON operations(work_order_id);
            CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(work_order_id, status);
            "#,
        )?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS operation_stories (
                id TEXT PRIMARY KEY,
                operation_id TEXT NOT NULL,
                work_order_id TEXT NOT NULL,

                story_index INTEGER NOT NULL,
                story_key TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                acceptance_criteria TEXT NOT NULL DEFAULT '',

                status TEXT NOT NULL,
                output_json TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,

                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,

                FOREIGN KEY(operation_id) REFERENCES operations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_stories_operation
            ON operation_stories(operation_id, story_index);
            "#,
        )?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS activities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                kind TEXT NOT NULL,
                actor TEXT NOT NULL,
                actor_type TEXT NOT NULL,
                actor_agent_id TEXT,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                payload_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_activities_entity ON activities(entity_id);
            CREATE INDEX IF NOT EXISTS idx_activities_kind ON activities(kind);
            "#,
        )?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS approvals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_order_id TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                stage_ref TEXT NOT NULL,
                approved_by TEXT NOT NULL,
                ts TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_approvals_work_order ON approvals(work_order_id);

            CREATE TABLE IF NOT EXISTS receipts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_order_id TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                command TEXT NOT NULL,
                exit_code INTEGER,
                summary TEXT,
                ts TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_receipts_work_order ON receipts(work_order_id);

            CREATE TABLE IF NOT EXISTS artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_order_id TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                uri TEXT NOT NULL,
                label TEXT,
                ts TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_artifacts_work_order ON artifacts(work_order_id);
            "#,
        )?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS completion_tokens (
                operation_id TEXT NOT NULL,
                token TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(operation_id, token)
            );
            "#,
        )?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
            [],
        )?;

        Ok(())
    }

    /// Get current schema version
    pub fn get_schema_version(&self) -> Result<i32> {
        let version: i32 =
            self.conn
                .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                    row.get(0)
                })?;
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Work orders
    // ------------------------------------------------------------------

    /// Insert a newly created work order
    pub fn insert_work_order(&self, wo: &WorkOrder) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO work_orders (
                id, title, goal, state, workflow_id, current_stage, blocked_reason,
                shipped_at, priority, tags, context_json, effective_stages_json,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                wo.id.to_string(),
                wo.title,
                wo.goal,
                work_order_state_str(wo.state),
                wo.workflow_id,
                wo.current_stage,
                wo.blocked_reason,
                wo.shipped_at.map(|dt| dt.to_rfc3339()),
                wo.priority,
                serde_json::to_string(&wo.tags)?,
                serde_json::to_string(&wo.context)?,
                serde_json::to_string(&wo.effective_stages)?,
                wo.created_at.to_rfc3339(),
                wo.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a work order by id
    pub fn get_work_order(&self, id: Uuid) -> Result<Option<WorkOrder>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {} FROM work_orders WHERE id = ?1", WORK_ORDER_COLS),
                params![id.to_string()],
                map_work_order_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Per-workflow shipped/blocked/active counts
    pub fn get_workflow_stats(&self, workflow_id: &str) -> Result<WorkflowStats> {
        let stats = self.conn.query_row(
            r#"
            SELECT
                COUNT(*) as total,
                SUM(CASE WHEN state = 'shipped' THEN 1 ELSE 0 END) as shipped,
                SUM(CASE WHEN state = 'blocked' THEN 1 ELSE 0 END) as blocked,
                SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END) as active
            FROM work_orders
            WHERE workflow_id = ?1
            "#,
            params![workflow_id],
            |row| {
                Ok(WorkflowStats {
                    total: row.get(0)?,
                    shipped: row.get::<_, Option<usize>>(1)?.unwrap_or(0),
                    blocked: row.get::<_, Option<usize>>(2)?.unwrap_or(0),
                    active: row.get::<_, Option<usize>>(3)?.unwrap_or(0),
                })
            },
        )?;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Get an operation by id
    pub fn get_operation(&self, id: Uuid) -> Result<Option<Operation>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {} FROM operations WHERE id = ?1", OPERATION_COLS),
                params![id.to_string()],
                map_operation_row,
            )
            .optional()?;
        Ok(result)
    }

    /// All operations for a work order, oldest first
    pub fn list_operations(&self, work_order_id: Uuid) -> Result<Vec<Operation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM operations WHERE work_order_id = ?1 ORDER BY created_at ASC, id ASC",
            OPERATION_COLS
        ))?;
        let ops = stmt
            .query_map(params![work_order_id.to_string()], map_operation_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    /// Count of in_progress operations for a work order (the WIP=1 gate)
    pub fn in_progress_count(&self, work_order_id: Uuid) -> Result<usize> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE work_order_id = ?1 AND status = 'in_progress'",
            params![work_order_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Record an out-of-process worker claiming a dispatched operation with
    /// a time-bounded lease
    pub fn claim_operation(&self, operation_id: Uuid, agent_id: &str, ttl_secs: i64) -> Result<()> {
        let now = Local::now();
        let expires = now + Duration::seconds(ttl_secs);
        let updated = self.conn.execute(
            r#"
            UPDATE operations
            SET claimed_by = ?1, claim_expires_at = ?2, last_claimed_at = ?3, updated_at = ?3
            WHERE id = ?4 AND status = 'in_progress'
            "#,
            params![
                agent_id,
                expires.to_rfc3339(),
                now.to_rfc3339(),
                operation_id.to_string()
            ],
        )?;
        if updated == 0 {
            return Err(anyhow!(
                "Operation {} is not in progress; cannot claim",
                operation_id
            ));
        }
        Ok(())
    }

    /// Release a claim without completing the operation
    pub fn release_claim(&self, operation_id: Uuid) -> Result<()> {
        self.conn.execute(
            "UPDATE operations SET claimed_by = NULL, claim_expires_at = NULL WHERE id = ?1",
            params![operation_id.to_string()],
        )?;
        Ok(())
    }

    /// In-progress operations whose lease expired before `now`, for an
    /// external reaper to re-dispatch. The engine never time-checks inline.
    pub fn expired_claims(&self, now: DateTime<Local>) -> Result<Vec<Operation>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM operations
            WHERE status = 'in_progress'
              AND claim_expires_at IS NOT NULL
              AND claim_expires_at < ?1
            "#,
            OPERATION_COLS
        ))?;
        let ops = stmt
            .query_map(params![now.to_rfc3339()], map_operation_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    // ------------------------------------------------------------------
    // Stories
    // ------------------------------------------------------------------

    /// Get a story by id
    pub fn get_story(&self, id: Uuid) -> Result<Option<OperationStory>> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM operation_stories WHERE id = ?1",
                    STORY_COLS
                ),
                params![id.to_string()],
                map_story_row,
            )
            .optional()?;
        Ok(result)
    }

    /// All stories for a loop operation, in story_index order
    pub fn list_stories(&self, operation_id: Uuid) -> Result<Vec<OperationStory>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM operation_stories WHERE operation_id = ?1 ORDER BY story_index ASC",
            STORY_COLS
        ))?;
        let stories = stmt
            .query_map(params![operation_id.to_string()], map_story_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stories)
    }

    /// The next pending story of a loop operation, if any
    pub fn next_pending_story(&self, operation_id: Uuid) -> Result<Option<OperationStory>> {
        let result = self
            .conn
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM operation_stories
                    WHERE operation_id = ?1 AND status = 'pending'
                    ORDER BY story_index ASC
                    LIMIT 1
                    "#,
                    STORY_COLS
                ),
                params![operation_id.to_string()],
                map_story_row,
            )
            .optional()?;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Audit trail and side records
    // ------------------------------------------------------------------

    /// Activities for one entity, oldest first
    pub fn list_activities_for_entity(&self, entity_id: &str) -> Result<Vec<Activity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM activities WHERE entity_id = ?1 ORDER BY id ASC",
            ACTIVITY_COLS
        ))?;
        let activities = stmt
            .query_map(params![entity_id], map_activity_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(activities)
    }

    /// Count of activities of one kind across the store
    pub fn count_activities_of_kind(&self, kind: &str) -> Result<usize> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM activities WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Approvals recorded for a work order
    pub fn list_approvals(&self, work_order_id: Uuid) -> Result<Vec<Approval>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, work_order_id, operation_id, stage_ref, approved_by, ts
            FROM approvals WHERE work_order_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let approvals = stmt
            .query_map(params![work_order_id.to_string()], map_approval_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(approvals)
    }

    /// Receipts recorded for a work order
    pub fn list_receipts(&self, work_order_id: Uuid) -> Result<Vec<Receipt>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, work_order_id, operation_id, command, exit_code, summary, ts
            FROM receipts WHERE work_order_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let receipts = stmt
            .query_map(params![work_order_id.to_string()], map_receipt_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(receipts)
    }

    /// Artifacts recorded for a work order
    pub fn list_artifacts(&self, work_order_id: Uuid) -> Result<Vec<Artifact>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, work_order_id, operation_id, kind, uri, label, ts
            FROM artifacts WHERE work_order_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let artifacts = stmt
            .query_map(params![work_order_id.to_string()], map_artifact_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    /// Whether a completion token was already recorded for an operation
    pub fn has_completion_token(&self, operation_id: Uuid, token: &str) -> Result<bool> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM completion_tokens WHERE operation_id = ?1 AND token = ?2",
            params![operation_id.to_string(), token],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Unit of work
    // ------------------------------------------------------------------

    /// Run all mutations of one engine invocation in a single transaction.
    /// The closure either commits everything or nothing.
    pub fn unit_of_work<T>(&self, f: impl FnOnce(&UnitOfWork) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let uow = UnitOfWork { tx };
        let value = f(&uow)?;
        uow.tx.commit()?;
        Ok(value)
    }
}

/// Write handle passed to [`Database::unit_of_work`] closures. All writes of
/// one transition go through one of these.
pub struct UnitOfWork<'a> {
    tx: Transaction<'a>,
}

impl UnitOfWork<'_> {
    /// Reserve the completion token for an operation. Returns false when the
    /// `(operation_id, token)` pair already exists: the duplicate-delivery
    /// case, which must roll the whole transaction back.
    pub fn try_insert_completion_token(&self, operation_id: Uuid, token: &str) -> Result<bool> {
        let inserted = self.tx.execute(
            "INSERT OR IGNORE INTO completion_tokens (operation_id, token, created_at) \
             VALUES (?1, ?2, ?3)",
            params![
                operation_id.to_string(),
                token,
                Local::now().to_rfc3339()
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Persist engine-owned work order fields
    pub fn update_work_order(&self, wo: &WorkOrder) -> Result<()> {
        self.tx.execute(
            r#"
            UPDATE work_orders
            SET state = ?1, workflow_id = ?2, current_stage = ?3, blocked_reason = ?4,
                shipped_at = ?5, context_json = ?6, effective_stages_json = ?7, updated_at = ?8
            WHERE id = ?9
            "#,
            params![
                work_order_state_str(wo.state),
                wo.workflow_id,
                wo.current_stage,
                wo.blocked_reason,
                wo.shipped_at.map(|dt| dt.to_rfc3339()),
                serde_json::to_string(&wo.context)?,
                serde_json::to_string(&wo.effective_stages)?,
                Local::now().to_rfc3339(),
                wo.id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Insert a freshly created operation
    pub fn insert_operation(&self, op: &Operation) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO operations (
                id, work_order_id, station, workflow_stage_index, status, execution_type,
                iteration_count, loop_target_op_id, loop_config_json, current_story_id,
                retry_count, max_retries, timeout_count, assignee_agent_ids,
                blocked_reason, escalation_reason, escalated_at,
                claimed_by, claim_expires_at, last_claimed_at,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
            "#,
            params![
                op.id.to_string(),
                op.work_order_id.to_string(),
                op.station.as_str(),
                op.workflow_stage_index,
                operation_status_str(op.status),
                execution_type_str(op.execution_type),
                op.iteration_count,
                op.loop_target_op_id.map(|id| id.to_string()),
                op.loop_config_json,
                op.current_story_id.map(|id| id.to_string()),
                op.retry_count,
                op.max_retries,
                op.timeout_count,
                serde_json::to_string(&op.assignee_agent_ids)?,
                op.blocked_reason,
                op.escalation_reason,
                op.escalated_at.map(|dt| dt.to_rfc3339()),
                op.claimed_by,
                op.claim_expires_at.map(|dt| dt.to_rfc3339()),
                op.last_claimed_at.map(|dt| dt.to_rfc3339()),
                op.created_at.to_rfc3339(),
                op.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Persist the mutable fields of an operation
    pub fn update_operation(&self, op: &Operation) -> Result<()> {
        self.tx.execute(
            r#"
            UPDATE operations
            SET status = ?1, iteration_count = ?2, loop_target_op_id = ?3,
                loop_config_json = ?4, current_story_id = ?5, retry_count = ?6,
                timeout_count = ?7, assignee_agent_ids = ?8, blocked_reason = ?9,
                escalation_reason = ?10, escalated_at = ?11, updated_at = ?12
            WHERE id = ?13
            "#,
            params![
                operation_status_str(op.status),
                op.iteration_count,
                op.loop_target_op_id.map(|id| id.to_string()),
                op.loop_config_json,
                op.current_story_id.map(|id| id.to_string()),
                op.retry_count,
                op.timeout_count,
                serde_json::to_string(&op.assignee_agent_ids)?,
                op.blocked_reason,
                op.escalation_reason,
                op.escalated_at.map(|dt| dt.to_rfc3339()),
                Local::now().to_rfc3339(),
                op.id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Batch-insert a story batch for a loop operation
    pub fn insert_stories(&self, stories: &[OperationStory]) -> Result<()> {
        let mut stmt = self.tx.prepare(
            r#"
            INSERT INTO operation_stories (
                id, operation_id, work_order_id, story_index, story_key, title,
                description, acceptance_criteria, status, output_json,
                retry_count, max_retries, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )?;
        for story in stories {
            stmt.execute(params![
                story.id.to_string(),
                story.operation_id.to_string(),
                story.work_order_id.to_string(),
                story.story_index,
                story.story_key,
                story.title,
                story.description,
                story.acceptance_criteria,
                story_status_str(story.status),
                story.output_json,
                story.retry_count,
                story.max_retries,
                story.created_at.to_rfc3339(),
                story.updated_at.to_rfc3339(),
            ])?;
        }
        Ok(())
    }

    /// Persist the mutable fields of a story
    pub fn update_story(&self, story: &OperationStory) -> Result<()> {
        self.tx.execute(
            r#"
            UPDATE operation_stories
            SET status = ?1, output_json = ?2, retry_count = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
            params![
                story_status_str(story.status),
                story.output_json,
                story.retry_count,
                Local::now().to_rfc3339(),
                story.id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Delete all stories of a loop operation. Only used when a loop stage
    /// is regenerated from scratch on rework.
    pub fn purge_stories(&self, operation_id: Uuid) -> Result<usize> {
        let deleted = self.tx.execute(
            "DELETE FROM operation_stories WHERE operation_id = ?1",
            params![operation_id.to_string()],
        )?;
        Ok(deleted)
    }

    /// Append an audit record
    pub fn append_activity(&self, activity: &Activity) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO activities (
                ts, kind, actor, actor_type, actor_agent_id,
                entity_type, entity_id, summary, payload_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                activity.ts.to_rfc3339(),
                activity.kind,
                activity.actor,
                actor_type_str(activity.actor_type),
                activity.actor_agent_id,
                activity.entity_type,
                activity.entity_id,
                activity.summary,
                activity.payload_json,
            ],
        )?;
        Ok(())
    }

    /// Record a durable approval
    pub fn insert_approval(&self, approval: &Approval) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO approvals (work_order_id, operation_id, stage_ref, approved_by, ts)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                approval.work_order_id.to_string(),
                approval.operation_id.to_string(),
                approval.stage_ref,
                approval.approved_by,
                approval.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Record a command-execution receipt
    pub fn insert_receipt(&self, receipt: &Receipt) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO receipts (work_order_id, operation_id, command, exit_code, summary, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                receipt.work_order_id.to_string(),
                receipt.operation_id.to_string(),
                receipt.command,
                receipt.exit_code,
                receipt.summary,
                receipt.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Record a produced artifact reference
    pub fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO artifacts (work_order_id, operation_id, kind, uri, label, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                artifact.work_order_id.to_string(),
                artifact.operation_id.to_string(),
                artifact.kind,
                artifact.uri,
                artifact.label,
                artifact.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

// Helper functions for mapping between database and Rust types

const WORK_ORDER_COLS: &str = "id, title, goal, state, workflow_id, current_stage, \
     blocked_reason, shipped_at, priority, tags, context_json, effective_stages_json, \
     created_at, updated_at";

const OPERATION_COLS: &str = "id, work_order_id, station, workflow_stage_index, status, \
     execution_type, iteration_count, loop_target_op_id, loop_config_json, current_story_id, \
     retry_count, max_retries, timeout_count, assignee_agent_ids, blocked_reason, \
     escalation_reason, escalated_at, claimed_by, claim_expires_at, last_claimed_at, \
     created_at, updated_at";

const STORY_COLS: &str = "id, operation_id, work_order_id, story_index, story_key, title, \
     description, acceptance_criteria, status, output_json, retry_count, max_retries, \
     created_at, updated_at";

const ACTIVITY_COLS: &str = "id, ts, kind, actor, actor_type, actor_agent_id, entity_type, \
     entity_id, summary, payload_json";

fn work_order_state_str(state: WorkOrderState) -> &'static str {
    match state {
        WorkOrderState::Planned => "planned",
        WorkOrderState::Active => "active",
        WorkOrderState::Blocked => "blocked",
        WorkOrderState::Cancelled => "cancelled",
        WorkOrderState::Shipped => "shipped",
    }
}

fn work_order_state_from_str(s: &str) -> Result<WorkOrderState> {
    match s {
        "planned" => Ok(WorkOrderState::Planned),
        "active" => Ok(WorkOrderState::Active),
        "blocked" => Ok(WorkOrderState::Blocked),
        "cancelled" => Ok(WorkOrderState::Cancelled),
        "shipped" => Ok(WorkOrderState::Shipped),
        _ => Err(anyhow!("Unknown work order state: {}", s)),
    }
}

fn operation_status_str(status: OperationStatus) -> &'static str {
    match status {
        OperationStatus::Pending => "pending",
        OperationStatus::InProgress => "in_progress",
        OperationStatus::Waiting => "waiting",
        OperationStatus::Completed => "completed",
        OperationStatus::Rework => "rework",
        OperationStatus::Blocked => "blocked",
        OperationStatus::Cancelled => "cancelled",
    }
}

fn operation_status_from_str(s: &str) -> Result<OperationStatus> {
    match s {
        "pending" => Ok(OperationStatus::Pending),
        "in_progress" => Ok(OperationStatus::InProgress),
        "waiting" => Ok(OperationStatus::Waiting),
        "completed" => Ok(OperationStatus::Completed),
        "rework" => Ok(OperationStatus::Rework),
        "blocked" => Ok(OperationStatus::Blocked),
        "cancelled" => Ok(OperationStatus::Cancelled),
        _ => Err(anyhow!("Unknown operation status: {}", s)),
    }
}

fn execution_type_str(execution_type: ExecutionType) -> &'static str {
    match execution_type {
        ExecutionType::Sequential => "sequential",
        ExecutionType::Loop => "loop",
    }
}

fn execution_type_from_str(s: &str) -> Result<ExecutionType> {
    match s {
        "sequential" => Ok(ExecutionType::Sequential),
        "loop" => Ok(ExecutionType::Loop),
        _ => Err(anyhow!("Unknown execution type: {}", s)),
    }
}

fn story_status_str(status: StoryStatus) -> &'static str {
    match status {
        StoryStatus::Pending => "pending",
        StoryStatus::Building => "building",
        StoryStatus::Verifying => "verifying",
        StoryStatus::Done => "done",
        StoryStatus::Failed => "failed",
    }
}

fn story_status_from_str(s: &str) -> Result<StoryStatus> {
    match s {
        "pending" => Ok(StoryStatus::Pending),
        "building" => Ok(StoryStatus::Building),
        "verifying" => Ok(StoryStatus::Verifying),
        "done" => Ok(StoryStatus::Done),
        "failed" => Ok(StoryStatus::Failed),
        _ => Err(anyhow!("Unknown story status: {}", s)),
    }
}

fn actor_type_str(actor_type: ActorType) -> &'static str {
    match actor_type {
        ActorType::Engine => "engine",
        ActorType::Agent => "agent",
        ActorType::Human => "human",
    }
}

fn actor_type_from_str(s: &str) -> Result<ActorType> {
    match s {
        "engine" => Ok(ActorType::Engine),
        "agent" => Ok(ActorType::Agent),
        "human" => Ok(ActorType::Human),
        _ => Err(anyhow!("Unknown actor type: {}", s)),
    }
}

fn station_from_str(s: &str) -> Result<Station> {
    match s {
        "planning" => Ok(Station::Planning),
        "build" => Ok(Station::Build),
        "review" => Ok(Station::Review),
        "security" => Ok(Station::Security),
        "testing" => Ok(Station::Testing),
        "coordination" => Ok(Station::Coordination),
        _ => Err(anyhow!("Unknown station: {}", s)),
    }
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn text_err(idx: usize, msg: String) -> rusqlite::Error {
    conversion_err(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| conversion_err(idx, e))
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_uuid(idx: usize, s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.map(|s| parse_uuid(idx, &s)).transpose()
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Local>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

fn map_work_order_row(row: &Row) -> rusqlite::Result<WorkOrder> {
    let id: String = row.get(0)?;
    let state: String = row.get(3)?;
    let shipped_at: Option<String> = row.get(7)?;
    let tags: String = row.get(9)?;
    let context: String = row.get(10)?;
    let effective_stages: String = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(WorkOrder {
        id: parse_uuid(0, &id)?,
        title: row.get(1)?,
        goal: row.get(2)?,
        state: work_order_state_from_str(&state).map_err(|e| text_err(3, e.to_string()))?,
        workflow_id: row.get(4)?,
        current_stage: row.get(5)?,
        blocked_reason: row.get(6)?,
        shipped_at: parse_opt_ts(7, shipped_at)?,
        priority: row.get(8)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_err(9, e))?,
        context: serde_json::from_str(&context).map_err(|e| conversion_err(10, e))?,
        effective_stages: serde_json::from_str(&effective_stages)
            .map_err(|e| conversion_err(11, e))?,
        created_at: parse_ts(12, &created_at)?,
        updated_at: parse_ts(13, &updated_at)?,
    })
}

fn map_operation_row(row: &Row) -> rusqlite::Result<Operation> {
    let id: String = row.get(0)?;
    let work_order_id: String = row.get(1)?;
    let station: String = row.get(2)?;
    let status: String = row.get(4)?;
    let execution_type: String = row.get(5)?;
    let loop_target_op_id: Option<String> = row.get(7)?;
    let current_story_id: Option<String> = row.get(9)?;
    let assignees: String = row.get(13)?;
    let escalated_at: Option<String> = row.get(16)?;
    let claim_expires_at: Option<String> = row.get(18)?;
    let last_claimed_at: Option<String> = row.get(19)?;
    let created_at: String = row.get(20)?;
    let updated_at: String = row.get(21)?;

    Ok(Operation {
        id: parse_uuid(0, &id)?,
        work_order_id: parse_uuid(1, &work_order_id)?,
        station: station_from_str(&station).map_err(|e| text_err(2, e.to_string()))?,
        workflow_stage_index: row.get(3)?,
        status: operation_status_from_str(&status).map_err(|e| text_err(4, e.to_string()))?,
        execution_type: execution_type_from_str(&execution_type)
            .map_err(|e| text_err(5, e.to_string()))?,
        iteration_count: row.get(6)?,
        loop_target_op_id: parse_opt_uuid(7, loop_target_op_id)?,
        loop_config_json: row.get(8)?,
        current_story_id: parse_opt_uuid(9, current_story_id)?,
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        timeout_count: row.get(12)?,
        assignee_agent_ids: serde_json::from_str(&assignees).map_err(|e| conversion_err(13, e))?,
        blocked_reason: row.get(14)?,
        escalation_reason: row.get(15)?,
        escalated_at: parse_opt_ts(16, escalated_at)?,
        claimed_by: row.get(17)?,
        claim_expires_at: parse_opt_ts(18, claim_expires_at)?,
        last_claimed_at: parse_opt_ts(19, last_claimed_at)?,
        created_at: parse_ts(20, &created_at)?,
        updated_at: parse_ts(21, &updated_at)?,
    })
}

fn map_story_row(row: &Row) -> rusqlite::Result<OperationStory> {
    let id: String = row.get(0)?;
    let operation_id: String = row.get(1)?;
    let work_order_id: String = row.get(2)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(OperationStory {
        id: parse_uuid(0, &id)?,
        operation_id: parse_uuid(1, &operation_id)?,
        work_order_id: parse_uuid(2, &work_order_id)?,
        story_index: row.get(3)?,
        story_key: row.get(4)?,
        title: row.get(5)?,
        description: row.get(6)?,
        acceptance_criteria: row.get(7)?,
        status: story_status_from_str(&status).map_err(|e| text_err(8, e.to_string()))?,
        output_json: row.get(9)?,
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        created_at: parse_ts(12, &created_at)?,
        updated_at: parse_ts(13, &updated_at)?,
    })
}

fn map_activity_row(row: &Row) -> rusqlite::Result<Activity> {
    let ts: String = row.get(1)?;
    let actor_type: String = row.get(4)?;

    Ok(Activity {
        id: row.get(0)?,
        ts: parse_ts(1, &ts)?,
        kind: row.get(2)?,
        actor: row.get(3)?,
        actor_type: actor_type_from_str(&actor_type).map_err(|e| text_err(4, e.to_string()))?,
        actor_agent_id: row.get(5)?,
        entity_type: row.get(6)?,
        entity_id: row.get(7)?,
        summary: row.get(8)?,
        payload_json: row.get(9)?,
    })
}

fn map_approval_row(row: &Row) -> rusqlite::Result<Approval> {
    let work_order_id: String = row.get(1)?;
    let operation_id: String = row.get(2)?;
    let ts: String = row.get(5)?;

    Ok(Approval {
        id: row.get(0)?,
        work_order_id: parse_uuid(1, &work_order_id)?,
        operation_id: parse_uuid(2, &operation_id)?,
        stage_ref: row.get(3)?,
        approved_by: row.get(4)?,
        ts: parse_ts(5, &ts)?,
    })
}

fn map_receipt_row(row: &Row) -> rusqlite::Result<Receipt> {
    let work_order_id: String = row.get(1)?;
    let operation_id: String = row.get(2)?;
    let ts: String = row.get(6)?;

    Ok(Receipt {
        id: row.get(0)?,
        work_order_id: parse_uuid(1, &work_order_id)?,
        operation_id: parse_uuid(2, &operation_id)?,
        command: row.get(3)?,
        exit_code: row.get(4)?,
        summary: row.get(5)?,
        ts: parse_ts(6, &ts)?,
    })
}

fn map_artifact_row(row: &Row) -> rusqlite::Result<Artifact> {
    let work_order_id: String = row.get(1)?;
    let operation_id: String = row.get(2)?;
    let ts: String = row.get(6)?;

    Ok(Artifact {
        id: row.get(0)?,
        work_order_id: parse_uuid(1, &work_order_id)?,
        operation_id: parse_uuid(2, &operation_id)?,
        kind: row.get(3)?,
        uri: row.get(4)?,
        label: row.get(5)?,
        ts: parse_ts(6, &ts)?,
    })
}
