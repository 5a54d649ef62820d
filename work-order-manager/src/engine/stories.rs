//! Story batch parsing for loop stages
//!
//! A loop stage's initiation completion carries `output.stories`, an array of
//! story specifications supplied by the planning worker. Receipts ride along
//! the same way under `output.receipts`.

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::Value;
use uuid::Uuid;
use work_order_sdk::{StorySpec, StoryStatus};

use crate::models::{Operation, OperationStory, Receipt};

/// Parse `output.stories` into pending story rows for a loop operation.
/// Missing or empty `stories` yields an empty batch, which the engine treats
/// as "nothing to decompose": the loop stage completes outright.
pub fn parse_story_batch(
    output: &Value,
    operation: &Operation,
    max_retries: u32,
) -> Result<Vec<OperationStory>> {
    let specs: Vec<StorySpec> = match output.get("stories") {
        Some(raw) => serde_json::from_value(raw.clone())
            .context("Malformed story batch in loop-stage output")?,
        None => Vec::new(),
    };

    let now = Local::now();
    Ok(specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| OperationStory {
            id: Uuid::new_v4(),
            operation_id: operation.id,
            work_order_id: operation.work_order_id,
            story_index: index,
            story_key: spec.key,
            title: spec.title,
            description: spec.description,
            acceptance_criteria: spec.acceptance_criteria,
            status: StoryStatus::Pending,
            output_json: None,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
        })
        .collect())
}

/// Parse `output.receipts` into receipt rows. A worker that ran commands
/// reports them as `{command, exit_code?, summary?}`; anything unparseable
/// is skipped rather than failing the transition.
pub fn parse_receipts(output: &Value, operation: &Operation) -> Vec<Receipt> {
    let Some(raw) = output.get("receipts").and_then(Value::as_array) else {
        return Vec::new();
    };

    raw.iter()
        .filter_map(|entry| {
            let command = entry.get("command")?.as_str()?.to_string();
            Some(Receipt {
                id: 0,
                work_order_id: operation.work_order_id,
                operation_id: operation.id,
                command,
                exit_code: entry.get("exit_code").and_then(Value::as_i64),
                summary: entry
                    .get("summary")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ts: Local::now(),
            })
        })
        .collect()
}
