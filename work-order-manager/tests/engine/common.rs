//! Common test harness: in-memory store, fixed agent roster, and a
//! recording dispatcher.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use uuid::Uuid;

use work_order_manager::catalog::StaticCatalog;
use work_order_manager::config::EngineConfig;
use work_order_manager::database::Database;
use work_order_manager::engine::{AdvanceOutcome, Engine, StartOptions};
use work_order_manager::models::{Operation, WorkOrder};
use work_order_sdk::{
    async_trait, AgentIdentity, AgentResolver, CompletionResult, ContractResult, DeliveryHandle,
    Dispatcher, OperationStatus, ResultStatus, Station, TaskPayload,
};

/// Resolves every station to a fixed worker, except the ones listed as
/// missing.
pub struct FixedRoster {
    pub missing: Vec<Station>,
}

impl FixedRoster {
    pub fn full() -> Self {
        Self { missing: vec![] }
    }
}

#[async_trait]
impl AgentResolver for FixedRoster {
    async fn resolve(&self, station: Station) -> ContractResult<Option<AgentIdentity>> {
        if self.missing.contains(&station) {
            return Ok(None);
        }
        Ok(Some(AgentIdentity {
            id: format!("{}-1", station),
            name: format!("{} worker", station),
            station,
        }))
    }
}

/// Records every dispatched payload and notification.
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: StdMutex<Vec<TaskPayload>>,
    notifications: StdMutex<Vec<(String, String)>>,
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        _agent: &AgentIdentity,
        payload: TaskPayload,
    ) -> ContractResult<DeliveryHandle> {
        self.dispatched.lock().unwrap().push(payload);
        Ok(DeliveryHandle::new(Uuid::new_v4(), "test-channel".to_string()))
    }

    async fn notify(&self, channel: &str, message: &str) -> ContractResult<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

impl RecordingDispatcher {
    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<TaskPayload> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn last_payload(&self) -> TaskPayload {
        self.dispatched
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no payload dispatched")
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        self.notifications.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub db: Arc<Mutex<Database>>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub engine: Engine,
}

pub fn harness() -> Harness {
    harness_with(FixedRoster::full())
}

/// A harness with the delivery channel swapped out, for failure-path tests.
pub fn harness_with_channel(dispatcher: Arc<dyn Dispatcher>) -> (Arc<Mutex<Database>>, Engine) {
    let db = Database::new_in_memory().unwrap();
    db.initialize_schema().unwrap();
    let db = Arc::new(Mutex::new(db));
    let engine = Engine::new(
        db.clone(),
        Arc::new(StaticCatalog::builtin()),
        Arc::new(FixedRoster::full()),
        dispatcher,
        EngineConfig::default(),
    );
    (db, engine)
}

pub fn harness_with(roster: FixedRoster) -> Harness {
    let db = Database::new_in_memory().unwrap();
    db.initialize_schema().unwrap();
    let db = Arc::new(Mutex::new(db));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let engine = Engine::new(
        db.clone(),
        Arc::new(StaticCatalog::builtin()),
        Arc::new(roster),
        dispatcher.clone(),
        EngineConfig::default(),
    );
    Harness {
        db,
        dispatcher,
        engine,
    }
}

/// Insert a planned work order with the given tags.
pub async fn seed_work_order(h: &Harness, tags: &[&str]) -> WorkOrder {
    let mut wo = WorkOrder::new("Test order", "Exercise the engine");
    for tag in tags {
        wo = wo.with_tag(*tag);
    }
    h.db.lock().await.insert_work_order(&wo).unwrap();
    wo
}

/// Build start options from context key/value pairs.
pub fn start_with(pairs: &[(&str, serde_json::Value)]) -> StartOptions {
    let mut context = serde_json::Map::new();
    for (key, value) in pairs {
        context.insert(key.to_string(), value.clone());
    }
    StartOptions {
        context,
        workflow_override: None,
    }
}

/// The single in-progress operation of a work order. Panics unless exactly
/// one exists, which doubles as a WIP=1 assertion.
pub async fn sole_in_progress(h: &Harness, work_order_id: Uuid) -> Operation {
    let db = h.db.lock().await;
    let in_progress: Vec<Operation> = db
        .list_operations(work_order_id)
        .unwrap()
        .into_iter()
        .filter(|o| o.status == OperationStatus::InProgress)
        .collect();
    assert_eq!(
        in_progress.len(),
        1,
        "expected exactly one in-progress operation"
    );
    in_progress.into_iter().next().unwrap()
}

pub async fn reload_work_order(h: &Harness, work_order_id: Uuid) -> WorkOrder {
    h.db.lock()
        .await
        .get_work_order(work_order_id)
        .unwrap()
        .unwrap()
}

/// Deliver a completion and assert it applied (not a duplicate).
pub async fn advance(
    h: &Harness,
    operation_id: Uuid,
    status: ResultStatus,
    token: &str,
    output: serde_json::Value,
    feedback: Option<&str>,
) {
    let mut result = CompletionResult::new(status, token).with_output(output);
    if let Some(fb) = feedback {
        result = result.with_feedback(fb);
    }
    let outcome = h
        .engine
        .advance_on_completion(operation_id, result)
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::Applied);
}

/// A story batch for a loop-stage initiation, keyed by batch prefix.
pub fn story_batch(prefix: &str, count: usize) -> serde_json::Value {
    let stories: Vec<serde_json::Value> = (1..=count)
        .map(|i| {
            serde_json::json!({
                "key": format!("{}-s{}", prefix, i),
                "title": format!("Story {}", i),
                "description": "do the thing",
                "acceptance_criteria": "it works",
            })
        })
        .collect();
    serde_json::json!({ "stories": stories })
}
