//! ABOUTME: WorkflowService: owns the per-workflow state machine and drives stage dispatch (spec §4.10)
//! ABOUTME: States `initiated, running, cancelled, succeeded, failed`; driven by agent results off the bus

use crate::events;
use chrono::Utc;
use dashmap::DashMap;
use orchestrator_core::envelope::{
    AgentResult, AgentStatus, Priority, TaskConstraints, TaskEnvelope, TaskMetadata, WorkflowContextRef,
};
use orchestrator_core::ports::{MessageBus, OrchestratorStoreError, WorkflowStore};
use orchestrator_core::trace::TraceContext;
use orchestrator_core::workflow_types::{
    StageOutcome, StageResult, WorkflowContext, WorkflowDefinition, WorkflowStatus,
};
use orchestrator_dispatch::{AgentDispatcher, DispatchError, ResultHandler};
use orchestrator_workflow::engine::{EngineError, WorkflowEngine};
use serde_json::Value;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("workflow definition is invalid: {0}")]
    InvalidDefinition(#[from] EngineError),
    #[error("store error: {0}")]
    Store(#[from] OrchestratorStoreError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("bus error: {0}")]
    Bus(#[from] orchestrator_core::ports::BusError),
    #[error("unknown workflow {0}")]
    UnknownWorkflow(Uuid),
}

/// Maps the facade's top-level error onto the cross-crate taxonomy so a
/// caller at the process boundary (the CLI, a future HTTP surface) gets a
/// stable `code()`/`retryable()` pair instead of matching on `ServiceError`
/// variants directly.
impl From<&ServiceError> for orchestrator_core::error::OrchestratorError {
    fn from(err: &ServiceError) -> Self {
        use orchestrator_core::error::OrchestratorError;
        match err {
            ServiceError::InvalidDefinition(e) => OrchestratorError::Validation { message: e.to_string() },
            ServiceError::Store(e) => OrchestratorError::Transport { message: e.to_string() },
            ServiceError::Dispatch(e) => OrchestratorError::Transport { message: e.to_string() },
            ServiceError::Bus(e) => OrchestratorError::Transport { message: e.to_string() },
            ServiceError::UnknownWorkflow(id) => {
                OrchestratorError::Validation { message: format!("unknown workflow {id}") }
            }
        }
    }
}

/// Forwards a bus result to the service that owns `workflow_id`, hopping
/// onto a spawned task since `ResultHandler::handle` is synchronous but
/// advancing the state machine needs to await the store and the bus.
struct StageResultHandler {
    service: Weak<WorkflowService>,
    workflow_id: Uuid,
}

impl ResultHandler for StageResultHandler {
    fn handle(&self, result: AgentResult) {
        let service = self.service.clone();
        let workflow_id = self.workflow_id;
        tokio::spawn(async move {
            if let Some(service) = service.upgrade() {
                service.handle_result(workflow_id, result).await;
            }
        });
    }
}

/// Projects the completed stage's output (and any `pass_through`/
/// `input_mapping` sources already recorded) into the next stage's task
/// payload (spec §4.10 "apply data-flow mapping").
fn build_stage_input(ctx: &WorkflowContext) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("input".to_string(), ctx.input_data.clone());

    if let Some(flow) = &ctx.definition.data_flow {
        for stage_name in &flow.pass_through {
            if let Some(result) = ctx.stage_results.get(stage_name) {
                obj.insert(stage_name.clone(), result.output.clone());
            }
        }
        for (target, dotted) in &flow.input_mapping {
            if let Some((stage, field)) = dotted.split_once('.') {
                let value = ctx
                    .stage_results
                    .get(stage)
                    .and_then(|r| r.output.get(field))
                    .cloned()
                    .unwrap_or(Value::Null);
                obj.insert(target.clone(), value);
            }
        }
    }

    Value::Object(obj)
}

fn outcome_for(status: AgentStatus) -> StageOutcome {
    match status {
        AgentStatus::Success => StageOutcome::Success,
        AgentStatus::Timeout => StageOutcome::Timeout,
        AgentStatus::Failed => StageOutcome::Failure,
        _ => StageOutcome::Unknown,
    }
}

/// One state machine per `workflow_id`: `initiated → running → {cancelled,
/// succeeded, failed}` (spec §4.10).
pub struct WorkflowService {
    self_ref: Weak<WorkflowService>,
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<AgentDispatcher>,
    store: Arc<dyn WorkflowStore>,
    engines: DashMap<Uuid, WorkflowEngine>,
    contexts: DashMap<Uuid, RwLock<WorkflowContext>>,
    statuses: DashMap<Uuid, WorkflowStatus>,
}

impl WorkflowService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        dispatcher: Arc<AgentDispatcher>,
        store: Arc<dyn WorkflowStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            bus,
            dispatcher,
            store,
            engines: DashMap::new(),
            contexts: DashMap::new(),
            statuses: DashMap::new(),
        })
    }

    /// Validates `definition`, persists the initial context, and publishes
    /// `workflow.created` (spec §4.10 "On creation").
    pub async fn create(
        &self,
        definition: WorkflowDefinition,
        input_data: Value,
    ) -> Result<Uuid, ServiceError> {
        let engine = WorkflowEngine::new(definition)?;
        let workflow_id = Uuid::new_v4();
        let ctx = engine.create_initial_context(workflow_id, input_data);
        self.store.save(&ctx).await?;

        self.statuses.insert(workflow_id, WorkflowStatus::Initiated);
        self.contexts.insert(workflow_id, RwLock::new(ctx));
        self.engines.insert(workflow_id, engine);

        events::publish(
            self.bus.as_ref(),
            events::WORKFLOW_CREATED,
            serde_json::json!({ "workflow_id": workflow_id }),
        )
        .await?;
        Ok(workflow_id)
    }

    /// Dispatches the start stage's task and publishes `workflow.started`
    /// (spec §4.10 "On start").
    pub async fn start(self: &Arc<Self>, workflow_id: Uuid) -> Result<(), ServiceError> {
        let stage_name = {
            let ctx_lock = self
                .contexts
                .get(&workflow_id)
                .ok_or(ServiceError::UnknownWorkflow(workflow_id))?;
            ctx_lock.read().await.current_stage.clone()
        };

        self.statuses.insert(workflow_id, WorkflowStatus::Running);
        events::publish(
            self.bus.as_ref(),
            events::WORKFLOW_STARTED,
            serde_json::json!({ "workflow_id": workflow_id }),
        )
        .await?;

        self.dispatch_stage(workflow_id, &stage_name).await;
        Ok(())
    }

    async fn dispatch_stage(self: &Arc<Self>, workflow_id: Uuid, stage_name: &str) {
        let Some(stage_cfg) = self
            .engines
            .get(&workflow_id)
            .and_then(|engine| engine.definition().stages.get(stage_name).cloned())
        else {
            warn!(%workflow_id, stage_name, "stage not found in definition, cannot dispatch");
            return;
        };

        let payload = {
            let Some(ctx_lock) = self.contexts.get(&workflow_id) else {
                return;
            };
            build_stage_input(&ctx_lock.read().await)
        };

        self.dispatcher.on_result(
            workflow_id,
            Arc::new(StageResultHandler {
                service: self.self_ref.clone(),
                workflow_id,
            }),
        );

        let task = TaskEnvelope {
            message_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            workflow_id,
            agent_type: stage_cfg.agent_type.clone(),
            priority: Priority::Normal,
            payload,
            constraints: TaskConstraints {
                timeout_ms: stage_cfg.timeout_ms,
                max_retries: stage_cfg.max_retries,
                required_confidence: 80.0,
            },
            workflow_context: WorkflowContextRef {
                current_stage: stage_name.to_string(),
                extra: Default::default(),
            },
            trace: TraceContext::root(),
            metadata: TaskMetadata {
                created_at: Utc::now(),
                created_by: "workflow-service".to_string(),
                envelope_version: orchestrator_core::envelope::ENVELOPE_VERSION.to_string(),
            },
        };

        if let Err(err) = self.dispatcher.dispatch_task(&task).await {
            warn!(%workflow_id, %err, "failed to dispatch stage task");
            self.fail_workflow(workflow_id, "DISPATCH_ERROR", &err.to_string()).await;
        }
    }

    async fn handle_result(self: &Arc<Self>, workflow_id: Uuid, result: AgentResult) {
        let Some(engine) = self.engines.get(&workflow_id) else {
            return;
        };
        let Some(ctx_lock) = self.contexts.get(&workflow_id) else {
            return;
        };

        let next_stage = {
            let mut ctx = ctx_lock.write().await;
            if !matches!(self.statuses.get(&workflow_id).map(|s| *s), Some(WorkflowStatus::Running)) {
                return; // cancelled or already terminal; ignore in-flight result
            }

            let current_stage = ctx.current_stage.clone();
            let outcome = outcome_for(result.status);
            let stage_result = StageResult {
                outcome,
                output: result.result.data.clone(),
                error: result.error.as_ref().map(|e| e.message.clone()),
                attempts: 1,
                duration_ms: result.result.metrics.duration_ms,
                timestamp: result.timestamp,
            };

            if engine.record_stage_result(&mut ctx, &current_stage, stage_result).is_err() {
                return;
            }
            if let Err(err) = self.store.save(&ctx).await {
                warn!(%workflow_id, %err, "failed to persist workflow context");
            }

            match engine.get_next_stage(&current_stage, outcome) {
                Some(next) => {
                    ctx.current_stage = next.clone();
                    Some(next)
                }
                None => {
                    let final_status = if outcome == StageOutcome::Success {
                        WorkflowStatus::Succeeded
                    } else {
                        WorkflowStatus::Failed
                    };
                    let workflow_result = engine.build_workflow_result(&ctx, final_status);
                    drop(ctx);
                    self.statuses.insert(workflow_id, final_status);
                    let topic = if final_status == WorkflowStatus::Succeeded {
                        events::WORKFLOW_COMPLETED
                    } else {
                        events::WORKFLOW_FAILED
                    };
                    let _ = events::publish(
                        self.bus.as_ref(),
                        topic,
                        serde_json::to_value(&workflow_result).expect("WorkflowResult always serializes"),
                    )
                    .await;
                    None
                }
            }
        };

        if let Some(next_stage) = next_stage {
            self.dispatch_stage(workflow_id, &next_stage).await;
        }
    }

    async fn fail_workflow(&self, workflow_id: Uuid, code: &str, message: &str) {
        self.statuses.insert(workflow_id, WorkflowStatus::Failed);
        let _ = events::publish(
            self.bus.as_ref(),
            events::WORKFLOW_FAILED,
            serde_json::json!({ "workflow_id": workflow_id, "last_error": { "code": code, "message": message, "recoverable": false } }),
        )
        .await;
    }

    /// Propagates cancellation to the dispatcher (drops its result
    /// handler) and the store (spec §4.10 "Cancel").
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<(), ServiceError> {
        self.statuses.insert(workflow_id, WorkflowStatus::Cancelled);
        self.dispatcher.off_result(workflow_id);
        self.store.delete(workflow_id).await?;
        Ok(())
    }

    pub fn status(&self, workflow_id: Uuid) -> Option<WorkflowStatus> {
        self.statuses.get(&workflow_id).map(|s| *s)
    }

    pub async fn context(&self, workflow_id: Uuid) -> Option<WorkflowContext> {
        let ctx_lock = self.contexts.get(&workflow_id)?;
        Some(ctx_lock.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::envelope::{AgentStatus as Status, ResultData, ResultMetrics};
    use orchestrator_core::ports::{BusMessage, HandlerFuture, MessageHandler, PublishOptions, SubscribeOptions};
    use orchestrator_core::workflow_types::StageConfig;
    use orchestrator_dispatch::InMemoryAgentRegistry;
    use std::collections::HashMap;
    use std::time::Duration;

    fn stage_config(agent_type: &str, on_success: Option<&str>) -> StageConfig {
        StageConfig {
            name: agent_type.to_string(),
            agent_type: agent_type.to_string(),
            config: Value::Null,
            timeout_ms: 2000,
            max_retries: 3,
            on_success: on_success.map(String::from),
            on_failure: None,
            parallel: false,
            skip_condition: None,
            weight: None,
        }
    }

    fn two_stage_definition() -> WorkflowDefinition {
        let mut stages = HashMap::new();
        stages.insert("A".to_string(), stage_config("scaffold", Some("B")));
        stages.insert("B".to_string(), stage_config("build", None));
        WorkflowDefinition {
            name: "demo".to_string(),
            version: "1".to_string(),
            description: String::new(),
            start_stage: "A".to_string(),
            stages,
            global_timeout_ms: 60_000,
            max_parallel_stages: 1,
            retry_strategy: Default::default(),
            on_failure: Default::default(),
            data_flow: None,
        }
    }

    struct StubAgent {
        bus: Arc<orchestrator_bus::InMemoryBus>,
        agent_type: String,
    }

    impl MessageHandler for StubAgent {
        fn handle(&self, message: BusMessage) -> HandlerFuture {
            let bus = self.bus.clone();
            let agent_type = self.agent_type.clone();
            Box::pin(async move {
                let task: TaskEnvelope = serde_json::from_value(message.payload).unwrap();
                let result = AgentResult {
                    task_id: task.task_id,
                    workflow_id: task.workflow_id,
                    agent_id: format!("{agent_type}-1"),
                    agent_type,
                    success: true,
                    status: Status::Success,
                    action: "run".to_string(),
                    result: ResultData {
                        data: serde_json::json!({}),
                        artifacts: None,
                        metrics: ResultMetrics {
                            duration_ms: 1,
                            extra: Default::default(),
                        },
                    },
                    error: None,
                    warnings: vec![],
                    stage: task.workflow_context.current_stage,
                    timestamp: Utc::now(),
                    version: "1.0.0".to_string(),
                };
                bus.publish(
                    "orchestrator:results",
                    serde_json::to_value(&result).unwrap(),
                    PublishOptions {
                        key: Some(task.workflow_id.to_string()),
                        mirror_to_stream: Some("stream:orchestrator:results".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
                Ok(())
            })
        }
    }

    async fn spawn_stub(bus: Arc<orchestrator_bus::InMemoryBus>, agent_type: &str) {
        bus.subscribe(
            &format!("agent:tasks:{agent_type}"),
            Arc::new(StubAgent {
                bus: bus.clone(),
                agent_type: agent_type.to_string(),
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn create_start_and_run_to_completion_across_two_stages() {
        let bus = orchestrator_bus::InMemoryBus::new();
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let dispatcher = AgentDispatcher::new(bus.clone(), registry);
        dispatcher.start().await.unwrap();
        spawn_stub(bus.clone(), "scaffold").await;
        spawn_stub(bus.clone(), "build").await;

        let store = Arc::new(crate::store::InMemoryWorkflowStore::new());
        let service = WorkflowService::new(bus.clone(), dispatcher, store);

        let workflow_id = service.create(two_stage_definition(), serde_json::json!({})).await.unwrap();
        assert_eq!(service.status(workflow_id), Some(WorkflowStatus::Initiated));

        service.start(workflow_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(service.status(workflow_id), Some(WorkflowStatus::Succeeded));
    }

    #[tokio::test]
    async fn cancel_unregisters_handler_and_deletes_from_store() {
        let bus = orchestrator_bus::InMemoryBus::new();
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let dispatcher = AgentDispatcher::new(bus.clone(), registry);
        dispatcher.start().await.unwrap();

        let store = Arc::new(crate::store::InMemoryWorkflowStore::new());
        let service = WorkflowService::new(bus.clone(), dispatcher, store.clone());

        let workflow_id = service.create(two_stage_definition(), serde_json::json!({})).await.unwrap();
        service.cancel(workflow_id).await.unwrap();

        assert_eq!(service.status(workflow_id), Some(WorkflowStatus::Cancelled));
        assert!(store.load(workflow_id).await.unwrap().is_none());
    }
}
