//! ABOUTME: PipelineExecutor: DAG scheduler over a PipelineDefinition (spec §4.9)
//! ABOUTME: Sequential and parallel execution modes share one dependency-resolution pass

use crate::events::{self, PipelineEvent};
use chrono::Utc;
use dashmap::DashMap;
use orchestrator_core::envelope::{
    AgentResult, Priority, TaskConstraints, TaskEnvelope, TaskMetadata, WorkflowContextRef,
};
use orchestrator_core::pipeline_types::{
    DependencyCondition, ExecutionMode, ExecutionStatus, PipelineDefinition, PipelineExecution,
    PipelineStage, PipelineStageResult, PipelineStageStatus,
};
use orchestrator_core::ports::MessageBus;
use orchestrator_core::trace::TraceContext;
use orchestrator_dispatch::AgentDispatcher;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("pipeline definition has a dependency cycle")]
    CyclicDependencies,
    #[error("unknown execution id {0}")]
    UnknownExecution(Uuid),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] orchestrator_dispatch::DispatchError),
    #[error("bus error: {0}")]
    Bus(#[from] orchestrator_core::ports::BusError),
}

/// Rejects pipelines whose stage dependency graph contains a cycle
/// (spec §4.9 "cycles must be rejected at validation").
pub fn validate_definition(definition: &PipelineDefinition) -> Result<(), ExecutorError> {
    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();

    fn visit<'a>(
        stage_id: &'a str,
        definition: &'a PipelineDefinition,
        visiting: &mut HashSet<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) -> Result<(), ExecutorError> {
        if visited.contains(stage_id) {
            return Ok(());
        }
        if !visiting.insert(stage_id) {
            return Err(ExecutorError::CyclicDependencies);
        }
        if let Some(stage) = definition.stages.iter().find(|s| s.id == stage_id) {
            for dep in &stage.dependencies {
                visit(&dep.stage_id, definition, visiting, visited)?;
            }
        }
        visiting.remove(stage_id);
        visited.insert(stage_id);
        Ok(())
    }

    for stage in &definition.stages {
        visit(&stage.id, definition, &mut visiting, &mut visited)?;
    }
    Ok(())
}

/// Whether every dependency of `stage` is satisfied by `results`, per the
/// per-dependency condition (spec §4.9). Optional (`required = false`)
/// dependencies never block eligibility.
fn dependencies_satisfied(
    stage: &PipelineStage,
    results: &std::collections::HashMap<String, PipelineStageResult>,
) -> bool {
    stage.dependencies.iter().all(|dep| {
        if !dep.required {
            return true;
        }
        let Some(result) = results.get(&dep.stage_id) else {
            return false;
        };
        match dep.condition {
            DependencyCondition::Success => result.status == PipelineStageStatus::Success,
            DependencyCondition::Failure => result.status == PipelineStageStatus::Failed,
            DependencyCondition::Any => {
                matches!(
                    result.status,
                    PipelineStageStatus::Success | PipelineStageStatus::Failed | PipelineStageStatus::Skipped
                )
            }
        }
    })
}

/// Runs pipeline definitions against an `AgentDispatcher`, enforcing
/// per-stage quality gates and emitting lifecycle events on
/// `pipeline:updates` (spec §4.9).
///
/// `AgentDispatcher::on_result` demultiplexes by `workflow_id` alone
/// (spec §4.6), but parallel mode (spec §4.9) can have several stages of
/// the *same* workflow in flight at once. The executor registers exactly
/// one dispatcher handler per workflow_id — in `ensure_result_routing` —
/// and that handler demultiplexes a second time, by `task_id`, into
/// `task_results` so each stage's `dispatch_and_await` is correlated with
/// its own task rather than whichever stage happened to register last.
pub struct PipelineExecutor {
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<AgentDispatcher>,
    executions: Arc<DashMap<Uuid, RwLock<PipelineExecution>>>,
    definitions: Arc<DashMap<Uuid, PipelineDefinition>>,
    inflight: Arc<DashMap<Uuid, Vec<JoinHandle<()>>>>,
    task_results: Arc<DashMap<Uuid, oneshot::Sender<AgentResult>>>,
    routed_workflows: Arc<DashMap<Uuid, ()>>,
}

impl PipelineExecutor {
    pub fn new(bus: Arc<dyn MessageBus>, dispatcher: Arc<AgentDispatcher>) -> Self {
        Self {
            bus,
            dispatcher,
            executions: Arc::new(DashMap::new()),
            definitions: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
            task_results: Arc::new(DashMap::new()),
            routed_workflows: Arc::new(DashMap::new()),
        }
    }

    /// Validates `definition`, creates an execution record in `queued`
    /// status, publishes `execution_started`, then runs the configured
    /// execution mode (spec §4.9 "Start").
    pub async fn start(
        &self,
        definition: PipelineDefinition,
        triggered_by: impl Into<String>,
    ) -> Result<Uuid, ExecutorError> {
        validate_definition(&definition)?;

        let execution_id = Uuid::new_v4();
        let execution = PipelineExecution {
            id: execution_id,
            pipeline_id: definition.id.clone(),
            workflow_id: definition.workflow_id,
            status: ExecutionStatus::Running,
            stage_results: definition
                .stages
                .iter()
                .map(|s| {
                    (
                        s.id.clone(),
                        PipelineStageResult {
                            status: PipelineStageStatus::Pending,
                            output: serde_json::Value::Null,
                            error_code: None,
                            artifacts: vec![],
                            duration_ms: 0,
                        },
                    )
                })
                .collect(),
            triggered_by: triggered_by.into(),
            trigger: "manual".to_string(),
            branch: None,
            commit_sha: None,
        };

        self.executions.insert(execution_id, RwLock::new(execution));
        let pipeline_id = definition.id.clone();
        let execution_mode = definition.execution_mode;
        self.definitions.insert(execution_id, definition);

        events::publish(
            self.bus.as_ref(),
            PipelineEvent::ExecutionStarted { execution_id, pipeline_id },
        )
        .await?;

        let executor = self.clone_handles();
        let handle = tokio::spawn(async move {
            let outcome = match execution_mode {
                ExecutionMode::Sequential => executor.run_sequential(execution_id).await,
                ExecutionMode::Parallel => executor.run_parallel(execution_id).await,
            };
            if let Err(err) = outcome {
                warn!(%execution_id, %err, "pipeline execution ended with an error");
            }
        });
        self.inflight.entry(execution_id).or_default().push(handle);

        Ok(execution_id)
    }

    fn clone_handles(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            dispatcher: self.dispatcher.clone(),
            executions: self.executions.clone(),
            definitions: self.definitions.clone(),
            inflight: self.inflight.clone(),
            task_results: self.task_results.clone(),
            routed_workflows: self.routed_workflows.clone(),
        }
    }

    async fn run_sequential(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        loop {
            if self.is_paused_or_gone(execution_id).await {
                return Ok(());
            }
            let Some(next) = self.pick_eligible_stage(execution_id, usize::MAX).await else {
                self.mark_remaining_skipped(execution_id).await;
                break;
            };
            let outcome = self.run_stage(execution_id, &next).await?;
            if outcome == PipelineStageStatus::Failed && !self.continue_on_failure(execution_id, &next) {
                self.mark_remaining_skipped(execution_id).await;
                break;
            }
        }
        self.finalize(execution_id).await
    }

    async fn run_parallel(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        let max_parallel = self
            .definitions
            .get(&execution_id)
            .and_then(|d| d.max_parallel_stages)
            .unwrap_or(usize::MAX);

        loop {
            if self.is_paused_or_gone(execution_id).await {
                return Ok(());
            }
            let eligible = self.pick_eligible_stages(execution_id, max_parallel).await;
            if eligible.is_empty() {
                self.mark_remaining_skipped(execution_id).await;
                break;
            }

            let mut aborted = false;
            let results = futures::future::join_all(
                eligible.iter().map(|stage| self.run_stage(execution_id, stage)),
            )
            .await;

            for (stage, outcome) in eligible.iter().zip(results) {
                match outcome {
                    Ok(PipelineStageStatus::Failed) if !self.continue_on_failure(execution_id, stage) => {
                        aborted = true;
                    }
                    Err(err) => return Err(err),
                    _ => {}
                }
            }

            if aborted {
                self.mark_remaining_skipped(execution_id).await;
                break;
            }
        }
        self.finalize(execution_id).await
    }

    async fn is_paused_or_gone(&self, execution_id: Uuid) -> bool {
        let Some(execution) = self.executions.get(&execution_id) else {
            return true;
        };
        let status = execution.read().await.status;
        matches!(status, ExecutionStatus::Paused | ExecutionStatus::Cancelled)
    }

    fn continue_on_failure(&self, execution_id: Uuid, stage_id: &str) -> bool {
        self.definitions
            .get(&execution_id)
            .map(|d| d.stages.iter().any(|s| s.id == stage_id && s.continue_on_failure))
            .unwrap_or(false)
    }

    async fn pick_eligible_stage(&self, execution_id: Uuid, limit: usize) -> Option<String> {
        self.pick_eligible_stages(execution_id, limit).await.into_iter().next()
    }

    async fn pick_eligible_stages(&self, execution_id: Uuid, limit: usize) -> Vec<String> {
        let Some(definition) = self.definitions.get(&execution_id) else {
            return vec![];
        };
        let Some(execution) = self.executions.get(&execution_id) else {
            return vec![];
        };
        let execution = execution.read().await;

        let mut eligible: Vec<String> = definition
            .stages
            .iter()
            .filter(|stage| {
                execution
                    .stage_results
                    .get(&stage.id)
                    .map(|r| r.status == PipelineStageStatus::Pending)
                    .unwrap_or(false)
            })
            .filter(|stage| dependencies_satisfied(stage, &execution.stage_results))
            .map(|stage| stage.id.clone())
            .collect();

        eligible.sort();
        eligible.truncate(limit);
        eligible
    }

    async fn mark_remaining_skipped(&self, execution_id: Uuid) {
        let Some(execution) = self.executions.get(&execution_id) else {
            return;
        };
        let mut execution = execution.write().await;
        for result in execution.stage_results.values_mut() {
            if result.status == PipelineStageStatus::Pending {
                result.status = PipelineStageStatus::Skipped;
            }
        }
    }

    async fn run_stage(
        &self,
        execution_id: Uuid,
        stage_id: &str,
    ) -> Result<PipelineStageStatus, ExecutorError> {
        let Some(definition) = self.definitions.get(&execution_id) else {
            return Err(ExecutorError::UnknownExecution(execution_id));
        };
        let stage = definition
            .stages
            .iter()
            .find(|s| s.id == stage_id)
            .cloned()
            .expect("stage_id came from this definition");
        let workflow_id = definition.workflow_id;
        drop(definition);

        self.set_stage_status(execution_id, stage_id, PipelineStageStatus::Running).await;
        events::publish(
            self.bus.as_ref(),
            PipelineEvent::StageStarted {
                execution_id,
                stage_id: stage_id.to_string(),
            },
        )
        .await?;

        let started_at = Utc::now();
        let result = self.dispatch_and_await(workflow_id, &stage).await;
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;

        let (status, error_code, output) = match result {
            Ok(agent_result) if agent_result.status.is_success() => {
                let gates = &stage.quality_gates;
                let evaluation = orchestrator_gates::evaluate_all(gates, &agent_result.result.data);
                if evaluation.passed {
                    (PipelineStageStatus::Success, None, agent_result.result.data)
                } else {
                    (
                        PipelineStageStatus::Failed,
                        Some("quality_gate".to_string()),
                        agent_result.result.data,
                    )
                }
            }
            Ok(agent_result) => (
                PipelineStageStatus::Failed,
                agent_result.error.map(|e| e.code).or(Some("AGENT_ERROR".to_string())),
                serde_json::Value::Null,
            ),
            Err(_) => (
                PipelineStageStatus::Failed,
                Some("TIMEOUT".to_string()),
                serde_json::Value::Null,
            ),
        };

        self.record_stage_result(execution_id, stage_id, status, error_code.clone(), output, duration_ms, &stage.artifacts)
            .await;

        let event = match status {
            PipelineStageStatus::Success => PipelineEvent::StageCompleted {
                execution_id,
                stage_id: stage_id.to_string(),
            },
            _ => PipelineEvent::StageFailed {
                execution_id,
                stage_id: stage_id.to_string(),
                error_code: error_code.unwrap_or_default(),
            },
        };
        events::publish(self.bus.as_ref(), event).await?;

        Ok(status)
    }

    /// Registers exactly one dispatcher handler for `workflow_id`, the
    /// first time any stage of that workflow needs to await a result.
    /// The handler demultiplexes by `task_id` into `task_results` so
    /// concurrently in-flight stages of the same workflow (parallel mode,
    /// spec §4.9) each get their own result instead of clobbering each
    /// other's `AgentDispatcher::on_result` registration (spec §4.6).
    fn ensure_result_routing(&self, workflow_id: Uuid) {
        if self.routed_workflows.insert(workflow_id, ()).is_some() {
            return;
        }
        let task_results = self.task_results.clone();
        self.dispatcher.on_result(
            workflow_id,
            Arc::new(move |result: AgentResult| {
                if let Some((_, tx)) = task_results.remove(&result.task_id) {
                    let _ = tx.send(result);
                }
            }),
        );
    }

    async fn dispatch_and_await(
        &self,
        workflow_id: Uuid,
        stage: &PipelineStage,
    ) -> Result<AgentResult, ExecutorError> {
        self.ensure_result_routing(workflow_id);

        let task_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.task_results.insert(task_id, tx);

        let task = TaskEnvelope {
            message_id: Uuid::new_v4(),
            task_id,
            workflow_id,
            agent_type: stage.agent_type.clone(),
            priority: Priority::Normal,
            payload: stage.parameters.clone(),
            constraints: TaskConstraints {
                timeout_ms: stage.timeout_ms,
                max_retries: 3,
                required_confidence: 80.0,
            },
            workflow_context: WorkflowContextRef {
                current_stage: stage.id.clone(),
                extra: Default::default(),
            },
            trace: TraceContext::root(),
            metadata: TaskMetadata {
                created_at: Utc::now(),
                created_by: "pipeline-executor".to_string(),
                envelope_version: orchestrator_core::envelope::ENVELOPE_VERSION.to_string(),
            },
        };

        if let Err(err) = self.dispatcher.dispatch_task(&task).await {
            self.task_results.remove(&task_id);
            return Err(err.into());
        }

        match tokio::time::timeout(Duration::from_millis(stage.timeout_ms), rx).await {
            Ok(Ok(result)) => Ok(result),
            _ => {
                self.task_results.remove(&task_id);
                warn!(%workflow_id, stage_id = %stage.id, %task_id, "stage deadline exceeded");
                Err(ExecutorError::Bus(orchestrator_core::ports::BusError::Handler(
                    "stage timeout".to_string(),
                )))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_stage_result(
        &self,
        execution_id: Uuid,
        stage_id: &str,
        status: PipelineStageStatus,
        error_code: Option<String>,
        output: serde_json::Value,
        duration_ms: u64,
        artifacts: &[String],
    ) {
        let Some(execution) = self.executions.get(&execution_id) else {
            return;
        };
        let mut execution = execution.write().await;
        if let Some(result) = execution.stage_results.get_mut(stage_id) {
            result.status = status;
            result.error_code = error_code;
            result.output = output;
            result.duration_ms = duration_ms;
            result.artifacts = artifacts.to_vec();
        }
    }

    async fn set_stage_status(&self, execution_id: Uuid, stage_id: &str, status: PipelineStageStatus) {
        let Some(execution) = self.executions.get(&execution_id) else {
            return;
        };
        let mut execution = execution.write().await;
        if let Some(result) = execution.stage_results.get_mut(stage_id) {
            result.status = status;
        }
    }

    async fn finalize(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        let Some(execution) = self.executions.get(&execution_id) else {
            return Ok(());
        };
        let mut execution = execution.write().await;
        if execution.status == ExecutionStatus::Cancelled {
            return Ok(());
        }
        let any_failed = execution
            .stage_results
            .values()
            .any(|r| r.status == PipelineStageStatus::Failed);
        execution.status = if any_failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Success
        };
        let workflow_id = execution.workflow_id;
        drop(execution);

        self.dispatcher.off_result(workflow_id);
        self.routed_workflows.remove(&workflow_id);

        let event = if any_failed {
            PipelineEvent::ExecutionFailed {
                execution_id,
                reason: "one or more blocking stages failed".to_string(),
            }
        } else {
            PipelineEvent::ExecutionCompleted { execution_id }
        };
        events::publish(self.bus.as_ref(), event).await?;
        info!(%execution_id, "pipeline execution finalized");
        Ok(())
    }

    /// Sets status `paused`; in-flight stages already dispatched run to
    /// completion, but no new stage is scheduled until `resume` (spec §4.9).
    pub async fn pause(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        let execution = self
            .executions
            .get(&execution_id)
            .ok_or(ExecutorError::UnknownExecution(execution_id))?;
        execution.write().await.status = ExecutionStatus::Paused;
        Ok(())
    }

    /// Re-enters the scheduler for `execution_id` in its configured
    /// execution mode.
    pub async fn resume(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        {
            let execution = self
                .executions
                .get(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;
            execution.write().await.status = ExecutionStatus::Running;
        }
        let mode = self
            .definitions
            .get(&execution_id)
            .map(|d| d.execution_mode)
            .ok_or(ExecutorError::UnknownExecution(execution_id))?;

        let executor = self.clone_handles();
        let handle = tokio::spawn(async move {
            let outcome = match mode {
                ExecutionMode::Sequential => executor.run_sequential(execution_id).await,
                ExecutionMode::Parallel => executor.run_parallel(execution_id).await,
            };
            if let Err(err) = outcome {
                warn!(%execution_id, %err, "pipeline execution ended with an error");
            }
        });
        self.inflight.entry(execution_id).or_default().push(handle);
        Ok(())
    }

    /// Sets status `cancelled`, removes the execution from the active
    /// table, and publishes `execution_failed` with a cancellation reason.
    /// In-flight stages are not killed; their results are ignored on
    /// arrival because the handler table no longer targets them once
    /// `off_result` runs (spec §4.9).
    pub async fn cancel(&self, execution_id: Uuid, reason: impl Into<String>) -> Result<(), ExecutorError> {
        let workflow_id = {
            let execution = self
                .executions
                .get(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;
            let mut execution = execution.write().await;
            execution.status = ExecutionStatus::Cancelled;
            execution.workflow_id
        };
        self.dispatcher.off_result(workflow_id);
        self.routed_workflows.remove(&workflow_id);

        events::publish(
            self.bus.as_ref(),
            PipelineEvent::ExecutionFailed {
                execution_id,
                reason: reason.into(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn execution(&self, execution_id: Uuid) -> Option<PipelineExecution> {
        let execution = self.executions.get(&execution_id)?;
        Some(execution.read().await.clone())
    }

    /// Awaits every in-flight future tracked for any execution, then
    /// clears both the execution and definition tables (spec §4.9
    /// "Cleanup").
    pub async fn shutdown(&self) {
        for mut entry in self.inflight.iter_mut() {
            for handle in entry.value_mut().drain(..) {
                let _ = handle.await;
            }
        }
        self.inflight.clear();
        self.executions.clear();
        self.definitions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::envelope::{AgentStatus, ResultData, ResultMetrics};
    use orchestrator_core::pipeline_types::{GateOperator, QualityGateSpec, StageDependency};
    use orchestrator_core::ports::{BusMessage, MessageHandler, PublishOptions, SubscribeOptions};
    use orchestrator_dispatch::InMemoryAgentRegistry;
    use serde_json::json;

    /// Echoes every task it receives back as a successful result carrying
    /// `response_payload`, simulating an agent process for tests.
    fn spawn_stub_agent(bus: Arc<orchestrator_bus::InMemoryBus>, agent_type: &str, response_payload: serde_json::Value) {
        let topic = format!("agent:tasks:{agent_type}");
        let agent_type = agent_type.to_string();
        struct Stub {
            bus: Arc<orchestrator_bus::InMemoryBus>,
            agent_type: String,
            response_payload: serde_json::Value,
        }
        impl MessageHandler for Stub {
            fn handle(&self, message: BusMessage) -> orchestrator_core::ports::HandlerFuture {
                let bus = self.bus.clone();
                let agent_type = self.agent_type.clone();
                let response_payload = self.response_payload.clone();
                Box::pin(async move {
                    let task: TaskEnvelope = serde_json::from_value(message.payload).unwrap();
                    let result = AgentResult {
                        task_id: task.task_id,
                        workflow_id: task.workflow_id,
                        agent_id: format!("{agent_type}-1"),
                        agent_type: agent_type.clone(),
                        success: true,
                        status: AgentStatus::Success,
                        action: "run".to_string(),
                        result: ResultData {
                            data: response_payload,
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
        tokio::spawn(async move {
            bus.subscribe(
                &topic,
                Arc::new(Stub {
                    bus: bus.clone(),
                    agent_type,
                    response_payload,
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        });
    }

    fn stage(id: &str, agent_type: &str, deps: Vec<&str>) -> PipelineStage {
        PipelineStage {
            id: id.to_string(),
            name: id.to_string(),
            agent_type: agent_type.to_string(),
            action: "run".to_string(),
            parameters: json!({}),
            dependencies: deps
                .into_iter()
                .map(|d| StageDependency {
                    stage_id: d.to_string(),
                    required: true,
                    condition: DependencyCondition::Success,
                })
                .collect(),
            quality_gates: vec![],
            timeout_ms: 2000,
            continue_on_failure: false,
            artifacts: vec![],
        }
    }

    async fn setup() -> (Arc<orchestrator_bus::InMemoryBus>, Arc<AgentDispatcher>, PipelineExecutor) {
        let bus = orchestrator_bus::InMemoryBus::new();
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let dispatcher = AgentDispatcher::new(bus.clone(), registry);
        dispatcher.start().await.unwrap();
        let executor = PipelineExecutor::new(bus.clone(), dispatcher.clone());
        (bus, dispatcher, executor)
    }

    #[tokio::test]
    async fn sequential_pipeline_runs_dependent_stages_in_order() {
        let (bus, _dispatcher, executor) = setup().await;
        spawn_stub_agent(bus.clone(), "scaffold", json!({"ok": true}));
        spawn_stub_agent(bus.clone(), "build", json!({"ok": true}));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let definition = PipelineDefinition {
            id: "demo".to_string(),
            name: "demo".to_string(),
            version: "1".to_string(),
            workflow_id: Uuid::new_v4(),
            execution_mode: ExecutionMode::Sequential,
            stages: vec![stage("a", "scaffold", vec![]), stage("b", "build", vec!["a"])],
            max_parallel_stages: None,
        };

        let execution_id = executor.start(definition, "tester").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let execution = executor.execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.stage_results["a"].status, PipelineStageStatus::Success);
        assert_eq!(execution.stage_results["b"].status, PipelineStageStatus::Success);
    }

    #[tokio::test]
    async fn parallel_independent_stages_each_receive_their_own_result() {
        let (bus, _dispatcher, executor) = setup().await;
        spawn_stub_agent(bus.clone(), "scaffold", json!({"from": "scaffold"}));
        spawn_stub_agent(bus.clone(), "build", json!({"from": "build"}));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let definition = PipelineDefinition {
            id: "demo".to_string(),
            name: "demo".to_string(),
            version: "1".to_string(),
            workflow_id: Uuid::new_v4(),
            execution_mode: ExecutionMode::Parallel,
            stages: vec![stage("a", "scaffold", vec![]), stage("b", "build", vec![])],
            max_parallel_stages: None,
        };

        let execution_id = executor.start(definition, "tester").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let execution = executor.execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.stage_results["a"].status, PipelineStageStatus::Success);
        assert_eq!(execution.stage_results["b"].status, PipelineStageStatus::Success);
        assert_eq!(execution.stage_results["a"].output, json!({"from": "scaffold"}));
        assert_eq!(execution.stage_results["b"].output, json!({"from": "build"}));
    }

    #[tokio::test]
    async fn blocking_quality_gate_failure_fails_the_stage_and_aborts() {
        let (bus, _dispatcher, executor) = setup().await;
        spawn_stub_agent(bus.clone(), "scaffold", json!({"coverage": 10}));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut first = stage("a", "scaffold", vec![]);
        first.quality_gates = vec![QualityGateSpec {
            name: "coverage".to_string(),
            metric: "coverage".to_string(),
            operator: GateOperator::Ge,
            threshold: json!(80),
            blocking: true,
        }];
        let definition = PipelineDefinition {
            id: "demo".to_string(),
            name: "demo".to_string(),
            version: "1".to_string(),
            workflow_id: Uuid::new_v4(),
            execution_mode: ExecutionMode::Sequential,
            stages: vec![first, stage("b", "build", vec!["a"])],
            max_parallel_stages: None,
        };

        let execution_id = executor.start(definition, "tester").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let execution = executor.execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.stage_results["a"].error_code.as_deref(), Some("quality_gate"));
        assert_eq!(execution.stage_results["b"].status, PipelineStageStatus::Skipped);
    }

    #[tokio::test]
    async fn cancel_marks_execution_cancelled_and_publishes_execution_failed() {
        let (_bus, _dispatcher, executor) = setup().await;
        let definition = PipelineDefinition {
            id: "demo".to_string(),
            name: "demo".to_string(),
            version: "1".to_string(),
            workflow_id: Uuid::new_v4(),
            execution_mode: ExecutionMode::Sequential,
            stages: vec![stage("a", "never_responds", vec![])],
            max_parallel_stages: None,
        };
        let execution_id = executor.start(definition, "tester").await.unwrap();
        executor.cancel(execution_id, "user requested").await.unwrap();

        let execution = executor.execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn cyclic_dependencies_are_rejected_at_validation() {
        let mut a = stage("a", "scaffold", vec!["b"]);
        let b = stage("b", "build", vec!["a"]);
        a.dependencies[0].required = true;
        let definition = PipelineDefinition {
            id: "demo".to_string(),
            name: "demo".to_string(),
            version: "1".to_string(),
            workflow_id: Uuid::new_v4(),
            execution_mode: ExecutionMode::Sequential,
            stages: vec![a, b],
            max_parallel_stages: None,
        };
        assert!(matches!(
            validate_definition(&definition),
            Err(ExecutorError::CyclicDependencies)
        ));
    }
}
