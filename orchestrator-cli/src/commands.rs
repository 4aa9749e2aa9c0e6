//! ABOUTME: Command implementations: `run` drives a workflow to completion, `validate` checks its graph

use crate::cli::{Command, OutputFormat};
use crate::output::format_workflow_result;
use anyhow::Context;
use orchestrator_core::envelope::{AgentResult, AgentStatus, ResultData, ResultMetrics, TaskEnvelope};
use orchestrator_core::ports::{
    BusMessage, HandlerFuture, MessageBus, MessageHandler, PublishOptions, SubscribeOptions,
};
use orchestrator_core::workflow_types::WorkflowStatus;
use orchestrator_dispatch::{AgentDispatcher, InMemoryAgentRegistry};
use orchestrator_workflow::WorkflowEngine;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Exit codes from spec §6.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_VALIDATION_ERROR: i32 = 1;
pub const EXIT_CONFIGURATION_ERROR: i32 = 2;
pub const EXIT_BUS_ERROR: i32 = 3;
pub const EXIT_TIMEOUT: i32 = 4;
pub const EXIT_CANCELLED: i32 = 5;

pub async fn run_command(
    command: Command,
    output: OutputFormat,
    config: orchestrator_config::OrchestratorConfig,
) -> anyhow::Result<i32> {
    match command {
        Command::Validate { workflow_file } => validate_workflow(&workflow_file).await,
        Command::Run {
            workflow_file,
            input,
            timeout_ms,
        } => run_workflow(&workflow_file, input.as_deref(), timeout_ms, output, &config).await,
    }
}

async fn validate_workflow(workflow_file: &Path) -> anyhow::Result<i32> {
    let definition = match orchestrator_workflow::loader::load_from_path(workflow_file).await {
        Ok(def) => def,
        Err(err) => {
            eprintln!("invalid workflow definition: {err}");
            return Ok(EXIT_VALIDATION_ERROR);
        }
    };
    match WorkflowEngine::new(definition) {
        Ok(_) => {
            println!("workflow definition is valid");
            Ok(EXIT_SUCCESS)
        }
        Err(err) => {
            eprintln!("invalid workflow graph: {err}");
            Ok(EXIT_VALIDATION_ERROR)
        }
    }
}

/// A stub agent that immediately replies `success` with the task's own
/// payload echoed back, so the full create→dispatch→result→advance loop
/// runs end to end without any real agent process attached.
struct StubAgent {
    bus: Arc<orchestrator_bus::InMemoryBus>,
    agent_type: String,
}

impl MessageHandler for StubAgent {
    fn handle(&self, message: BusMessage) -> HandlerFuture {
        let bus = self.bus.clone();
        let agent_type = self.agent_type.clone();
        Box::pin(async move {
            let task: TaskEnvelope = serde_json::from_value(message.payload)
                .map_err(|err| orchestrator_core::ports::BusError::Handler(err.to_string()))?;
            let result = AgentResult {
                task_id: task.task_id,
                workflow_id: task.workflow_id,
                agent_id: format!("{agent_type}-stub"),
                agent_type: agent_type.clone(),
                success: true,
                status: AgentStatus::Success,
                action: "stub".to_string(),
                result: ResultData {
                    data: task.payload,
                    artifacts: None,
                    metrics: ResultMetrics {
                        duration_ms: 1,
                        extra: Default::default(),
                    },
                },
                error: None,
                warnings: vec![],
                stage: task.workflow_context.current_stage,
                timestamp: chrono::Utc::now(),
                version: orchestrator_core::envelope::ENVELOPE_VERSION.to_string(),
            };
            bus.publish(
                orchestrator_dispatch::RESULTS_TOPIC,
                serde_json::to_value(&result).expect("AgentResult always serializes"),
                PublishOptions {
                    key: Some(task.workflow_id.to_string()),
                    mirror_to_stream: Some(format!("stream:{}", orchestrator_dispatch::RESULTS_TOPIC)),
                    ..Default::default()
                },
            )
            .await?;
            Ok(())
        })
    }
}

async fn run_workflow(
    workflow_file: &Path,
    input_path: Option<&Path>,
    timeout_ms: u64,
    output: OutputFormat,
    config: &orchestrator_config::OrchestratorConfig,
) -> anyhow::Result<i32> {
    let definition = match orchestrator_workflow::loader::load_from_path(workflow_file).await {
        Ok(def) => def,
        Err(err) => {
            eprintln!("invalid workflow definition: {err}");
            return Ok(EXIT_VALIDATION_ERROR);
        }
    };

    let input_data = match input_path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading input file {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing input file {}", path.display()))?
        }
        None => serde_json::json!({}),
    };

    if config.bus.kind != orchestrator_config::BusKind::InMemory {
        tracing::warn!(
            "bus.kind = {:?} is configured, but `orchestrator run` always drives its stub agents over an in-memory bus",
            config.bus.kind
        );
    }

    let bus = orchestrator_bus::InMemoryBus::new();
    let registry = Arc::new(InMemoryAgentRegistry::new());
    let dispatcher = AgentDispatcher::with_handler_ttl(bus.clone(), registry, config.dispatch.handler_ttl_ms);
    if dispatcher.start().await.is_err() {
        eprintln!("failed to subscribe to the result channel");
        return Ok(EXIT_BUS_ERROR);
    }

    let mut agent_types: Vec<&str> = definition.stages.values().map(|s| s.agent_type.as_str()).collect();
    agent_types.sort_unstable();
    agent_types.dedup();
    for agent_type in agent_types {
        let topic = format!("agent:tasks:{agent_type}");
        if bus
            .subscribe(
                &topic,
                Arc::new(StubAgent {
                    bus: bus.clone(),
                    agent_type: agent_type.to_string(),
                }),
                SubscribeOptions::default(),
            )
            .await
            .is_err()
        {
            eprintln!("failed to subscribe stub agent for {agent_type}");
            return Ok(EXIT_BUS_ERROR);
        }
    }

    let store = Arc::new(orchestrator_service::InMemoryWorkflowStore::new());
    let service = orchestrator_service::WorkflowService::new(bus, dispatcher, store);

    let workflow_id = service.create(definition, input_data).await?;
    info!(%workflow_id, "workflow created");
    service.start(workflow_id).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        match service.status(workflow_id) {
            Some(WorkflowStatus::Succeeded) | Some(WorkflowStatus::Failed) => break,
            Some(WorkflowStatus::Cancelled) => {
                println!("workflow {workflow_id} was cancelled");
                return Ok(EXIT_CANCELLED);
            }
            _ => {}
        }
        if tokio::time::Instant::now() >= deadline {
            eprintln!("workflow {workflow_id} did not reach a terminal state within {timeout_ms}ms");
            return Ok(EXIT_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let status = service.status(workflow_id).unwrap();
    let ctx = service
        .context(workflow_id)
        .await
        .context("workflow context missing after completion")?;
    let engine = WorkflowEngine::new(ctx.definition.clone())?;
    let result = engine.build_workflow_result(&ctx, status);

    println!("{}", format_workflow_result(&result, output)?);

    // Spec §6 has no dedicated "workflow failed" code; a failed terminal
    // status is reported under the same code as a validation error since
    // both mean "the CLI's job did not produce a usable result" (see
    // DESIGN.md).
    Ok(if status == WorkflowStatus::Succeeded {
        EXIT_SUCCESS
    } else {
        EXIT_VALIDATION_ERROR
    })
}
