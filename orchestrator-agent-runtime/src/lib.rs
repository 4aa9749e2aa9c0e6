//! ABOUTME: AgentRuntime — the skeleton every agent process links against (spec §4.11)
//! ABOUTME: Subscribes to its own task topic, validates envelopes, runs user logic, publishes canonical results

use async_trait::async_trait;
use chrono::Utc;
use orchestrator_core::envelope::{
    validate_raw, AgentResult, AgentStatus, EnvelopeError, ResultData, ResultError, ResultMetrics,
    TaskEnvelope, ENVELOPE_VERSION,
};
use orchestrator_core::ports::{
    AgentRegistration, AgentRegistry, BusError, BusMessage, MessageBus, MessageHandler,
    PublishOptions, SubscribeOptions, SubscriptionId,
};
use orchestrator_resilience::circuit_breaker::{CallError, CircuitBreaker, CircuitBreakerConfig, TimeoutMarker};
use orchestrator_resilience::retry::{retry, RetryError, RetryOptions};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const RESULTS_TOPIC: &str = "orchestrator:results";
pub const RESULTS_STREAM: &str = "stream:orchestrator:results";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// The outcome a user-supplied `execute` returns on success. Mapped onto
/// the canonical `AgentResult` envelope by the runtime (spec §4.11 step 4).
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub action: String,
    pub data: Value,
    pub artifacts: Option<Vec<Value>>,
    pub metrics_extra: serde_json::Map<String, Value>,
    pub warnings: Vec<String>,
}

/// The error a user-supplied `execute` returns on failure. Never crosses
/// the subscription boundary as a panic or exception — always marshaled
/// into a `failed` result envelope (spec §4.11 step 4, §7).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AgentExecutionError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl AgentExecutionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<TimeoutMarker> for AgentExecutionError {
    fn from(_: TimeoutMarker) -> Self {
        Self {
            code: "TIMEOUT".to_string(),
            message: "execute exceeded the circuit breaker's per-call timeout".to_string(),
            retryable: true,
        }
    }
}

/// User-supplied task logic. Implemented once per agent type; everything
/// else (subscription, validation, retries, result publication, health)
/// is provided by `AgentRuntime` (spec §4.11).
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn execute(&self, envelope: TaskEnvelope) -> Result<AgentOutcome, AgentExecutionError>;
}

#[async_trait]
impl<F, Fut> AgentHandler for F
where
    F: Fn(TaskEnvelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<AgentOutcome, AgentExecutionError>> + Send,
{
    async fn execute(&self, envelope: TaskEnvelope) -> Result<AgentOutcome, AgentExecutionError> {
        (self)(envelope).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Fixed identification and capability data registered at startup (spec
/// §4.11 "register `agent_id` ... with capabilities and version").
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_type: String,
    pub version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Default)]
struct Counters {
    tasks_processed: AtomicU64,
    errors_count: AtomicU64,
    last_task_at: RwLock<Option<chrono::DateTime<Utc>>>,
}

impl Counters {
    fn health(&self) -> HealthStatus {
        match self.errors_count.load(Ordering::SeqCst) {
            n if n < 6 => HealthStatus::Healthy,
            n if n <= 10 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

struct TaskHandlerAdapter {
    runtime: Weak<AgentRuntime>,
}

impl MessageHandler for TaskHandlerAdapter {
    fn handle(&self, message: BusMessage) -> orchestrator_core::ports::HandlerFuture {
        let runtime = self.runtime.clone();
        Box::pin(async move {
            // spec §4.11/§7: the subscription handler must never throw —
            // every error path below resolves to a published `failed`
            // result, not a propagated `Err`.
            if let Some(runtime) = runtime.upgrade() {
                runtime.on_task(message.payload).await;
            }
            Ok(())
        })
    }
}

/// One instance per agent process (spec §4.11). Owns its publisher/
/// subscriber bus handle, its circuit breaker, and its health counters.
pub struct AgentRuntime {
    self_ref: Weak<AgentRuntime>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<dyn AgentRegistry>,
    config: AgentConfig,
    agent_id: String,
    handler: Arc<dyn AgentHandler>,
    breaker: Arc<CircuitBreaker<AgentExecutionError>>,
    counters: Counters,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl AgentRuntime {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn AgentRegistry>,
        config: AgentConfig,
        handler: Arc<dyn AgentHandler>,
    ) -> Arc<Self> {
        let agent_id = format!("{}-{}", config.agent_type, short_uuid());
        let breaker = CircuitBreaker::new(
            format!("agent-runtime:{}", config.agent_type),
            CircuitBreakerConfig::default(),
        );
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            bus,
            registry,
            config,
            agent_id,
            handler,
            breaker,
            counters: Counters::default(),
            subscription: Mutex::new(None),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn health(&self) -> HealthStatus {
        self.counters.health()
    }

    pub fn tasks_processed(&self) -> u64 {
        self.counters.tasks_processed.load(Ordering::SeqCst)
    }

    pub fn errors_count(&self) -> u64 {
        self.counters.errors_count.load(Ordering::SeqCst)
    }

    /// Subscribes to `agent:tasks:<agent_type>` under
    /// `agent-<agent_type>-group` reading only new records, and registers
    /// this agent's id in the registry (spec §4.11 "At initialization").
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let mut guard = self.subscription.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let topic = format!("agent:tasks:{}", self.config.agent_type);
        let group = format!("agent-{}-group", self.config.agent_type);
        let id = self
            .bus
            .subscribe(
                &topic,
                Arc::new(TaskHandlerAdapter {
                    runtime: self.self_ref.clone(),
                }),
                SubscribeOptions {
                    consumer_group: Some(group),
                    from_beginning: false,
                },
            )
            .await?;
        *guard = Some(id);
        drop(guard);

        self.registry
            .register(AgentRegistration {
                agent_id: self.agent_id.clone(),
                agent_type: self.config.agent_type.clone(),
                version: self.config.version.clone(),
                capabilities: self.config.capabilities.clone(),
                registered_at: Utc::now(),
                status: "healthy".to_string(),
                last_heartbeat: Utc::now(),
            })
            .await?;

        debug!(agent_id = %self.agent_id, agent_type = %self.config.agent_type, "agent runtime started");
        Ok(())
    }

    async fn on_task(&self, payload: Value) {
        let envelope = match validate_raw(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "rejecting malformed task envelope");
                self.publish_validation_failure(&payload, err).await;
                return;
            }
        };

        let task_id = envelope.task_id;
        let workflow_id = envelope.workflow_id;
        let stage = envelope.workflow_context.current_stage.clone();
        let trace = envelope.trace.clone();

        let outcome = self.run_with_resilience(envelope).await;
        self.counters.tasks_processed.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_task_at.write() = Some(Utc::now());

        let result = match outcome {
            Ok(outcome) => canonical_success(
                task_id,
                workflow_id,
                &self.agent_id,
                &self.config.agent_type,
                &stage,
                outcome,
            ),
            Err(exec_err) => {
                self.counters.errors_count.fetch_add(1, Ordering::SeqCst);
                canonical_failure(
                    task_id,
                    workflow_id,
                    &self.agent_id,
                    &self.config.agent_type,
                    &stage,
                    exec_err.code,
                    exec_err.message,
                    exec_err.retryable,
                )
            }
        };

        debug!(?trace, task_id = %task_id, "publishing agent result");
        if let Err(err) = self.publish_result(&result).await {
            error!(%err, task_id = %task_id, "failed to publish agent result");
        }
    }

    /// Invokes `execute` through `retry` (preset `standard`) wrapping a
    /// circuit breaker around the call, per spec §4.11 step 3.
    async fn run_with_resilience(&self, envelope: TaskEnvelope) -> Result<AgentOutcome, AgentExecutionError> {
        let handler = self.handler.clone();
        let breaker = self.breaker.clone();

        let mut opts = RetryOptions::<AgentExecutionError>::standard();
        opts.should_retry = Box::new(|error, _attempt| error.retryable);

        retry(
            move || {
                let handler = handler.clone();
                let breaker = breaker.clone();
                let envelope = envelope.clone();
                async move {
                    breaker
                        .call(move || {
                            let handler = handler.clone();
                            let envelope = envelope.clone();
                            async move { handler.execute(envelope).await }
                        })
                        .await
                        .map_err(|err| match err {
                            CallError::Open(circuit_err) => {
                                AgentExecutionError::new("CIRCUIT_OPEN", circuit_err.to_string())
                            }
                            CallError::Failed(exec_err) => exec_err,
                        })
                }
            },
            opts,
        )
        .await
        .map_err(RetryError::into_inner)
    }

    async fn publish_result(&self, result: &AgentResult) -> Result<(), RuntimeError> {
        let payload = serde_json::to_value(result).expect("AgentResult always serializes");
        self.bus
            .publish(
                RESULTS_TOPIC,
                payload,
                PublishOptions {
                    key: Some(result.workflow_id.to_string()),
                    mirror_to_stream: Some(RESULTS_STREAM.to_string()),
                    headers: Default::default(),
                },
            )
            .await?;
        Ok(())
    }

    async fn publish_validation_failure(&self, payload: &Value, err: EnvelopeError) {
        self.counters.errors_count.fetch_add(1, Ordering::SeqCst);
        let task_id = payload
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok())
            .unwrap_or_else(Uuid::new_v4);
        let workflow_id = payload
            .get("workflow_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok())
            .unwrap_or_else(Uuid::new_v4);
        let stage = payload
            .get("workflow_context")
            .and_then(|c| c.get("current_stage"))
            .and_then(|v| v.as_str())
            .unwrap_or(&self.config.agent_type)
            .to_string();

        let result = canonical_failure(
            task_id,
            workflow_id,
            &self.agent_id,
            &self.config.agent_type,
            &stage,
            "VALIDATION_ERROR",
            err.to_string(),
            false,
        );
        let _ = self.publish_result(&result).await;
    }

    /// Deregisters first, then unsubscribes, then closes bus connections
    /// (spec §4.11 "At shutdown"). Order matters: a late task must never
    /// be dispatched to an agent_id no longer in the registry.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.registry.deregister(&self.agent_id).await?;
        if let Some(id) = self.subscription.lock().await.take() {
            self.bus.unsubscribe(id).await?;
        }
        self.bus.disconnect().await?;
        Ok(())
    }
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[allow(clippy::too_many_arguments)]
fn canonical_success(
    task_id: Uuid,
    workflow_id: Uuid,
    agent_id: &str,
    agent_type: &str,
    stage: &str,
    outcome: AgentOutcome,
) -> AgentResult {
    AgentResult {
        task_id,
        workflow_id,
        agent_id: agent_id.to_string(),
        agent_type: agent_type.to_string(),
        success: AgentStatus::Success.is_success(),
        status: AgentStatus::Success,
        action: outcome.action,
        result: ResultData {
            data: outcome.data,
            artifacts: outcome.artifacts,
            metrics: ResultMetrics {
                duration_ms: 0,
                extra: outcome.metrics_extra,
            },
        },
        error: None,
        warnings: outcome.warnings,
        stage: stage.to_string(),
        timestamp: Utc::now(),
        version: ENVELOPE_VERSION.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn canonical_failure(
    task_id: Uuid,
    workflow_id: Uuid,
    agent_id: &str,
    agent_type: &str,
    stage: &str,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> AgentResult {
    AgentResult {
        task_id,
        workflow_id,
        agent_id: agent_id.to_string(),
        agent_type: agent_type.to_string(),
        success: AgentStatus::Failed.is_success(),
        status: AgentStatus::Failed,
        action: "execute".to_string(),
        result: ResultData {
            data: Value::Null,
            artifacts: None,
            metrics: ResultMetrics {
                duration_ms: 0,
                extra: Default::default(),
            },
        },
        error: Some(ResultError {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
        warnings: vec![],
        stage: stage.to_string(),
        timestamp: Utc::now(),
        version: ENVELOPE_VERSION.to_string(),
    }
}
