//! ABOUTME: AgentDispatcher — publishes task envelopes, demultiplexes results by workflow_id (spec §4.6)
//! ABOUTME: Owns exclusively its handler table; never tears down its single result subscription on error

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orchestrator_core::envelope::{validate_task_envelope, AgentResult, EnvelopeError, TaskEnvelope};
use orchestrator_core::ports::{
    AgentRegistration, AgentRegistry, BusError, BusMessage, MessageBus, MessageHandler,
    PublishOptions, SubscribeOptions, SubscriptionId,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub const DEFAULT_HANDLER_TTL_MS: u64 = 3_600_000;
pub const RESULTS_TOPIC: &str = "orchestrator:results";
pub const RESULTS_CONSUMER_GROUP: &str = "dispatcher-group";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid task envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Invoked with a result envelope once its `workflow_id` matches a
/// registered handler (spec §4.6 step 3).
pub trait ResultHandler: Send + Sync {
    fn handle(&self, result: AgentResult);
}

impl<F> ResultHandler for F
where
    F: Fn(AgentResult) + Send + Sync,
{
    fn handle(&self, result: AgentResult) {
        (self)(result)
    }
}

struct HandlerEntry {
    handler: Arc<dyn ResultHandler>,
    registered_at: DateTime<Utc>,
    timeout: JoinHandle<()>,
}

/// Publishes task envelopes on a per-agent-type channel and demultiplexes
/// the single shared `orchestrator:results` subscription by `workflow_id`
/// (spec §4.6). Exclusively owns `handlers`; no other component touches it.
pub struct AgentDispatcher {
    self_ref: Weak<AgentDispatcher>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<dyn AgentRegistry>,
    handlers: DashMap<uuid::Uuid, HandlerEntry>,
    handler_ttl_ms: u64,
    subscription: Mutex<Option<SubscriptionId>>,
    parse_error_count: AtomicU64,
}

struct ResultsHandler {
    dispatcher: Weak<AgentDispatcher>,
}

impl MessageHandler for ResultsHandler {
    fn handle(&self, message: BusMessage) -> orchestrator_core::ports::HandlerFuture {
        let dispatcher = self.dispatcher.clone();
        Box::pin(async move {
            let Some(dispatcher) = dispatcher.upgrade() else {
                return Ok(());
            };
            dispatcher.on_message(message.payload).await;
            Ok(())
        })
    }
}

impl AgentDispatcher {
    pub fn new(bus: Arc<dyn MessageBus>, registry: Arc<dyn AgentRegistry>) -> Arc<Self> {
        Self::with_handler_ttl(bus, registry, DEFAULT_HANDLER_TTL_MS)
    }

    pub fn with_handler_ttl(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn AgentRegistry>,
        handler_ttl_ms: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            bus,
            registry,
            handlers: DashMap::new(),
            handler_ttl_ms,
            subscription: Mutex::new(None),
            parse_error_count: AtomicU64::new(0),
        })
    }

    /// Single subscription to `orchestrator:results` under a shared
    /// consumer group (spec §4.6). Idempotent: a second call is a no-op
    /// once subscribed.
    pub async fn start(self: &Arc<Self>) -> Result<(), DispatchError> {
        let mut guard = self.subscription.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let handler = Arc::new(ResultsHandler {
            dispatcher: self.self_ref.clone(),
        });
        let id = self
            .bus
            .subscribe(
                RESULTS_TOPIC,
                handler,
                SubscribeOptions {
                    consumer_group: Some(RESULTS_CONSUMER_GROUP.to_string()),
                    from_beginning: false,
                },
            )
            .await?;
        *guard = Some(id);
        Ok(())
    }

    /// Validates then publishes on `agent:tasks:<agent_type>`, keyed and
    /// mirrored per spec §4.6.
    pub async fn dispatch_task(&self, task: &TaskEnvelope) -> Result<(), DispatchError> {
        validate_task_envelope(task)?;
        let topic = format!("agent:tasks:{}", task.agent_type);
        let payload = serde_json::to_value(task).expect("TaskEnvelope always serializes");
        self.bus
            .publish(
                &topic,
                payload,
                PublishOptions {
                    key: Some(task.workflow_id.to_string()),
                    mirror_to_stream: Some(format!("stream:{topic}")),
                    headers: Default::default(),
                },
            )
            .await?;
        debug!(workflow_id = %task.workflow_id, agent_type = %task.agent_type, "dispatched task");
        Ok(())
    }

    /// Registers `handler` for `workflow_id`, replacing any existing
    /// handler (and its TTL timer) for the same workflow — exactly one
    /// timer survives (spec §4.6, §8 idempotence property).
    pub fn on_result(self: &Arc<Self>, workflow_id: uuid::Uuid, handler: Arc<dyn ResultHandler>) {
        let dispatcher = self.clone();
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(dispatcher.handler_ttl_ms)).await;
            if dispatcher.handlers.remove(&workflow_id).is_some() {
                warn!(%workflow_id, "handler TTL expired, removing stale registration");
            }
        });

        if let Some((_, old)) = self.handlers.remove(&workflow_id) {
            old.timeout.abort();
        }
        self.handlers.insert(
            workflow_id,
            HandlerEntry {
                handler,
                registered_at: Utc::now(),
                timeout,
            },
        );
    }

    pub fn off_result(&self, workflow_id: uuid::Uuid) {
        if let Some((_, entry)) = self.handlers.remove(&workflow_id) {
            entry.timeout.abort();
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn registered_at(&self, workflow_id: uuid::Uuid) -> Option<DateTime<Utc>> {
        self.handlers.get(&workflow_id).map(|e| e.registered_at)
    }

    async fn on_message(&self, payload: serde_json::Value) {
        let result: AgentResult = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(err) => {
                self.parse_error_count.fetch_add(1, Ordering::SeqCst);
                warn!(%err, "failed to parse result envelope, discarding");
                return;
            }
        };

        let Some(entry) = self.handlers.get(&result.workflow_id) else {
            debug!(workflow_id = %result.workflow_id, "no handler registered, discarding result");
            return;
        };

        let handler = entry.handler.clone();
        drop(entry);

        let workflow_id = result.workflow_id;
        let is_terminal = result.status.is_terminal();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.handle(result)));
        if outcome.is_err() {
            error!(%workflow_id, "result handler panicked; subscription stays alive");
        }

        if is_terminal {
            self.off_result(workflow_id);
        }
    }

    pub fn parse_error_count(&self) -> u64 {
        self.parse_error_count.load(Ordering::SeqCst)
    }

    /// Registry read failures surface as an empty list, never an error
    /// (spec §4.6).
    pub async fn get_registered_agents(&self) -> Vec<AgentRegistration> {
        self.registry.list().await
    }

    pub async fn disconnect(&self) -> Result<(), DispatchError> {
        for entry in self.handlers.iter() {
            entry.value().timeout.abort();
        }
        self.handlers.clear();
        if let Some(id) = self.subscription.lock().await.take() {
            self.bus.unsubscribe(id).await?;
        }
        self.bus.disconnect().await?;
        Ok(())
    }
}

/// An `AgentRegistry` over an in-memory map, for tests and the CLI demo.
pub struct InMemoryAgentRegistry {
    entries: DashMap<String, AgentRegistration>,
}

impl Default for InMemoryAgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn register(&self, registration: AgentRegistration) -> Result<(), BusError> {
        self.entries.insert(registration.agent_id.clone(), registration);
        Ok(())
    }

    async fn deregister(&self, agent_id: &str) -> Result<(), BusError> {
        self.entries.remove(agent_id);
        Ok(())
    }

    async fn list(&self) -> Vec<AgentRegistration> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_bus::InMemoryBus;
    use orchestrator_core::envelope::{
        AgentStatus, ResultData, ResultMetrics, TaskConstraints, TaskMetadata, WorkflowContextRef,
    };
    use orchestrator_core::trace::TraceContext;
    use std::sync::atomic::AtomicBool;
    use uuid::Uuid;

    fn sample_task(workflow_id: Uuid) -> TaskEnvelope {
        TaskEnvelope {
            message_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            workflow_id,
            agent_type: "scaffold".to_string(),
            priority: orchestrator_core::envelope::Priority::Normal,
            payload: serde_json::json!({}),
            constraints: TaskConstraints {
                timeout_ms: 1000,
                max_retries: 3,
                required_confidence: 80.0,
            },
            workflow_context: WorkflowContextRef {
                current_stage: "A".to_string(),
                extra: Default::default(),
            },
            trace: TraceContext::root(),
            metadata: TaskMetadata {
                created_at: Utc::now(),
                created_by: "test".to_string(),
                envelope_version: orchestrator_core::envelope::ENVELOPE_VERSION.to_string(),
            },
        }
    }

    fn sample_result(workflow_id: Uuid, status: AgentStatus) -> AgentResult {
        AgentResult {
            task_id: Uuid::new_v4(),
            workflow_id,
            agent_id: "scaffold-1".to_string(),
            agent_type: "scaffold".to_string(),
            success: status.is_success(),
            status,
            action: "scaffold".to_string(),
            result: ResultData {
                data: serde_json::json!({}),
                artifacts: None,
                metrics: ResultMetrics {
                    duration_ms: 5,
                    extra: Default::default(),
                },
            },
            error: None,
            warnings: vec![],
            stage: "A".to_string(),
            timestamp: Utc::now(),
            version: "1.0.0".to_string(),
        }
    }

    #[tokio::test]
    async fn dispatch_publishes_on_per_agent_type_topic() {
        let bus = InMemoryBus::new();
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let dispatcher = AgentDispatcher::new(bus.clone(), registry);

        let received = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        bus.subscribe(
            "agent:tasks:scaffold",
            Arc::new(move |msg: BusMessage| {
                let received2 = received2.clone();
                let payload = msg.payload;
                Box::pin(async move {
                    *received2.lock().await = Some(payload);
                    Ok(())
                }) as orchestrator_core::ports::HandlerFuture
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

        let workflow_id = Uuid::new_v4();
        dispatcher.dispatch_task(&sample_task(workflow_id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let got = received.lock().await;
        assert_eq!(got.as_ref().unwrap()["workflow_id"], serde_json::json!(workflow_id));
    }

    #[tokio::test]
    async fn result_for_registered_workflow_invokes_handler_exactly_once() {
        let bus = InMemoryBus::new();
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let dispatcher = AgentDispatcher::new(bus.clone(), registry);
        dispatcher.start().await.unwrap();

        let workflow_id = Uuid::new_v4();
        let invocations = Arc::new(AtomicU64::new(0));
        let invocations2 = invocations.clone();
        dispatcher.on_result(
            workflow_id,
            Arc::new(move |_result: AgentResult| {
                invocations2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let result = sample_result(workflow_id, AgentStatus::Success);
        bus.publish(
            RESULTS_TOPIC,
            serde_json::to_value(&result).unwrap(),
            PublishOptions {
                mirror_to_stream: Some(format!("stream:{RESULTS_TOPIC}")),
                key: Some(workflow_id.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(), 0); // auto-removed: status is terminal
    }

    #[tokio::test]
    async fn unknown_workflow_id_is_silently_discarded() {
        let bus = InMemoryBus::new();
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let dispatcher = AgentDispatcher::new(bus.clone(), registry);
        dispatcher.start().await.unwrap();

        let result = sample_result(Uuid::new_v4(), AgentStatus::Success);
        bus.publish(
            RESULTS_TOPIC,
            serde_json::to_value(&result).unwrap(),
            PublishOptions {
                mirror_to_stream: Some(format!("stream:{RESULTS_TOPIC}")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[tokio::test]
    async fn re_registering_for_the_same_workflow_leaves_exactly_one_timer() {
        let bus = InMemoryBus::new();
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let dispatcher = AgentDispatcher::new(bus.clone(), registry);
        let workflow_id = Uuid::new_v4();

        let called = Arc::new(AtomicBool::new(false));
        dispatcher.on_result(workflow_id, Arc::new(|_: AgentResult| {}));
        let called2 = called.clone();
        dispatcher.on_result(
            workflow_id,
            Arc::new(move |_: AgentResult| called2.store(true, Ordering::SeqCst)),
        );

        assert_eq!(dispatcher.handler_count(), 1);
    }
}
