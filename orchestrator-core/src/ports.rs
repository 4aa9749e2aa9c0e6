//! ABOUTME: Long-lived collaborator ports (bus, store, clock, registry, logger)
//! ABOUTME: injected as explicit constructor parameters — no process-wide singletons (spec §9)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish failed on topic {topic}: {message}")]
    PublishFailed { topic: String, message: String },
    #[error("subscribe failed on topic {topic}: {message}")]
    SubscribeFailed { topic: String, message: String },
    #[error("connection closed")]
    Disconnected,
    #[error("handler error: {0}")]
    Handler(String),
}

/// A message delivered to a subscriber: the raw payload plus bus-level
/// metadata the handler may need (partition key, stream record id for
/// acknowledgement, headers).
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
    pub key: Option<String>,
    pub headers: HashMap<String, String>,
    /// Present when delivered through a stream-backed consumer group;
    /// used by the adapter to ack/redeliver.
    pub record_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub key: Option<String>,
    pub mirror_to_stream: Option<String>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub consumer_group: Option<String>,
    pub from_beginning: bool,
}

pub type HandlerResult = std::result::Result<(), BusError>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A subscription handler: receives one message at a time and must never
/// panic across the bus boundary — errors are reported back to the bus
/// (logged, and redelivered under a consumer group) rather than torn down
/// (spec §4.3 "Failure semantics").
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: BusMessage) -> HandlerFuture;
}

impl<F> MessageHandler for F
where
    F: Fn(BusMessage) -> HandlerFuture + Send + Sync,
{
    fn handle(&self, message: BusMessage) -> HandlerFuture {
        (self)(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// The symmetric message bus port (spec §4.3). `InMemoryBus` and
/// `RedisBus` in `orchestrator-bus` both implement this contract.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        opts: PublishOptions,
    ) -> Result<(), BusError>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionId, BusError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError>;

    async fn disconnect(&self) -> Result<(), BusError>;

    async fn ping(&self) -> Result<(), BusError>;
}

/// Persists and reloads per-execution workflow state (spec §3, §4.10).
/// The engine/service never touch a database directly — only this port.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save(
        &self,
        ctx: &crate::workflow_types::WorkflowContext,
    ) -> Result<(), OrchestratorStoreError>;

    async fn load(
        &self,
        workflow_id: uuid::Uuid,
    ) -> Result<Option<crate::workflow_types::WorkflowContext>, OrchestratorStoreError>;

    async fn delete(&self, workflow_id: uuid::Uuid) -> Result<(), OrchestratorStoreError>;
}

#[derive(Debug, Error)]
pub enum OrchestratorStoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Injectable clock so retry/circuit-breaker/TTL logic can be tested with
/// a controllable `now()` instead of `Utc::now()` directly (spec §8,
/// scenario 3: "after 60_000ms (mocked clock)").
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One entry in the `agents:registry` key-value namespace: `agent_id ->
/// {agent_id, agent_type, version, capabilities[], registered_at}` plus
/// the liveness fields `status`/`last_heartbeat` that `AgentDispatcher::
/// get_registered_agents` reads (spec §4.6, §4.11, §6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_type: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub status: String,
    pub last_heartbeat: DateTime<Utc>,
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn register(&self, registration: AgentRegistration) -> Result<(), BusError>;
    async fn deregister(&self, agent_id: &str) -> Result<(), BusError>;
    async fn list(&self) -> Vec<AgentRegistration>;
}

/// Thin structured-logging port. The default implementation wraps
/// `tracing` directly (see `orchestrator-core::logging`); this trait
/// exists purely so call sites can assert against a recording logger in
/// tests, not to replace `tracing` as the actual sink.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, target: &str, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, target: &str, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "orchestrator", %target, "{message}"),
            LogLevel::Info => tracing::info!(target: "orchestrator", %target, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "orchestrator", %target, "{message}"),
            LogLevel::Error => tracing::error!(target: "orchestrator", %target, "{message}"),
        }
    }
}
