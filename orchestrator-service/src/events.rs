//! ABOUTME: Workflow lifecycle events, one bus topic per event name (spec §6)

use orchestrator_core::ports::{BusError, MessageBus, PublishOptions};
use serde_json::Value;

pub const WORKFLOW_CREATED: &str = "workflow.created";
pub const WORKFLOW_STARTED: &str = "workflow.started";
pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
pub const WORKFLOW_FAILED: &str = "workflow.failed";

pub async fn publish(bus: &dyn MessageBus, topic: &str, payload: Value) -> Result<(), BusError> {
    bus.publish(topic, payload, PublishOptions::default()).await
}
