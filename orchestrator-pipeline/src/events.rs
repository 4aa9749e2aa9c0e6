//! ABOUTME: Pipeline lifecycle events published on `pipeline:updates` (spec §6)

use orchestrator_core::ports::{BusError, MessageBus, PublishOptions};
use serde::Serialize;
use uuid::Uuid;

pub const PIPELINE_UPDATES_TOPIC: &str = "pipeline:updates";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ExecutionStarted {
        execution_id: Uuid,
        pipeline_id: String,
    },
    StageStarted {
        execution_id: Uuid,
        stage_id: String,
    },
    StageCompleted {
        execution_id: Uuid,
        stage_id: String,
    },
    StageFailed {
        execution_id: Uuid,
        stage_id: String,
        error_code: String,
    },
    ExecutionCompleted {
        execution_id: Uuid,
    },
    ExecutionFailed {
        execution_id: Uuid,
        reason: String,
    },
}

pub async fn publish(bus: &dyn MessageBus, event: PipelineEvent) -> Result<(), BusError> {
    let payload = serde_json::to_value(&event).expect("PipelineEvent always serializes");
    bus.publish(PIPELINE_UPDATES_TOPIC, payload, PublishOptions::default()).await
}
