//! ABOUTME: Task and result envelope schemas exchanged over the message bus (spec §3)
//! ABOUTME: Envelope version 2.0.0; unknown major versions and missing fields are rejected

use crate::trace::TraceContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const ENVELOPE_VERSION: &str = "2.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConstraints {
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Confidence threshold in `[0, 100]` the agent is expected to meet.
    pub required_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContextRef {
    pub current_stage: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub created_by: String,
    #[serde(default = "default_envelope_version")]
    pub envelope_version: String,
}

fn default_envelope_version() -> String {
    ENVELOPE_VERSION.to_string()
}

/// A unit of work dispatched to exactly one agent type (spec §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub agent_type: String,
    pub priority: Priority,
    pub payload: Value,
    pub constraints: TaskConstraints,
    pub workflow_context: WorkflowContextRef,
    pub trace: TraceContext,
    pub metadata: TaskMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Failed,
    Timeout,
    Cancelled,
    Running,
    Pending,
    Queued,
    Retrying,
}

impl AgentStatus {
    /// `success` on the result envelope is derived from `status` (spec §3).
    pub fn is_success(self) -> bool {
        matches!(self, AgentStatus::Success)
    }

    /// Statuses the dispatcher and workflow state machine treat as terminal
    /// for a given task (§4.6 step 4).
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Success | AgentStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub duration_ms: u64,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultData {
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Value>>,
    pub metrics: ResultMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// The canonical result envelope every agent publishes (spec §3, §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub agent_id: String,
    pub agent_type: String,
    pub success: bool,
    pub status: AgentStatus,
    pub action: String,
    pub result: ResultData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub stage: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

impl AgentResult {
    pub fn derive_success(status: AgentStatus) -> bool {
        status.is_success()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(String),
    #[error("empty agent_type")]
    EmptyAgentType,
}

/// Validates a task envelope's required fields and version, per spec §3/§6.
///
/// Deserialization with `serde_json::from_value::<TaskEnvelope>` already
/// enforces field *presence*/*type*; this additionally enforces the
/// semantic constraints serde can't (non-empty `agent_type`, known major
/// version) and rejects unknown top-level keys when constructed from raw
/// JSON via [`validate_raw`].
pub fn validate_task_envelope(envelope: &TaskEnvelope) -> Result<(), EnvelopeError> {
    if envelope.agent_type.trim().is_empty() {
        return Err(EnvelopeError::EmptyAgentType);
    }
    validate_version(&envelope.metadata.envelope_version)?;
    Ok(())
}

fn validate_version(version: &str) -> Result<(), EnvelopeError> {
    let major = version.split('.').next().unwrap_or("");
    let expected_major = ENVELOPE_VERSION.split('.').next().unwrap_or("");
    if major != expected_major {
        return Err(EnvelopeError::UnsupportedVersion(version.to_string()));
    }
    Ok(())
}

const TASK_ENVELOPE_FIELDS: &[&str] = &[
    "message_id",
    "task_id",
    "workflow_id",
    "agent_type",
    "priority",
    "payload",
    "constraints",
    "workflow_context",
    "trace",
    "metadata",
];

/// Validates a raw JSON value as a task envelope before attempting to
/// deserialize it, rejecting unknown top-level keys and reporting the
/// first missing required field (spec §3: "Fields are required; unknown
/// fields rejected").
pub fn validate_raw(value: &Value) -> Result<TaskEnvelope, EnvelopeError> {
    let obj = value
        .as_object()
        .ok_or(EnvelopeError::MissingField("<object>"))?;

    for key in obj.keys() {
        if !TASK_ENVELOPE_FIELDS.contains(&key.as_str()) {
            return Err(EnvelopeError::UnknownField(key.clone()));
        }
    }
    for field in TASK_ENVELOPE_FIELDS {
        if !obj.contains_key(*field) {
            return Err(EnvelopeError::MissingField(field));
        }
    }

    let envelope: TaskEnvelope = serde_json::from_value(value.clone())
        .map_err(|_| EnvelopeError::MissingField("<malformed>"))?;
    validate_task_envelope(&envelope)?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_value() -> Value {
        json!({
            "message_id": Uuid::new_v4(),
            "task_id": Uuid::new_v4(),
            "workflow_id": Uuid::new_v4(),
            "agent_type": "scaffold",
            "priority": "normal",
            "payload": {},
            "constraints": {"timeout_ms": 1000, "max_retries": 3, "required_confidence": 80.0},
            "workflow_context": {"current_stage": "A"},
            "trace": {"trace_id": "t", "span_id": "s", "parent_span_id": null},
            "metadata": {"created_at": chrono::Utc::now(), "created_by": "test", "envelope_version": "2.0.0"},
        })
    }

    #[test]
    fn accepts_well_formed_envelope() {
        assert!(validate_raw(&sample_value()).is_ok());
    }

    #[test]
    fn rejects_unknown_top_level_field() {
        let mut value = sample_value();
        value
            .as_object_mut()
            .unwrap()
            .insert("extra".to_string(), json!(true));
        assert_eq!(
            validate_raw(&value).unwrap_err(),
            EnvelopeError::UnknownField("extra".to_string())
        );
    }

    #[test]
    fn rejects_missing_required_field() {
        let mut value = sample_value();
        value.as_object_mut().unwrap().remove("trace");
        assert_eq!(
            validate_raw(&value).unwrap_err(),
            EnvelopeError::MissingField("trace")
        );
    }

    #[test]
    fn rejects_unknown_major_version() {
        let mut value = sample_value();
        value["metadata"]["envelope_version"] = json!("3.0.0");
        assert!(matches!(
            validate_raw(&value).unwrap_err(),
            EnvelopeError::UnsupportedVersion(_)
        ));
    }

    #[test]
    fn rejects_empty_agent_type() {
        let mut value = sample_value();
        value["agent_type"] = json!("");
        assert_eq!(validate_raw(&value).unwrap_err(), EnvelopeError::EmptyAgentType);
    }
}
