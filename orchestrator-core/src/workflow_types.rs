//! ABOUTME: Workflow definition and execution-context data model (spec §3)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Stop,
    Continue,
    Skip,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Stop
    }
}

/// Outcome of a single stage attempt, used to route to the next stage
/// (spec §4.4 `get_next_stage`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Failure,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataFlow {
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
    #[serde(default)]
    pub pass_through: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub agent_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub on_success: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub skip_condition: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
}

fn default_global_timeout_ms() -> u64 {
    3_600_000
}

fn default_max_parallel_stages() -> u32 {
    4
}

/// Immutable workflow definition as loaded from a YAML/JSON file (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub start_stage: String,
    pub stages: HashMap<String, StageConfig>,
    #[serde(default = "default_global_timeout_ms")]
    pub global_timeout_ms: u64,
    #[serde(default = "default_max_parallel_stages")]
    pub max_parallel_stages: u32,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub data_flow: Option<DataFlow>,
}

/// Recorded outcome of one completed stage attempt (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub outcome: StageOutcome,
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Per-execution mutable context threaded through the engine (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: Uuid,
    pub definition: WorkflowDefinition,
    pub current_stage: String,
    pub stage_results: HashMap<String, StageResult>,
    pub input_data: serde_json::Value,
    pub metadata: WorkflowMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initiated,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

/// The terminal (or in-progress) result returned for a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub current_stage: String,
    pub progress: u8,
    pub output: serde_json::Value,
    #[serde(default)]
    pub last_error: Option<LastError>,
}
