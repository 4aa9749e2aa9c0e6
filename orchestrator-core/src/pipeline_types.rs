//! ABOUTME: Pipeline definition and execution data model (spec §3, §4.9)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    Success,
    Failure,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDependency {
    pub stage_id: String,
    pub required: bool,
    pub condition: DependencyCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateSpec {
    pub name: String,
    pub metric: String,
    pub operator: GateOperator,
    pub threshold: serde_json::Value,
    pub blocking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOperator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<StageDependency>,
    #[serde(default)]
    pub quality_gates: Vec<QualityGateSpec>,
    #[serde(default = "default_stage_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

fn default_stage_timeout_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub workflow_id: Uuid,
    pub execution_mode: ExecutionMode,
    pub stages: Vec<PipelineStage>,
    #[serde(default)]
    pub max_parallel_stages: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Paused,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStageResult {
    pub status: PipelineStageStatus,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: Uuid,
    pub pipeline_id: String,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub stage_results: std::collections::HashMap<String, PipelineStageResult>,
    #[serde(default)]
    pub triggered_by: String,
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
}
