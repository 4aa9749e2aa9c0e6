//! ABOUTME: WorkflowEngine: validates definitions, routes stages, tracks progress (spec §4.4)
//! ABOUTME: Holds no mutable state itself — operates on the caller's `WorkflowContext`

use chrono::Utc;
use orchestrator_core::workflow_types::{
    LastError, RetryStrategy, StageOutcome, StageResult, WorkflowContext, WorkflowDefinition,
    WorkflowMetadata, WorkflowResult, WorkflowStatus,
};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("start_stage '{0}' does not exist")]
    MissingStartStage(String),
    #[error("stage '{stage}' routes to unknown stage '{target}'")]
    UnknownTransitionTarget { stage: String, target: String },
    #[error("workflow definition has no stages")]
    EmptyDefinition,
    #[error("stage result for '{0}' was already recorded")]
    DuplicateStageResult(String),
    #[error("current stage '{0}' does not exist in the definition")]
    UnknownCurrentStage(String),
}

/// Validated, immutable view over one workflow definition. `new` is the
/// only way to obtain one — construction fails the same way spec §4.4
/// describes for `new(def)`.
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    definition: WorkflowDefinition,
}

#[derive(Debug, Clone, Default)]
pub struct ConstraintValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionValidation {
    pub valid: bool,
    pub missing_agents: Vec<String>,
    pub suggestions: HashMap<String, Vec<String>>,
}

impl WorkflowEngine {
    pub fn new(definition: WorkflowDefinition) -> Result<Self, EngineError> {
        if definition.stages.is_empty() {
            return Err(EngineError::EmptyDefinition);
        }
        if !definition.stages.contains_key(&definition.start_stage) {
            return Err(EngineError::MissingStartStage(definition.start_stage.clone()));
        }
        for (name, stage) in &definition.stages {
            if let Some(target) = &stage.on_success {
                if !definition.stages.contains_key(target) {
                    return Err(EngineError::UnknownTransitionTarget {
                        stage: name.clone(),
                        target: target.clone(),
                    });
                }
            }
            if let Some(target) = &stage.on_failure {
                if !definition.stages.contains_key(target) {
                    return Err(EngineError::UnknownTransitionTarget {
                        stage: name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(Self { definition })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// `success ↦ on_success`; `failure, timeout, unknown ↦ on_failure`.
    /// `None` means the workflow terminates at `current`.
    pub fn get_next_stage(&self, current: &str, outcome: StageOutcome) -> Option<String> {
        let stage = self.definition.stages.get(current)?;
        match outcome {
            StageOutcome::Success => stage.on_success.clone(),
            StageOutcome::Failure | StageOutcome::Timeout | StageOutcome::Unknown => {
                stage.on_failure.clone()
            }
        }
    }

    /// Stages marked `parallel: true`, not yet completed, and with every
    /// incoming routing edge (other stages' `on_success`/`on_failure`
    /// pointing at them) already completed — capped at `max_parallel_stages`.
    pub fn get_parallel_eligible_stages(&self, ctx: &WorkflowContext) -> Vec<String> {
        let mut incoming: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, stage) in &self.definition.stages {
            if let Some(target) = &stage.on_success {
                incoming.entry(target.as_str()).or_default().push(name.as_str());
            }
            if let Some(target) = &stage.on_failure {
                incoming.entry(target.as_str()).or_default().push(name.as_str());
            }
        }

        let mut eligible: Vec<String> = self
            .definition
            .stages
            .iter()
            .filter(|(name, stage)| {
                stage.parallel
                    && !ctx.stage_results.contains_key(name.as_str())
                    && incoming
                        .get(name.as_str())
                        .map(|preds| preds.iter().all(|p| ctx.stage_results.contains_key(*p)))
                        .unwrap_or(true)
            })
            .map(|(name, _)| name.clone())
            .collect();

        eligible.sort();
        eligible.truncate(self.definition.max_parallel_stages as usize);
        eligible
    }

    /// Exponential `min(1000·2^(attempt-1), 60_000)`, linear
    /// `min(1000·attempt, 60_000)`, immediate `0` (spec §4.4).
    pub fn calculate_retry_backoff(attempt: u32, strategy: RetryStrategy) -> u64 {
        match strategy {
            RetryStrategy::Exponential => {
                let base = 1000u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(62));
                base.min(60_000)
            }
            RetryStrategy::Linear => 1000u64.saturating_mul(attempt as u64).min(60_000),
            RetryStrategy::Immediate => 0,
        }
    }

    /// `round(100 · Σ weight(completed) / Σ weight(all))`, clamped to
    /// `[0, 100]`. Falls back to even distribution when no stage declares
    /// a `weight` (spec §4.4).
    pub fn calculate_progress(&self, completed_stages: &HashSet<String>) -> u8 {
        let total_stages = self.definition.stages.len();
        if total_stages == 0 {
            return 0;
        }
        let any_weighted = self.definition.stages.values().any(|s| s.weight.is_some());

        let (completed_weight, total_weight): (f64, f64) = if any_weighted {
            let weight_of = |name: &str| -> f64 {
                self.definition
                    .stages
                    .get(name)
                    .and_then(|s| s.weight)
                    .unwrap_or(0.0)
            };
            let total: f64 = self.definition.stages.values().filter_map(|s| s.weight).sum();
            let completed: f64 = completed_stages.iter().map(|name| weight_of(name)).sum();
            (completed, total)
        } else {
            (completed_stages.len() as f64, total_stages as f64)
        };

        if total_weight <= 0.0 {
            return 0;
        }
        let pct = (100.0 * completed_weight / total_weight).round();
        pct.clamp(0.0, 100.0) as u8
    }

    /// Elapsed ≤ global timeout, `current_stage` exists, workflow has
    /// actually started (spec §4.4).
    pub fn validate_constraints(&self, ctx: &WorkflowContext) -> ConstraintValidation {
        let mut errors = Vec::new();

        let elapsed_ms = Utc::now()
            .signed_duration_since(ctx.metadata.started_at)
            .num_milliseconds()
            .max(0) as u64;
        if elapsed_ms > self.definition.global_timeout_ms {
            errors.push(format!(
                "elapsed {elapsed_ms}ms exceeds global_timeout_ms {}",
                self.definition.global_timeout_ms
            ));
        }

        if !self.definition.stages.contains_key(&ctx.current_stage) {
            errors.push(format!("current_stage '{}' does not exist", ctx.current_stage));
        }

        if ctx.metadata.started_at > Utc::now() {
            errors.push("workflow has not started yet".to_string());
        }

        ConstraintValidation {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn create_initial_context(&self, workflow_id: Uuid, input_data: serde_json::Value) -> WorkflowContext {
        WorkflowContext {
            workflow_id,
            definition: self.definition.clone(),
            current_stage: self.definition.start_stage.clone(),
            stage_results: HashMap::new(),
            input_data,
            metadata: WorkflowMetadata {
                started_at: Utc::now(),
            },
        }
    }

    /// A stage result is written at most once — a second completion path
    /// slipping in is a bug the invariant forbids (spec §3).
    pub fn record_stage_result(
        &self,
        ctx: &mut WorkflowContext,
        stage: &str,
        result: StageResult,
    ) -> Result<(), EngineError> {
        if !self.definition.stages.contains_key(stage) {
            return Err(EngineError::UnknownCurrentStage(stage.to_string()));
        }
        if ctx.stage_results.contains_key(stage) {
            return Err(EngineError::DuplicateStageResult(stage.to_string()));
        }
        ctx.stage_results.insert(stage.to_string(), result);
        Ok(())
    }

    pub fn build_workflow_result(&self, ctx: &WorkflowContext, outcome: WorkflowStatus) -> WorkflowResult {
        let completed: HashSet<String> = ctx.stage_results.keys().cloned().collect();
        let progress = self.calculate_progress(&completed);

        let mut output = serde_json::Map::new();
        if let Some(data_flow) = &self.definition.data_flow {
            for (key, dotted) in &data_flow.output_mapping {
                if let Some((stage, field)) = dotted.split_once('.') {
                    let value = ctx
                        .stage_results
                        .get(stage)
                        .and_then(|r| r.output.get(field))
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    output.insert(key.clone(), value);
                }
            }
        }

        let last_error = ctx.stage_results.values().rev().find_map(|r| {
            r.error.as_ref().map(|message| LastError {
                code: "STAGE_ERROR".to_string(),
                message: message.clone(),
                recoverable: false,
            })
        });

        WorkflowResult {
            workflow_id: ctx.workflow_id,
            status: outcome,
            current_stage: ctx.current_stage.clone(),
            progress,
            output: serde_json::Value::Object(output),
            last_error: if matches!(outcome, WorkflowStatus::Failed) {
                last_error
            } else {
                None
            },
        }
    }

    /// Every `agent_type` referenced by any stage must resolve in
    /// `registry` (spec §4.4). `platform_id` is accepted for parity with
    /// the spec's signature but this engine has no multi-tenant registry
    /// partitioning — it is reserved for a future `AgentRegistry` lookup
    /// keyed by platform.
    pub fn validate_execution(&self, registry: &[String], _platform_id: Option<&str>) -> ExecutionValidation {
        let known: HashSet<&str> = registry.iter().map(|s| s.as_str()).collect();
        let mut missing_agents = Vec::new();
        let mut suggestions = HashMap::new();

        for stage in self.definition.stages.values() {
            if !known.contains(stage.agent_type.as_str()) {
                missing_agents.push(stage.agent_type.clone());
                let close: Vec<String> = registry
                    .iter()
                    .filter(|candidate| levenshtein_within(candidate, &stage.agent_type, 2))
                    .cloned()
                    .collect();
                if !close.is_empty() {
                    suggestions.insert(stage.agent_type.clone(), close);
                }
            }
        }

        missing_agents.sort();
        missing_agents.dedup();

        ExecutionValidation {
            valid: missing_agents.is_empty(),
            missing_agents,
            suggestions,
        }
    }
}

/// Cheap did-you-mean heuristic for §4.4's optional registry suggestions.
fn levenshtein_within(a: &str, b: &str, max: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return false;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for i in 1..=a.len() {
        let mut curr = vec![i];
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr.push((prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost));
        }
        prev = curr;
    }
    prev[b.len()] <= max
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::workflow_types::{DataFlow, OnFailure, StageConfig};

    fn stage(agent_type: &str, on_success: Option<&str>, on_failure: Option<&str>) -> StageConfig {
        StageConfig {
            name: agent_type.to_string(),
            agent_type: agent_type.to_string(),
            config: serde_json::Value::Null,
            timeout_ms: 300_000,
            max_retries: 3,
            on_success: on_success.map(String::from),
            on_failure: on_failure.map(String::from),
            parallel: false,
            skip_condition: None,
            weight: None,
        }
    }

    fn two_stage_def() -> WorkflowDefinition {
        let mut stages = HashMap::new();
        stages.insert("A".to_string(), stage("scaffold", Some("B"), None));
        stages.insert("B".to_string(), stage("validation", None, None));
        WorkflowDefinition {
            name: "demo".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            start_stage: "A".to_string(),
            stages,
            global_timeout_ms: 3_600_000,
            max_parallel_stages: 4,
            retry_strategy: RetryStrategy::Exponential,
            on_failure: OnFailure::Stop,
            data_flow: None,
        }
    }

    #[test]
    fn rejects_missing_start_stage() {
        let mut def = two_stage_def();
        def.start_stage = "nope".to_string();
        assert_eq!(
            WorkflowEngine::new(def).unwrap_err(),
            EngineError::MissingStartStage("nope".to_string())
        );
    }

    #[test]
    fn rejects_unknown_transition_target() {
        let mut def = two_stage_def();
        def.stages.get_mut("B").unwrap().on_success = Some("ghost".to_string());
        assert!(matches!(
            WorkflowEngine::new(def).unwrap_err(),
            EngineError::UnknownTransitionTarget { .. }
        ));
    }

    #[test]
    fn success_routes_to_on_success_failure_routes_to_on_failure() {
        let mut def = two_stage_def();
        def.stages.get_mut("A").unwrap().on_failure = Some("B".to_string());
        let engine = WorkflowEngine::new(def).unwrap();
        assert_eq!(engine.get_next_stage("A", StageOutcome::Success), Some("B".to_string()));
        assert_eq!(engine.get_next_stage("A", StageOutcome::Failure), Some("B".to_string()));
        assert_eq!(engine.get_next_stage("B", StageOutcome::Success), None);
    }

    #[test]
    fn progress_is_monotonic_and_hits_100_only_when_all_stages_complete() {
        let def = two_stage_def();
        let engine = WorkflowEngine::new(def).unwrap();

        let none = HashSet::new();
        let mut one = HashSet::new();
        one.insert("A".to_string());
        let mut both = HashSet::new();
        both.insert("A".to_string());
        both.insert("B".to_string());

        let p0 = engine.calculate_progress(&none);
        let p1 = engine.calculate_progress(&one);
        let p2 = engine.calculate_progress(&both);
        assert!(p0 <= p1 && p1 <= p2);
        assert_eq!(p2, 100);
    }

    #[test]
    fn progress_uses_weights_when_any_stage_declares_one() {
        let mut def = two_stage_def();
        def.stages.get_mut("A").unwrap().weight = Some(1.0);
        def.stages.get_mut("B").unwrap().weight = Some(3.0);
        let engine = WorkflowEngine::new(def).unwrap();
        let mut completed = HashSet::new();
        completed.insert("A".to_string());
        assert_eq!(engine.calculate_progress(&completed), 25);
    }

    #[test]
    fn retry_backoff_matches_spec_formulas() {
        assert_eq!(WorkflowEngine::calculate_retry_backoff(1, RetryStrategy::Exponential), 1000);
        assert_eq!(WorkflowEngine::calculate_retry_backoff(7, RetryStrategy::Exponential), 60_000);
        assert_eq!(WorkflowEngine::calculate_retry_backoff(3, RetryStrategy::Linear), 3000);
        assert_eq!(WorkflowEngine::calculate_retry_backoff(100, RetryStrategy::Linear), 60_000);
        assert_eq!(WorkflowEngine::calculate_retry_backoff(5, RetryStrategy::Immediate), 0);
    }

    #[test]
    fn duplicate_stage_result_is_rejected() {
        let def = two_stage_def();
        let engine = WorkflowEngine::new(def).unwrap();
        let mut ctx = engine.create_initial_context(Uuid::new_v4(), serde_json::json!({}));
        let result = StageResult {
            outcome: StageOutcome::Success,
            output: serde_json::json!({}),
            error: None,
            attempts: 1,
            duration_ms: 10,
            timestamp: Utc::now(),
        };
        engine.record_stage_result(&mut ctx, "A", result.clone()).unwrap();
        assert_eq!(
            engine.record_stage_result(&mut ctx, "A", result).unwrap_err(),
            EngineError::DuplicateStageResult("A".to_string())
        );
    }

    #[test]
    fn output_mapping_extracts_stage_output_field_by_direct_dotted_lookup() {
        let mut def = two_stage_def();
        def.data_flow = Some(DataFlow {
            input_mapping: HashMap::new(),
            output_mapping: HashMap::from([("summary".to_string(), "A.message".to_string())]),
            pass_through: vec![],
        });
        let engine = WorkflowEngine::new(def).unwrap();
        let mut ctx = engine.create_initial_context(Uuid::new_v4(), serde_json::json!({}));
        engine
            .record_stage_result(
                &mut ctx,
                "A",
                StageResult {
                    outcome: StageOutcome::Success,
                    output: serde_json::json!({"message": "done"}),
                    error: None,
                    attempts: 1,
                    duration_ms: 1,
                    timestamp: Utc::now(),
                },
            )
            .unwrap();

        let result = engine.build_workflow_result(&ctx, WorkflowStatus::Succeeded);
        assert_eq!(result.output["summary"], serde_json::json!("done"));
    }

    #[test]
    fn validate_execution_reports_missing_agent_types() {
        let def = two_stage_def();
        let engine = WorkflowEngine::new(def).unwrap();
        let validation = engine.validate_execution(&["scaffold".to_string()], None);
        assert!(!validation.valid);
        assert_eq!(validation.missing_agents, vec!["validation".to_string()]);
    }
}
