//! ABOUTME: QualityGateService: typed predicate evaluation over a result document (spec §4.7)
//! ABOUTME: `evaluate_all` short-circuits the aggregate verdict on blocking-gate failures only

use orchestrator_core::pipeline_types::{GateOperator, QualityGateSpec};
use orchestrator_workflow::jsonpath::get_value_by_path;
use parking_lot::RwLock;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse policy file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct GateResult {
    pub gate_name: String,
    pub passed: bool,
    pub actual_value: Value,
    pub threshold: Value,
    pub blocking: bool,
}

#[derive(Debug, Clone)]
pub struct GateEvaluation {
    pub passed: bool,
    pub results: Vec<GateResult>,
}

/// Resolves `gate.metric` against `data`, coerces numeric strings, treats
/// a missing/null value as a failure regardless of operator, then applies
/// the typed comparison (spec §4.7).
pub fn evaluate(gate: &QualityGateSpec, data: &Value) -> bool {
    let Some(actual) = get_value_by_path(data, &gate.metric) else {
        return false;
    };
    if actual.is_null() {
        return false;
    }
    apply_operator(gate.operator, &actual, &gate.threshold)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn apply_operator(operator: GateOperator, actual: &Value, threshold: &Value) -> bool {
    match operator {
        GateOperator::Eq => values_equal(actual, threshold),
        GateOperator::Ne => !values_equal(actual, threshold),
        GateOperator::Lt | GateOperator::Le | GateOperator::Gt | GateOperator::Ge => {
            let (Some(a), Some(t)) = (as_f64(actual), as_f64(threshold)) else {
                return false;
            };
            match operator {
                GateOperator::Lt => a < t,
                GateOperator::Le => a <= t,
                GateOperator::Gt => a > t,
                GateOperator::Ge => a >= t,
                _ => unreachable!(),
            }
        }
    }
}

fn values_equal(actual: &Value, threshold: &Value) -> bool {
    if let (Some(a), Some(t)) = (as_f64(actual), as_f64(threshold)) {
        return a == t;
    }
    actual == threshold
}

/// Evaluates every gate; the aggregate `passed` is true iff every
/// **blocking** gate passed — non-blocking failures are recorded but
/// never fail the aggregate (spec §4.7).
pub fn evaluate_all(gates: &[QualityGateSpec], data: &Value) -> GateEvaluation {
    let mut results = Vec::with_capacity(gates.len());
    let mut passed = true;

    for gate in gates {
        let gate_passed = evaluate(gate, data);
        if gate.blocking && !gate_passed {
            passed = false;
        }
        results.push(GateResult {
            gate_name: gate.name.clone(),
            passed: gate_passed,
            actual_value: get_value_by_path(data, &gate.metric).unwrap_or(Value::Null),
            threshold: gate.threshold.clone(),
            blocking: gate.blocking,
        });
    }

    GateEvaluation { passed, results }
}

/// Default policy gates when no policy file is configured (spec §6).
pub fn default_gates() -> Vec<QualityGateSpec> {
    vec![
        QualityGateSpec {
            name: "coverage".to_string(),
            metric: "line_coverage".to_string(),
            operator: GateOperator::Ge,
            threshold: Value::from(80),
            blocking: true,
        },
        QualityGateSpec {
            name: "security".to_string(),
            metric: "critical_vulns".to_string(),
            operator: GateOperator::Eq,
            threshold: Value::from(0),
            blocking: true,
        },
        QualityGateSpec {
            name: "contracts".to_string(),
            metric: "api_breaking_changes".to_string(),
            operator: GateOperator::Eq,
            threshold: Value::from(0),
            blocking: true,
        },
        QualityGateSpec {
            name: "performance".to_string(),
            metric: "p95_latency_ms".to_string(),
            operator: GateOperator::Lt,
            threshold: Value::from(500),
            blocking: false,
        },
    ]
}

/// A named table of gates, reloadable from a policy file. Reload is
/// idempotent and atomic: the new gate list is parsed fully before the
/// lock is taken, so a malformed file never leaves the policy partially
/// applied (spec §4.7 "swap-on-success").
pub struct QualityGatePolicy {
    gates: RwLock<Vec<QualityGateSpec>>,
}

impl Default for QualityGatePolicy {
    fn default() -> Self {
        Self {
            gates: RwLock::new(default_gates()),
        }
    }
}

impl QualityGatePolicy {
    pub fn new(gates: Vec<QualityGateSpec>) -> Self {
        Self {
            gates: RwLock::new(gates),
        }
    }

    pub fn gates(&self) -> Vec<QualityGateSpec> {
        self.gates.read().clone()
    }

    pub async fn reload_from_path(&self, path: &Path) -> Result<(), GateError> {
        let content = tokio::fs::read_to_string(path).await?;
        let parsed: Vec<QualityGateSpec> = serde_json::from_str(&content)?;
        *self.gates.write() = parsed;
        Ok(())
    }

    pub fn evaluate_all(&self, data: &Value) -> GateEvaluation {
        evaluate_all(&self.gates(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coverage_gate_fails_below_threshold_and_passes_at_threshold() {
        let gate = &default_gates()[0];
        assert!(!evaluate(gate, &json!({"line_coverage": 70})));
        assert!(evaluate(gate, &json!({"line_coverage": 80})));
        assert!(evaluate(gate, &json!({"line_coverage": 95})));
    }

    #[test]
    fn security_gate_boundary_is_inclusive_equality() {
        let gate = &default_gates()[1];
        assert!(evaluate(gate, &json!({"critical_vulns": 0})));
        assert!(!evaluate(gate, &json!({"critical_vulns": 1})));
    }

    #[test]
    fn missing_metric_fails_the_gate_regardless_of_operator() {
        let gate = &default_gates()[0];
        assert!(!evaluate(gate, &json!({})));
    }

    #[test]
    fn null_metric_fails_the_gate() {
        let gate = &default_gates()[0];
        assert!(!evaluate(gate, &json!({"line_coverage": null})));
    }

    #[test]
    fn numeric_strings_are_coerced_for_comparison() {
        let gate = &default_gates()[0];
        assert!(evaluate(gate, &json!({"line_coverage": "85"})));
    }

    #[test]
    fn evaluate_all_blocks_on_blocking_failure_but_not_on_non_blocking() {
        let gates = default_gates();
        let data = json!({
            "line_coverage": 70,
            "critical_vulns": 0,
            "api_breaking_changes": 0,
            "p95_latency_ms": 900,
        });
        let evaluation = evaluate_all(&gates, &data);
        assert!(!evaluation.passed); // coverage blocks
        let perf = evaluation.results.iter().find(|r| r.gate_name == "performance").unwrap();
        assert!(!perf.passed && !perf.blocking);
    }

    #[test]
    fn evaluate_all_passes_when_all_blocking_gates_pass() {
        let gates = default_gates();
        let data = json!({
            "line_coverage": 90,
            "critical_vulns": 0,
            "api_breaking_changes": 0,
            "p95_latency_ms": 900,
        });
        assert!(evaluate_all(&gates, &data).passed);
    }
}
