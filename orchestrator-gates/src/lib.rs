//! ABOUTME: Quality and decision gate services: predicate evaluation and approval routing
//! ABOUTME: for pipeline/workflow stage outcomes (spec §4.7, §4.8)

pub mod decision;
pub mod quality;

pub use decision::{
    ClarificationRequest, DecisionCategory, DecisionGateService, DecisionOutcome, DecisionRequest,
    needs_clarification,
};
pub use quality::{GateError, GateEvaluation, GateResult, QualityGatePolicy, default_gates, evaluate, evaluate_all};
