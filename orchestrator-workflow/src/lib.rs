//! ABOUTME: Workflow schema, the WorkflowEngine, the definition loader and the JSONPath mapper
//! ABOUTME: (spec §4.4, §4.5) — the graph logic every other orchestration crate routes through

pub mod engine;
pub mod jsonpath;
pub mod loader;

pub use engine::{ConstraintValidation, EngineError, ExecutionValidation, WorkflowEngine};
