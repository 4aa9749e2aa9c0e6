//! ABOUTME: PipelineExecutor and its lifecycle events (spec §4.9)

pub mod events;
pub mod executor;

pub use events::{PipelineEvent, PIPELINE_UPDATES_TOPIC};
pub use executor::{validate_definition, ExecutorError, PipelineExecutor};
