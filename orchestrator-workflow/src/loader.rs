//! ABOUTME: Decodes a `WorkflowDefinition` from a `.yaml`/`.yml`/`.json` file (spec §4.4/§6)
//! ABOUTME: Rejects any other extension and any unknown top-level key before deserializing

use orchestrator_core::workflow_types::WorkflowDefinition;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),
    #[error("unknown top-level key: {0}")]
    UnknownTopLevelKey(String),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "name",
    "version",
    "description",
    "start_stage",
    "stages",
    "global_timeout_ms",
    "max_parallel_stages",
    "retry_strategy",
    "on_failure",
    "data_flow",
];

enum Format {
    Yaml,
    Json,
}

fn format_for(path: &Path) -> Result<Format, LoaderError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Ok(Format::Yaml),
        Some("json") => Ok(Format::Json),
        other => Err(LoaderError::UnsupportedExtension(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

fn reject_unknown_keys(value: &serde_json::Value) -> Result<(), LoaderError> {
    if let Some(obj) = value.as_object() {
        for key in obj.keys() {
            if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
                return Err(LoaderError::UnknownTopLevelKey(key.clone()));
            }
        }
    }
    Ok(())
}

/// Loads and validates a workflow definition from disk. The extension
/// selects the decoder; anything else is rejected outright (spec §6).
pub async fn load_from_path(path: &Path) -> Result<WorkflowDefinition, LoaderError> {
    let format = format_for(path)?;
    let content = tokio::fs::read_to_string(path).await?;
    load_from_str(&content, format)
}

pub fn load_from_yaml(content: &str) -> Result<WorkflowDefinition, LoaderError> {
    load_from_str(content, Format::Yaml)
}

pub fn load_from_json(content: &str) -> Result<WorkflowDefinition, LoaderError> {
    load_from_str(content, Format::Json)
}

fn load_from_str(content: &str, format: Format) -> Result<WorkflowDefinition, LoaderError> {
    let value: serde_json::Value = match format {
        Format::Yaml => serde_yaml::from_str(content)?,
        Format::Json => serde_json::from_str(content)?,
    };
    reject_unknown_keys(&value)?;
    let definition: WorkflowDefinition = serde_json::from_value(value)?;
    Ok(definition)
}
