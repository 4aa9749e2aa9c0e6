//! ABOUTME: Renders a `WorkflowResult` in the format requested by `--output`

use crate::cli::OutputFormat;
use anyhow::Result;
use orchestrator_core::workflow_types::WorkflowResult;

pub fn format_workflow_result(result: &WorkflowResult, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(result)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(result)?),
        OutputFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!("workflow_id : {}\n", result.workflow_id));
            out.push_str(&format!("status      : {:?}\n", result.status));
            out.push_str(&format!("stage       : {}\n", result.current_stage));
            out.push_str(&format!("progress    : {}%\n", result.progress));
            if let Some(err) = &result.last_error {
                out.push_str(&format!("error       : [{}] {}\n", err.code, err.message));
            }
            Ok(out)
        }
    }
}
