//! ABOUTME: End-to-end coverage of the `orchestrator` CLI's `run`/`validate` commands

use orchestrator_cli::cli::{Command, OutputFormat};
use orchestrator_cli::commands::{run_command, EXIT_SUCCESS, EXIT_VALIDATION_ERROR};
use std::io::Write;

const TWO_STAGE_YAML: &str = r#"
name: demo
version: "1.0.0"
start_stage: scaffold
stages:
  scaffold:
    name: scaffold
    agent_type: scaffold
    on_success: validate
  validate:
    name: validate
    agent_type: validation
"#;

fn workflow_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[tokio::test]
async fn validate_accepts_a_well_formed_definition() {
    let file = workflow_file(TWO_STAGE_YAML);
    let code = run_command(
        Command::Validate {
            workflow_file: file.path().to_path_buf(),
        },
        OutputFormat::Text,
    )
    .await
    .unwrap();
    assert_eq!(code, EXIT_SUCCESS);
}

#[tokio::test]
async fn validate_rejects_a_dangling_transition() {
    let broken = TWO_STAGE_YAML.replace("on_success: validate", "on_success: nonexistent");
    let file = workflow_file(&broken);
    let code = run_command(
        Command::Validate {
            workflow_file: file.path().to_path_buf(),
        },
        OutputFormat::Text,
    )
    .await
    .unwrap();
    assert_eq!(code, EXIT_VALIDATION_ERROR);
}

#[tokio::test]
async fn run_drives_a_two_stage_workflow_to_success_via_stub_agents() {
    let file = workflow_file(TWO_STAGE_YAML);
    let code = run_command(
        Command::Run {
            workflow_file: file.path().to_path_buf(),
            input: None,
            timeout_ms: 5_000,
        },
        OutputFormat::Json,
    )
    .await
    .unwrap();
    assert_eq!(code, EXIT_SUCCESS);
}

#[tokio::test]
async fn run_rejects_an_unsupported_extension() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(file, "name = \"demo\"").unwrap();
    let code = run_command(
        Command::Run {
            workflow_file: file.path().to_path_buf(),
            input: None,
            timeout_ms: 1_000,
        },
        OutputFormat::Text,
    )
    .await
    .unwrap();
    assert_eq!(code, EXIT_VALIDATION_ERROR);
}
