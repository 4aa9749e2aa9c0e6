//! ABOUTME: Argument parsing for the `orchestrator` binary — global flags plus `run`/`validate`

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(version)]
#[command(about = "Local driver for the workflow orchestration core")]
pub struct Cli {
    /// Configuration file (TOML). Falls back to built-in defaults plus
    /// `ORCHESTRATOR__*` environment overrides when omitted.
    #[arg(short = 'c', long, global = true, env = "ORCHESTRATOR_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short = 'o', long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a workflow definition to completion against an in-memory bus
    /// with auto-succeeding stub agents for every referenced agent type.
    Run {
        /// Path to a `.yaml`/`.yml`/`.json` workflow definition.
        workflow_file: PathBuf,
        /// Optional JSON file supplying the workflow's input data.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Maximum wall time to wait for the workflow to reach a terminal
        /// state before exiting with code 4.
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
    /// Validate a workflow definition without running it.
    Validate {
        workflow_file: PathBuf,
    },
}
