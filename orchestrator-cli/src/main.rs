//! ABOUTME: Entry point for the `orchestrator` binary

use clap::Parser;
use orchestrator_cli::cli::Cli;
use orchestrator_cli::commands::{self, EXIT_CONFIGURATION_ERROR};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match orchestrator_config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            // tracing isn't set up yet — this is a startup failure, not a run-time log line
            eprintln!("configuration error: {err}");
            std::process::exit(EXIT_CONFIGURATION_ERROR);
        }
    };
    setup_tracing(&config.logging);

    let exit_code = match commands::run_command(cli.command, cli.output, config).await {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<orchestrator_service::ServiceError>() {
                Some(service_err) => {
                    let taxonomy = orchestrator_core::error::OrchestratorError::from(service_err);
                    eprintln!("error [{}]: {err:#}", taxonomy.code());
                }
                None => eprintln!("error: {err:#}"),
            }
            1
        }
    };
    std::process::exit(exit_code);
}

/// Tracing goes to stderr so stdout stays reserved for `--output json/yaml`
/// machine-readable results. `RUST_LOG` always wins over `logging.level`
/// when set, matching `EnvFilter`'s usual precedence.
fn setup_tracing(logging: &orchestrator_config::LoggingSettings) {
    use std::io;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).with_target(false);
    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
