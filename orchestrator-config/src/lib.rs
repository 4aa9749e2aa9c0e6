//! ABOUTME: Layered configuration for the orchestration core (spec §1 "out of scope" collaborator)
//! ABOUTME: TOML file + `ORCHESTRATOR_*` environment overrides via the `config` crate, following the teacher's `config::Config::builder()` pattern

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    InMemory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    pub kind: BusKind,
    /// Connection string for `Redis`; ignored for `InMemory`.
    pub url: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            kind: BusKind::InMemory,
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Default handler TTL, mirrors `orchestrator_dispatch::DEFAULT_HANDLER_TTL_MS`.
    pub handler_ttl_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            handler_ttl_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefaults {
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// The orchestration core's own settings: bus endpoint, dispatcher and
/// stage defaults, policy file location, registry namespace and log
/// level. Scope is deliberately narrow — general application config
/// beyond these concerns is out of scope (spec §1, SPEC_FULL).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub bus: BusSettings,
    pub dispatch: DispatchSettings,
    pub stage_defaults: StageDefaults,
    pub policy_file: Option<PathBuf>,
    pub registry_namespace: String,
    pub logging: LoggingSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bus: BusSettings::default(),
            dispatch: DispatchSettings::default(),
            stage_defaults: StageDefaults::default(),
            policy_file: None,
            registry_namespace: "agents:registry".to_string(),
            logging: LoggingSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Required-environment / invalid-file configuration errors are fatal
    /// at process start (spec §7 "Configuration").
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stage_defaults.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "stage_defaults.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.registry_namespace.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "registry_namespace must not be empty".to_string(),
            ));
        }
        if self.bus.kind == BusKind::Redis && self.bus.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "bus.url is required when bus.kind = redis".to_string(),
            ));
        }
        Ok(())
    }
}

/// Layers an optional TOML file over the built-in defaults, then applies
/// `ORCHESTRATOR__*` environment overrides (double underscore as the
/// nested-key separator, e.g. `ORCHESTRATOR__BUS__URL`).
pub fn load(file_path: Option<&Path>) -> Result<OrchestratorConfig, ConfigError> {
    let defaults = OrchestratorConfig::default();
    let mut builder = config::Config::builder()
        .set_default("bus.kind", "in_memory")?
        .set_default("bus.url", defaults.bus.url)?
        .set_default("dispatch.handler_ttl_ms", defaults.dispatch.handler_ttl_ms as i64)?
        .set_default("stage_defaults.timeout_ms", defaults.stage_defaults.timeout_ms as i64)?
        .set_default("stage_defaults.max_retries", defaults.stage_defaults.max_retries as i64)?
        .set_default("registry_namespace", defaults.registry_namespace)?
        .set_default("logging.level", defaults.logging.level)?
        .set_default("logging.json", defaults.logging.json)?;

    if let Some(path) = file_path {
        builder = builder.add_source(config::File::from(path));
    }

    let config = builder
        .add_source(config::Environment::with_prefix("ORCHESTRATOR").separator("__"))
        .build()?;

    let loaded: OrchestratorConfig = config.try_deserialize()?;
    loaded.validate()?;
    Ok(loaded)
}
