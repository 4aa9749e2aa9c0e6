//! ABOUTME: Error taxonomy shared across every orchestrator crate
//! ABOUTME: Per-crate errors convert into this one at component boundaries

use thiserror::Error;

/// The cross-cutting error kinds from the orchestration design (§7).
///
/// Individual crates define their own richer error enums (`RetryError`,
/// `BusError`, `WorkflowError`, ...) and convert into this one wherever a
/// caller needs a single uniform type, the same way `llmspell-core`'s
/// `LLMSpellError` sits above per-crate errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("timeout after {elapsed_ms}ms: {message}")]
    Timeout { message: String, elapsed_ms: u64 },

    #[error("quality gate failed: {gate_name}")]
    QualityGate { gate_name: String },

    #[error("agent execution error: {message}")]
    AgentExecution { message: String, retryable: bool },

    #[error("circuit open: {message}")]
    CircuitOpen { message: String },

    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl OrchestratorError {
    /// Stable machine-readable code, mirrored onto result envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::QualityGate { .. } => "QUALITY_GATE_FAILED",
            Self::AgentExecution { .. } => "AGENT_EXECUTION_ERROR",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Unknown { .. } => "UNKNOWN_ERROR",
        }
    }

    /// Whether a caller should generally retry this class of failure.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::CircuitOpen { .. } => true,
            Self::AgentExecution { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
