//! Engine-level error taxonomy for Pipewright.

use tracing::warn;

/// Errors raised while loading or validating configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported definition format: {0} (expected .toml or .json)")]
    UnsupportedFormat(String),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Pipewright engine errors.
///
/// The first five variants are the failure classes a build can surface;
/// the rest are plumbing.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("required tool not found on PATH: {tool}")]
    ToolMissing { tool: String },

    #[error("stage {stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },

    #[error("best-effort step {step} failed: {message}")]
    BestEffort { step: String, message: String },

    #[error("stage {stage} timed out (limit {limit_ms}ms)")]
    Timeout { stage: String, limit_ms: u64 },

    #[error("artifact {name} matched nothing for pattern {pattern}")]
    ArtifactMissing { name: String, pattern: String },

    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid stage transition: {current} -> {requested}")]
    InvalidTransition { current: String, requested: String },

    #[error("pipeline {pipeline} already has a build in progress")]
    ConcurrentRun { pipeline: String },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error belongs to the swallowed best-effort class.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, EngineError::BestEffort { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Non-escalating boundary for best-effort steps.
///
/// Any error is converted to [`EngineError::BestEffort`], logged at warn
/// level and returned as `Some(warning)` for the build record. Never
/// propagates.
pub fn best_effort<T, E: std::fmt::Display>(
    step: &str,
    result: std::result::Result<T, E>,
) -> Option<EngineError> {
    match result {
        Ok(_) => None,
        Err(e) => {
            let err = EngineError::BestEffort {
                step: step.to_string(),
                message: e.to_string(),
            };
            warn!(event = "best_effort.failed", step = %step, error = %e);
            Some(err)
        }
    }
}
