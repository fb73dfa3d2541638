//! Domain models for Pipewright.
//!
//! Canonical definitions for the core entities:
//! - `PipelineDefinition`: static declaration of stages and hooks
//! - `BuildRecord`: outcome of one pipeline execution
//! - `StageResult`: outcome of one stage within a build
//! - `Artifact`: files captured into the artifact store

pub mod artifact;
pub mod definition;
pub mod error;
pub mod record;
pub mod sequence;
pub mod status;

// Re-export main types and errors
pub use artifact::{Artifact, ArtifactSpec};
pub use definition::{
    CommandSpec, PipelineConfig, PipelineDefinition, PipelinePost, RetentionSpec,
    StageDefinition, StagePost, DEFAULT_BUILDS_TO_KEEP, DEFAULT_TIMEOUT_MINUTES,
    MAX_TIMEOUT_MINUTES,
};
pub use error::{best_effort, ConfigError, EngineError, Result};
pub use record::{
    BuildId, BuildRecord, BuildRecorder, CommandRecord, PostOutcome, PostStatus, StageResult,
};
pub use sequence::BuildSequence;
pub use status::{BuildStatus, FailureReason, StageState, StageStatus};
