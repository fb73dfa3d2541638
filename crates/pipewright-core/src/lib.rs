//! Pipewright Core Library
//!
//! Domain model, error taxonomy, reports and telemetry shared by the
//! pipeline engine (`pipewright-ci`) and the `pipewright` CLI.

pub mod domain;
pub mod obs;
pub mod reporting;
pub mod telemetry;

pub use domain::{
    best_effort, Artifact, ArtifactSpec, BuildId, BuildRecord, BuildRecorder, BuildSequence,
    BuildStatus, CommandRecord, CommandSpec, ConfigError, EngineError, FailureReason,
    PipelineConfig, PipelineDefinition, PipelinePost, PostOutcome, PostStatus, Result,
    RetentionSpec, StageDefinition, StagePost, StageResult, StageState, StageStatus,
};

pub use obs::build_span;
pub use reporting::{render_build_summary, render_junit_xml, write_build_reports};
pub use telemetry::init_tracing;

/// Pipewright version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
