//! Pipewright CI - pipeline execution engine
//!
//! Provides the pieces that run a `PipelineDefinition`:
//! - A command runner with timeouts, cancellation and process-group kill
//! - Stage execution with post-actions and an abort-on-failure stage graph
//! - Artifact collection and retention in a per-pipeline store
//! - A controller that owns workspace, hooks, cleanup and reports

pub mod artifacts;
pub mod cancel;
pub mod controller;
pub mod fakes;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod stage;
pub mod workspace;

// Re-export key types
pub use artifacts::{ArtifactCollector, ArtifactIndex, BuildArtifacts, CollectOutcome, PruneReport};
pub use cancel::CancelSignal;
pub use controller::{build_env, Controller, DEFAULT_HOOK_TIMEOUT};
pub use pipeline::{run_graph, GraphOutcome};
pub use registry::{RunLease, RunRegistry};
pub use runner::{find_on_path, CommandOutput, CommandRunner, Invocation, ProcessRunner, RunnerError};
pub use stage::{execute_stage, StageContext, StageExecution};
pub use workspace::Workspace;
