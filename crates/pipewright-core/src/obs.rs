//! Structured observability hooks for the build lifecycle.
//!
//! This module provides:
//! - A build-scoped tracing span, `build_span`
//! - Emission functions for lifecycle events: build start/finish, stage
//!   start/finish, retention pruning
//!
//! Events are emitted at `info!` level; filter with `RUST_LOG`.

use tracing::{info, warn};

use crate::domain::{BuildId, BuildStatus, StageStatus};

/// Build-scoped tracing span.
///
/// Attach it to the build future with [`tracing::Instrument`] so every event
/// carries `pipeline` and `build`, across await points too:
///
/// ```ignore
/// run_build().instrument(build_span("etl", BuildId(7))).await;
/// ```
pub fn build_span(pipeline: &str, build_id: BuildId) -> tracing::Span {
    tracing::info_span!("pipewright.build", pipeline = %pipeline, build = build_id.0)
}

pub fn emit_build_started(pipeline: &str, build_id: BuildId, run_id: &str) {
    info!(event = "build.started", pipeline = %pipeline, build = build_id.0, run_id = %run_id);
}

/// Emit event: build finished with status, duration and stage count.
pub fn emit_build_finished(build_id: BuildId, status: BuildStatus, duration_ms: u64, stages: usize) {
    info!(
        event = "build.finished",
        build = build_id.0,
        status = %status,
        duration_ms = duration_ms,
        stages = stages,
    );
}

pub fn emit_stage_started(stage: &str, commands: usize) {
    info!(event = "stage.started", stage = %stage, commands = commands);
}

pub fn emit_stage_finished(stage: &str, status: StageStatus, duration_ms: u64) {
    info!(
        event = "stage.finished",
        stage = %stage,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// Emit event: a stage was not executed because the pipeline stopped early.
pub fn emit_stage_skipped(stage: &str, cause: &str) {
    info!(event = "stage.skipped", stage = %stage, cause = %cause);
}

pub fn emit_retention_pruned(build_id: BuildId, artifacts_removed: usize) {
    info!(
        event = "retention.pruned",
        build = build_id.0,
        artifacts_removed = artifacts_removed,
    );
}

/// Emit event: cleanup could not release a resource (warning level).
pub fn emit_cleanup_error(resource: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cleanup.error", resource = %resource, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_span_create() {
        let span = build_span("etl", BuildId(3));
        let _guard = span.enter();
        emit_stage_started("checkout", 1);
    }
}
