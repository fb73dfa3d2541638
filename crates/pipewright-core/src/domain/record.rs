//! Build records and per-stage results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::artifact::Artifact;
use crate::domain::error::EngineError;
use crate::domain::status::{BuildStatus, FailureReason, StageStatus};

/// Monotonic build number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct BuildId(pub u64);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one command invocation within a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandRecord {
    pub argv: Vec<String>,
    /// `None` when the process was killed or never started.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Time limit the command ran under.
    pub timeout_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    pub best_effort: bool,
    pub succeeded: bool,
}

/// Whether a stage's post-actions ran cleanly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    #[default]
    NotRun,
    Passed,
    Failed,
}

/// Post-action outcome of a stage. Failures here never change the stage status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PostOutcome {
    pub status: PostStatus,
    pub failures: Vec<String>,
}

impl PostOutcome {
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.status = PostStatus::Failed;
        self.failures.push(message.into());
    }

    /// Mark as run; keeps `Failed` if any failure was recorded.
    pub fn mark_ran(&mut self) {
        if self.status == PostStatus::NotRun {
            self.status = PostStatus::Passed;
        }
    }

    pub fn failed(&self) -> bool {
        self.status == PostStatus::Failed
    }
}

/// Result of a single executed stage. Created exactly once per stage per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub reason: Option<FailureReason>,
    /// Exit code of the last failing command, if any.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub commands: Vec<CommandRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Failure was configured as non-fatal.
    pub non_fatal: bool,
    pub post: PostOutcome,
    pub artifacts: Vec<Artifact>,
}

impl StageResult {
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Success
    }

    /// A failure that aborts the pipeline and fails the build.
    pub fn is_fatal_failure(&self) -> bool {
        self.status == StageStatus::Failure && !self.non_fatal
    }

    /// Succeeded-but-degraded, or failed without being fatal.
    pub fn is_degraded(&self) -> bool {
        self.status == StageStatus::Unstable
            || (self.status == StageStatus::Failure && self.non_fatal)
    }

    /// The engine error a failed stage surfaces as. `None` unless failed.
    pub fn failure_error(&self) -> Option<EngineError> {
        if self.status != StageStatus::Failure {
            return None;
        }
        let err = match &self.reason {
            Some(FailureReason::Timeout) => EngineError::Timeout {
                stage: self.name.clone(),
                limit_ms: self
                    .commands
                    .iter()
                    .rev()
                    .find(|c| c.timed_out)
                    .map_or(self.duration_ms, |c| c.timeout_ms),
            },
            reason => EngineError::StageFailed {
                stage: self.name.clone(),
                reason: reason
                    .as_ref()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string),
            },
        };
        Some(err)
    }
}

/// Complete, immutable outcome of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildRecord {
    pub build_id: BuildId,
    pub run_id: Uuid,
    pub pipeline: String,
    pub stages_digest: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: BuildStatus,
    pub stages: Vec<StageResult>,
    /// Best-effort failures that were logged and swallowed.
    pub warnings: Vec<String>,
    /// Error that stopped the build: a setup failure, or the stage failure
    /// that halted the graph.
    pub error: Option<String>,
    pub pruned_builds: Vec<BuildId>,
    pub workspace_destroyed: bool,
}

impl BuildRecord {
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failure)
            .count()
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Mutable builder for a [`BuildRecord`], owned by the controller while a
/// build runs. [`BuildRecorder::finish`] consumes it.
#[derive(Debug)]
pub struct BuildRecorder {
    build_id: BuildId,
    run_id: Uuid,
    pipeline: String,
    stages_digest: String,
    started_at: DateTime<Utc>,
    stages: Vec<StageResult>,
    warnings: Vec<String>,
    error: Option<String>,
    aborted: bool,
    pruned_builds: Vec<BuildId>,
    workspace_destroyed: bool,
}

impl BuildRecorder {
    pub fn start(build_id: BuildId, pipeline: impl Into<String>, stages_digest: String) -> Self {
        Self {
            build_id,
            run_id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            stages_digest,
            started_at: Utc::now(),
            stages: Vec::new(),
            warnings: Vec::new(),
            error: None,
            aborted: false,
            pruned_builds: Vec::new(),
            workspace_destroyed: false,
        }
    }

    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn push_stage(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    /// Record a swallowed best-effort failure.
    pub fn warn(&mut self, warning: &EngineError) {
        self.warnings.push(warning.to_string());
    }

    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    /// Record an error that prevented stages from running.
    pub fn fail_early(&mut self, err: &EngineError) {
        self.error = Some(err.to_string());
    }

    /// Record the error that halted the stage graph. The first one is kept.
    pub fn halt(&mut self, err: &EngineError) {
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
    }

    pub fn set_pruned(&mut self, pruned: Vec<BuildId>) {
        self.pruned_builds = pruned;
    }

    pub fn set_workspace_destroyed(&mut self, destroyed: bool) {
        self.workspace_destroyed = destroyed;
    }

    /// Status implied by what has been recorded so far.
    pub fn current_status(&self) -> BuildStatus {
        if self.aborted {
            BuildStatus::Aborted
        } else if self.error.is_some() || self.stages.iter().any(|s| s.is_fatal_failure()) {
            BuildStatus::Failure
        } else if self.stages.iter().any(|s| s.is_degraded()) {
            BuildStatus::Unstable
        } else {
            BuildStatus::Success
        }
    }

    pub fn finish(self) -> BuildRecord {
        let status = self.current_status();
        let finished_at = Utc::now();
        let duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        BuildRecord {
            build_id: self.build_id,
            run_id: self.run_id,
            pipeline: self.pipeline,
            stages_digest: self.stages_digest,
            started_at: self.started_at,
            finished_at,
            duration_ms,
            status,
            stages: self.stages,
            warnings: self.warnings,
            error: self.error,
            pruned_builds: self.pruned_builds,
            workspace_destroyed: self.workspace_destroyed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, status: StageStatus, non_fatal: bool) -> StageResult {
        let now = Utc::now();
        StageResult {
            name: name.to_string(),
            status,
            reason: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            commands: Vec::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            non_fatal,
            post: PostOutcome::default(),
            artifacts: Vec::new(),
        }
    }

    fn recorder() -> BuildRecorder {
        BuildRecorder::start(BuildId(1), "etl", "digest".to_string())
    }

    #[test]
    fn test_all_success() {
        let mut rec = recorder();
        rec.push_stage(stage("a", StageStatus::Success, false));
        rec.push_stage(stage("b", StageStatus::Success, false));
        let record = rec.finish();
        assert_eq!(record.status, BuildStatus::Success);
        assert_eq!(record.passed_count(), 2);
        assert_eq!(record.failed_count(), 0);
    }

    #[test]
    fn test_fatal_failure_wins() {
        let mut rec = recorder();
        rec.push_stage(stage("a", StageStatus::Unstable, false));
        rec.push_stage(stage("b", StageStatus::Failure, false));
        assert_eq!(rec.finish().status, BuildStatus::Failure);
    }

    #[test]
    fn test_non_fatal_failure_is_unstable() {
        let mut rec = recorder();
        rec.push_stage(stage("a", StageStatus::Failure, true));
        rec.push_stage(stage("b", StageStatus::Success, false));
        let record = rec.finish();
        assert_eq!(record.status, BuildStatus::Unstable);
        assert_eq!(record.failed_count(), 1);
    }

    #[test]
    fn test_aborted_overrides() {
        let mut rec = recorder();
        rec.push_stage(stage("a", StageStatus::Failure, false));
        rec.mark_aborted();
        assert_eq!(rec.finish().status, BuildStatus::Aborted);
    }

    #[test]
    fn test_failure_error_names_stage_and_reason() {
        let mut failed = stage("test", StageStatus::Failure, false);
        failed.reason = Some(FailureReason::ExitCode { code: 2 });
        let err = failed.failure_error().expect("failed stage has an error");
        assert!(matches!(err, EngineError::StageFailed { ref stage, .. } if stage == "test"));
        assert_eq!(err.to_string(), "stage test failed: exit code 2");

        assert!(stage("lint", StageStatus::Unstable, false).failure_error().is_none());
    }

    #[test]
    fn test_timed_out_stage_reports_limit() {
        let mut slow = stage("run", StageStatus::Failure, false);
        slow.reason = Some(FailureReason::Timeout);
        slow.commands.push(CommandRecord {
            argv: vec!["sleep".to_string(), "30".to_string()],
            exit_code: None,
            duration_ms: 1004,
            timeout_ms: 1000,
            timed_out: true,
            cancelled: false,
            best_effort: false,
            succeeded: false,
        });
        let err = slow.failure_error().unwrap();
        assert!(matches!(err, EngineError::Timeout { limit_ms: 1000, .. }));

        let mut rec = recorder();
        rec.push_stage(slow);
        rec.halt(&err);
        rec.halt(&EngineError::ToolMissing {
            tool: "later".to_string(),
        });
        let record = rec.finish();
        assert_eq!(record.status, BuildStatus::Failure);
        assert_eq!(record.error.as_deref(), Some("stage run timed out (limit 1000ms)"));
    }

    #[test]
    fn test_early_error_is_failure() {
        let mut rec = recorder();
        rec.fail_early(&EngineError::ToolMissing {
            tool: "docker".to_string(),
        });
        let record = rec.finish();
        assert_eq!(record.status, BuildStatus::Failure);
        assert!(record.stages.is_empty());
        assert!(record.error.unwrap().contains("docker"));
    }

    #[test]
    fn test_warnings_do_not_change_status() {
        let mut rec = recorder();
        rec.push_stage(stage("a", StageStatus::Success, false));
        rec.warn(&EngineError::BestEffort {
            step: "docker rmi".to_string(),
            message: "no such image".to_string(),
        });
        let record = rec.finish();
        assert_eq!(record.status, BuildStatus::Success);
        assert_eq!(record.warnings.len(), 1);
    }

    #[test]
    fn test_post_outcome_keeps_failed() {
        let mut post = PostOutcome::default();
        post.record_failure("archive failed");
        post.mark_ran();
        assert!(post.failed());

        let mut clean = PostOutcome::default();
        clean.mark_ran();
        assert_eq!(clean.status, PostStatus::Passed);
    }
}
