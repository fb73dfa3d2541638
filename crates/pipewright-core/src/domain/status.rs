//! Build and stage status types, plus the per-stage state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::error::{EngineError, Result};

/// Overall status of a build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failure,
    Unstable,
    Aborted,
}

impl BuildStatus {
    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildStatus::Success => 0,
            BuildStatus::Failure => 1,
            BuildStatus::Unstable => 2,
            BuildStatus::Aborted => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Unstable => "unstable",
            BuildStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a single stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failure,
    Unstable,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::Failure => "failure",
            StageStatus::Unstable => "unstable",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage ended in [`StageStatus::Failure`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A command exited with a fatal code.
    ExitCode { code: i32 },
    /// Per-command or global deadline exceeded.
    Timeout,
    /// External abort signal.
    Aborted,
    /// The command could not be started.
    SpawnFailed { message: String },
}

impl FailureReason {
    /// Short reason tag as surfaced in reports.
    pub fn tag(&self) -> &'static str {
        match self {
            FailureReason::ExitCode { .. } => "exit_code",
            FailureReason::Timeout => "timeout",
            FailureReason::Aborted => "aborted",
            FailureReason::SpawnFailed { .. } => "spawn_failed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitCode { code } => write!(f, "exit code {}", code),
            FailureReason::SpawnFailed { message } => write!(f, "spawn failed: {}", message),
            other => f.write_str(other.tag()),
        }
    }
}

/// Lifecycle state of a stage during a run.
///
/// `Pending -> Running -> {Success, Failure, Unstable} -> PostProcessed`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Pending,
    Running,
    Success,
    Failure,
    Unstable,
    PostProcessed,
}

impl StageState {
    /// Move to `next`, rejecting transitions outside the lifecycle.
    pub fn transition(self, next: StageState) -> Result<StageState> {
        use StageState::*;
        let allowed = matches!(
            (self, next),
            (Pending, Running)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Unstable)
                | (Success, PostProcessed)
                | (Failure, PostProcessed)
                | (Unstable, PostProcessed)
        );
        if allowed {
            Ok(next)
        } else {
            Err(EngineError::InvalidTransition {
                current: format!("{:?}", self),
                requested: format!("{:?}", next),
            })
        }
    }
}

impl From<StageStatus> for StageState {
    fn from(status: StageStatus) -> Self {
        match status {
            StageStatus::Success => StageState::Success,
            StageStatus::Failure => StageState::Failure,
            StageStatus::Unstable => StageState::Unstable,
        }
    }
}
