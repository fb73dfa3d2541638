//! Stage graph execution: ordering, abort policy and per-stage artifacts.

use pipewright_core::obs;
use pipewright_core::{BuildRecorder, PipelineDefinition, Result, StageState};
use tracing::{info, warn};

use crate::artifacts::ArtifactCollector;
use crate::stage::{execute_stage, StageContext};

/// How the stage graph ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphOutcome {
    /// An external abort interrupted a stage.
    pub aborted: bool,
    /// The global deadline ran out.
    pub timed_out: bool,
    /// Stage after which no further stages ran.
    pub halted_at: Option<String>,
}

/// Run the enabled stages of `definition` in execution order.
///
/// Each finished stage is pushed to `recorder` exactly once. After a fatal
/// failure, an abort or a global timeout the remaining stages are skipped
/// and get no result. Disabled stages are skipped silently.
pub async fn run_graph(
    definition: &PipelineDefinition,
    ctx: &StageContext<'_>,
    collector: &mut ArtifactCollector,
    recorder: &mut BuildRecorder,
) -> Result<GraphOutcome> {
    let order = definition.execution_order()?;
    let build_id = recorder.build_id();
    let mut outcome = GraphOutcome::default();

    for stage in order {
        if outcome.halted_at.is_some() {
            obs::emit_stage_skipped(&stage.name, "pipeline halted");
            continue;
        }
        if !stage.enabled {
            obs::emit_stage_skipped(&stage.name, "disabled");
            continue;
        }

        let mut exec = execute_stage(stage, ctx).await?;
        for warning in &exec.warnings {
            recorder.warn(warning);
        }

        // Artifacts are collected whatever the stage outcome.
        match collector.collect(build_id, &stage.artifacts, ctx.workspace) {
            Ok(collected) => {
                exec.result.artifacts = collected.artifacts;
                for err in collected.errors {
                    exec.result.post.record_failure(err.to_string());
                }
            }
            Err(e) => {
                warn!(stage = %stage.name, error = %e, "artifact store unavailable");
                exec.result.post.record_failure(e.to_string());
            }
        }
        if !exec.deadline_exceeded && !exec.aborted {
            exec.result.post.mark_ran();
        }
        exec.state.transition(StageState::PostProcessed)?;

        if exec.aborted {
            recorder.mark_aborted();
            outcome.aborted = true;
        }
        if exec.deadline_exceeded {
            outcome.timed_out = true;
        }
        let halt = exec.result.is_fatal_failure() || exec.aborted || exec.deadline_exceeded;
        if halt {
            info!(stage = %stage.name, reason = ?exec.result.reason, "halting pipeline");
            if let Some(err) = exec.result.failure_error() {
                recorder.halt(&err);
            }
            outcome.halted_at = Some(stage.name.clone());
        }
        recorder.push_stage(exec.result);
    }

    Ok(outcome)
}
