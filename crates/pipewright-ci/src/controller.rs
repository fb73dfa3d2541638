//! Build controller: drives one pipeline execution end to end.
//!
//! Order of a build:
//! 1. claim the pipeline in the run registry, register the build
//! 2. acquire a fresh workspace, check required tools
//! 3. run the stage graph
//! 4. pipeline post hooks (`always`, then the outcome's hooks)
//! 5. cleanup commands and retention
//! 6. destroy the workspace, write reports, return the record

use pipewright_core::obs;
use pipewright_core::{
    best_effort, write_build_reports, BuildId, BuildRecord, BuildRecorder, BuildStatus,
    CommandSpec, EngineError, PipelineDefinition, Result,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::artifacts::ArtifactCollector;
use crate::cancel::CancelSignal;
use crate::pipeline::run_graph;
use crate::registry::RunRegistry;
use crate::runner::{find_on_path, CommandRunner, ProcessRunner};
use crate::stage::StageContext;
use crate::workspace::Workspace;

/// Budget for each group of pipeline hooks, cleanup and retention commands.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct Controller {
    runner: Arc<dyn CommandRunner>,
    registry: Arc<RunRegistry>,
    workspace_root: PathBuf,
    store_root: PathBuf,
    hook_timeout: Duration,
}

impl Controller {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        workspace_root: impl Into<PathBuf>,
        store_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            registry: RunRegistry::global(),
            workspace_root: workspace_root.into(),
            store_root: store_root.into(),
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Controller running real local processes.
    pub fn process(workspace_root: impl Into<PathBuf>, store_root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(ProcessRunner::new()), workspace_root, store_root)
    }

    pub fn with_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    /// Artifact store directory of a pipeline.
    pub fn store_dir(&self, pipeline: &str) -> PathBuf {
        self.store_root.join(pipeline)
    }

    pub fn open_collector(&self, pipeline: &str) -> Result<ArtifactCollector> {
        ArtifactCollector::open(self.store_dir(pipeline))
    }

    pub async fn execute_pipeline(
        &self,
        definition: &PipelineDefinition,
        build_id: BuildId,
    ) -> Result<BuildRecord> {
        self.execute_pipeline_with_cancel(definition, build_id, &CancelSignal::new())
            .await
    }

    /// Execute a build. Cancelling `cancel` aborts the active stage; cleanup
    /// still runs and the record ends up `aborted`.
    ///
    /// Returns `Err` only when the build could not start (invalid definition,
    /// a concurrent run, an unusable artifact store). Every other failure is
    /// reported in the returned record.
    pub async fn execute_pipeline_with_cancel(
        &self,
        definition: &PipelineDefinition,
        build_id: BuildId,
        cancel: &CancelSignal,
    ) -> Result<BuildRecord> {
        definition.validate()?;
        let _lease = self.registry.acquire(&definition.name)?;
        let span = obs::build_span(&definition.name, build_id);
        self.run_build(definition, build_id, cancel)
            .instrument(span)
            .await
    }

    async fn run_build(
        &self,
        def: &PipelineDefinition,
        build_id: BuildId,
        cancel: &CancelSignal,
    ) -> Result<BuildRecord> {
        let mut recorder = BuildRecorder::start(build_id, &def.name, def.stages_digest());
        obs::emit_build_started(&def.name, build_id, &recorder.run_id().to_string());

        let mut collector = self.open_collector(&def.name)?;
        collector.register_build(build_id, recorder.started_at())?;
        let deadline = Instant::now() + def.global_timeout();

        let workspace = match Workspace::acquire(&self.workspace_root, &def.name, build_id) {
            Ok(ws) => Some(ws),
            Err(e) => {
                error!(error = %e, "failed to acquire workspace");
                recorder.fail_early(&e);
                None
            }
        };

        if let Some(mut workspace) = workspace {
            let env = build_env(def, build_id, recorder.run_id(), workspace.path());

            match check_tools(&def.required_tools) {
                Err(e) => {
                    error!(error = %e, "required tool missing, no stage will run");
                    recorder.fail_early(&e);
                }
                Ok(()) => {
                    let ctx = StageContext {
                        runner: self.runner.as_ref(),
                        workspace: workspace.path(),
                        env: &env,
                        deadline,
                        cancel,
                    };
                    match run_graph(def, &ctx, &mut collector, &mut recorder).await {
                        Ok(outcome) if outcome.timed_out => {
                            warn!(limit_minutes = def.config.timeout_minutes, "global timeout reached");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "stage graph failed");
                            recorder.fail_early(&e);
                        }
                    }
                }
            }

            let status = recorder.current_status();
            let outcome_hooks = match status {
                BuildStatus::Success => &def.post.success,
                BuildStatus::Failure => &def.post.failure,
                BuildStatus::Unstable => &def.post.unstable,
                BuildStatus::Aborted => &def.post.aborted,
            };
            let hooks: Vec<&CommandSpec> = def.post.always.iter().chain(outcome_hooks).collect();
            self.run_hooks("post", &hooks, workspace.path(), &env, &mut recorder)
                .await;

            let cleanup: Vec<&CommandSpec> = def.post.cleanup.iter().collect();
            self.run_hooks("cleanup", &cleanup, workspace.path(), &env, &mut recorder)
                .await;

            self.apply_retention(def, &mut collector, workspace.path(), &env, &mut recorder)
                .await;

            for err in workspace.destroy() {
                recorder.warn(&err);
            }
            recorder.set_workspace_destroyed(workspace.is_destroyed());
        }

        let record = recorder.finish();
        let report_dir = collector.build_dir(build_id);
        if let Err(e) = write_build_reports(&report_dir, &record) {
            warn!(error = %e, dir = %report_dir.display(), "failed to write build reports");
        }
        obs::emit_build_finished(build_id, record.status, record.duration_ms, record.stages.len());
        Ok(record)
    }

    /// Run commands as best-effort steps. Failures become record warnings.
    ///
    /// Uses its own cancel signal so hooks still run after an abort.
    async fn run_hooks(
        &self,
        label: &str,
        commands: &[&CommandSpec],
        workspace: &Path,
        env: &BTreeMap<String, String>,
        recorder: &mut BuildRecorder,
    ) {
        if commands.is_empty() {
            return;
        }
        info!(hooks = label, count = commands.len(), "running pipeline hooks");
        let cancel = CancelSignal::new();
        let ctx = StageContext {
            runner: self.runner.as_ref(),
            workspace,
            env,
            deadline: Instant::now() + self.hook_timeout,
            cancel: &cancel,
        };
        for cmd in commands {
            let invocation = ctx.invocation(cmd, None);
            let result = match self.runner.run(&invocation, &cancel).await {
                Ok(out) if out.success() => Ok(()),
                Ok(out) if out.timed_out => Err(format!("timed out after {}ms", out.duration_ms)),
                Ok(out) => Err(format!(
                    "exit code {}: {}",
                    out.exit_code.unwrap_or(-1),
                    out.stderr.trim()
                )),
                Err(e) => Err(e.to_string()),
            };
            let step = format!("{} {}", label, cmd.display());
            if let Some(warning) = best_effort(&step, result) {
                recorder.warn(&warning);
            }
        }
    }

    async fn apply_retention(
        &self,
        def: &PipelineDefinition,
        collector: &mut ArtifactCollector,
        workspace: &Path,
        env: &BTreeMap<String, String>,
        recorder: &mut BuildRecorder,
    ) {
        let keep = def.config.builds_to_keep;
        if keep == 0 {
            return;
        }
        let report = match collector.prune(keep) {
            Ok(report) => report,
            Err(e) => {
                if let Some(warning) = best_effort("retention", Err::<(), _>(e)) {
                    recorder.warn(&warning);
                }
                return;
            }
        };
        for warning in &report.warnings {
            recorder.warn(warning);
        }

        for pruned in &report.pruned {
            let commands: Vec<CommandSpec> = def
                .retention
                .prune_commands
                .iter()
                .map(|cmd| {
                    let mut cmd = cmd.clone();
                    cmd.env.extend(pruned_build_env(def, *pruned));
                    cmd
                })
                .collect();
            let refs: Vec<&CommandSpec> = commands.iter().collect();
            self.run_hooks("retention", &refs, workspace, env, recorder)
                .await;
        }
        recorder.set_pruned(report.pruned);
    }
}

/// Environment every command of a build receives.
///
/// Built-in variables win over the definition's `env` table.
pub fn build_env(
    def: &PipelineDefinition,
    build_id: BuildId,
    run_id: Uuid,
    workspace: &Path,
) -> BTreeMap<String, String> {
    let mut env = def.env.clone();
    let image_name = def
        .config
        .image_name
        .clone()
        .unwrap_or_else(|| def.name.clone());
    env.insert("BUILD_NUMBER".to_string(), build_id.to_string());
    env.insert("IMAGE_NAME".to_string(), image_name);
    env.insert("IMAGE_TAG".to_string(), def.image_tag(build_id));
    env.insert("PIPELINE_NAME".to_string(), def.name.clone());
    env.insert("WORKSPACE".to_string(), workspace.display().to_string());
    env.insert("RUN_ID".to_string(), run_id.to_string());
    env
}

/// Variables a retention command receives for one pruned build.
///
/// `PRUNED_IMAGE_TAG` is only set when tags follow the build number. A fixed
/// `imageTag` is shared with the builds that are kept.
fn pruned_build_env(def: &PipelineDefinition, pruned: BuildId) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PRUNED_BUILD_NUMBER".to_string(), pruned.to_string());
    if def.config.image_tag.is_none() {
        env.insert("PRUNED_IMAGE_TAG".to_string(), def.image_tag(pruned));
    }
    env
}

fn check_tools(tools: &[String]) -> Result<()> {
    for tool in tools {
        if find_on_path(tool).is_none() {
            return Err(EngineError::ToolMissing { tool: tool.clone() });
        }
    }
    Ok(())
}
