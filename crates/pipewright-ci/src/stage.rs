//! Execution of a single stage: commands, outcome classification and
//! stage-level post-actions.

use chrono::Utc;
use pipewright_core::obs;
use pipewright_core::{
    CommandRecord, CommandSpec, EngineError, FailureReason, PostOutcome, Result,
    StageDefinition, StageResult, StageState, StageStatus,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::runner::{CommandOutput, CommandRunner, Invocation, RunnerError};

/// Everything a stage needs from the running build.
pub struct StageContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub workspace: &'a Path,
    /// Build-wide environment (builtins plus the definition's `env`).
    pub env: &'a BTreeMap<String, String>,
    /// Global build deadline. Command timeouts are clamped to it.
    pub deadline: Instant,
    pub cancel: &'a CancelSignal,
}

impl StageContext<'_> {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Resolve a command against the workspace, the build env and a timeout.
    pub(crate) fn invocation(&self, cmd: &CommandSpec, fallback_secs: Option<u64>) -> Invocation {
        let remaining = self.remaining();
        let timeout = cmd
            .timeout_secs
            .or(fallback_secs)
            .map(Duration::from_secs)
            .map_or(remaining, |t| t.min(remaining));

        let mut env = self.env.clone();
        env.extend(cmd.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let working_dir = match &cmd.working_dir {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.to_path_buf(),
        };

        Invocation {
            argv: cmd.argv.clone(),
            working_dir,
            env,
            timeout,
        }
    }
}

/// A stage result plus what the pipeline needs to decide how to continue.
#[derive(Debug)]
pub struct StageExecution {
    pub result: StageResult,
    pub state: StageState,
    /// The global deadline ran out during this stage.
    pub deadline_exceeded: bool,
    /// An external abort interrupted this stage.
    pub aborted: bool,
    /// Swallowed best-effort failures.
    pub warnings: Vec<EngineError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Ok,
    Degraded,
    Failed(FailureReason),
}

/// Output of one command attempt, normalised for the stage log.
struct Attempt {
    record: CommandRecord,
    verdict: Verdict,
    stdout: String,
    stderr: String,
    spawn_error: Option<RunnerError>,
}

fn classify(cmd: &CommandSpec, out: &CommandOutput) -> Verdict {
    if out.cancelled {
        return Verdict::Failed(FailureReason::Aborted);
    }
    if out.timed_out {
        return Verdict::Failed(FailureReason::Timeout);
    }
    match out.exit_code {
        Some(0) => Verdict::Ok,
        Some(code) if cmd.unstable_exit_codes.contains(&code) => Verdict::Degraded,
        code => Verdict::Failed(FailureReason::ExitCode {
            code: code.unwrap_or(-1),
        }),
    }
}

async fn run_command(ctx: &StageContext<'_>, cmd: &CommandSpec, fallback_secs: Option<u64>) -> Attempt {
    let invocation = ctx.invocation(cmd, fallback_secs);
    let timeout_ms = invocation.timeout.as_millis() as u64;
    debug!(command = %invocation.display(), timeout_ms, "running command");

    match ctx.runner.run(&invocation, ctx.cancel).await {
        Ok(out) => {
            let verdict = classify(cmd, &out);
            Attempt {
                record: CommandRecord {
                    argv: cmd.argv.clone(),
                    exit_code: out.exit_code,
                    duration_ms: out.duration_ms,
                    timeout_ms,
                    timed_out: out.timed_out,
                    cancelled: out.cancelled,
                    best_effort: cmd.best_effort,
                    succeeded: !matches!(verdict, Verdict::Failed(_)),
                },
                verdict,
                stdout: out.stdout,
                stderr: out.stderr,
                spawn_error: None,
            }
        }
        Err(e) => Attempt {
            record: CommandRecord {
                argv: cmd.argv.clone(),
                exit_code: None,
                duration_ms: 0,
                timeout_ms,
                timed_out: false,
                cancelled: false,
                best_effort: cmd.best_effort,
                succeeded: false,
            },
            verdict: Verdict::Failed(FailureReason::SpawnFailed {
                message: e.to_string(),
            }),
            stdout: String::new(),
            stderr: e.to_string(),
            spawn_error: Some(e),
        },
    }
}

fn append_log(log: &mut String, argv: &[String], chunk: &str) {
    log.push_str("+ ");
    log.push_str(&argv.join(" "));
    log.push('\n');
    log.push_str(chunk);
    if !chunk.is_empty() && !chunk.ends_with('\n') {
        log.push('\n');
    }
}

/// Run a stage's commands in order, then its post-actions.
///
/// The first failing command halts the stage unless it is `best_effort`.
/// Post-actions are skipped when the global deadline ran out or the build
/// was aborted. A post-action failure is recorded on the result's
/// [`PostOutcome`] and never changes the stage status.
pub async fn execute_stage(stage: &StageDefinition, ctx: &StageContext<'_>) -> Result<StageExecution> {
    let mut state = StageState::Pending.transition(StageState::Running)?;
    obs::emit_stage_started(&stage.name, stage.commands.len());

    let started_at = Utc::now();
    let clock = Instant::now();
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut commands = Vec::with_capacity(stage.commands.len());
    let mut warnings = Vec::new();
    let mut degraded = false;
    let mut failure: Option<FailureReason> = None;
    let mut exit_code = None;
    let mut deadline_exceeded = false;
    let mut aborted = false;

    for cmd in &stage.commands {
        if ctx.cancel.is_cancelled() {
            failure = Some(FailureReason::Aborted);
            aborted = true;
            break;
        }
        if ctx.deadline_passed() {
            failure = Some(FailureReason::Timeout);
            deadline_exceeded = true;
            break;
        }

        let attempt = run_command(ctx, cmd, stage.timeout_secs).await;
        append_log(&mut stdout, &cmd.argv, &attempt.stdout);
        append_log(&mut stderr, &cmd.argv, &attempt.stderr);
        let record_exit = attempt.record.exit_code;
        commands.push(attempt.record);

        match attempt.verdict {
            Verdict::Ok => {}
            Verdict::Degraded => {
                debug!(stage = %stage.name, command = %cmd.display(), exit_code = ?record_exit, "degraded exit code");
                degraded = true;
            }
            Verdict::Failed(reason) => {
                let global = match reason {
                    FailureReason::Aborted => {
                        aborted = true;
                        true
                    }
                    FailureReason::Timeout if ctx.deadline_passed() => {
                        deadline_exceeded = true;
                        true
                    }
                    _ => false,
                };

                if cmd.best_effort && !global {
                    let message = match &attempt.spawn_error {
                        Some(e) => e.to_string(),
                        None => reason.to_string(),
                    };
                    let warning = EngineError::BestEffort {
                        step: cmd.display(),
                        message,
                    };
                    warn!(event = "best_effort.failed", stage = %stage.name, error = %warning);
                    warnings.push(warning);
                    continue;
                }

                exit_code = record_exit;
                failure = Some(reason);
                break;
            }
        }
    }

    let status = match (&failure, degraded) {
        (Some(_), _) => StageStatus::Failure,
        (None, true) => StageStatus::Unstable,
        (None, false) => StageStatus::Success,
    };
    state = state.transition(status.into())?;

    let mut post = PostOutcome::default();
    if deadline_exceeded || aborted {
        debug!(stage = %stage.name, "skipping stage post-actions");
    } else {
        let outcome_actions = match status {
            StageStatus::Success => &stage.post.success,
            StageStatus::Failure => &stage.post.failure,
            StageStatus::Unstable => &stage.post.unstable,
        };
        for action in stage.post.always.iter().chain(outcome_actions) {
            let attempt = run_command(ctx, action, stage.timeout_secs).await;
            append_log(&mut stdout, &action.argv, &attempt.stdout);
            append_log(&mut stderr, &action.argv, &attempt.stderr);
            if let Verdict::Failed(reason) = attempt.verdict {
                warn!(stage = %stage.name, action = %action.display(), reason = %reason, "post-action failed");
                post.record_failure(format!("{}: {}", action.display(), reason));
            }
        }
    }

    let duration_ms = clock.elapsed().as_millis() as u64;
    obs::emit_stage_finished(&stage.name, status, duration_ms);

    Ok(StageExecution {
        result: StageResult {
            name: stage.name.clone(),
            status,
            reason: failure,
            exit_code,
            stdout,
            stderr,
            commands,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            non_fatal: stage.non_fatal,
            post,
            artifacts: Vec::new(),
        },
        state,
        deadline_exceeded,
        aborted,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeResponse, FakeRunner};
    use pipewright_core::{PostStatus, StagePost};

    struct Fixture {
        runner: FakeRunner,
        env: BTreeMap<String, String>,
        cancel: CancelSignal,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(runner: FakeRunner) -> Self {
            Self {
                runner,
                env: BTreeMap::new(),
                cancel: CancelSignal::new(),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn ctx(&self, budget: Duration) -> StageContext<'_> {
            StageContext {
                runner: &self.runner,
                workspace: self.dir.path(),
                env: &self.env,
                deadline: Instant::now() + budget,
                cancel: &self.cancel,
            }
        }
    }

    fn cmd(argv: &[&str]) -> CommandSpec {
        CommandSpec::new(argv.iter().copied())
    }

    #[tokio::test]
    async fn test_success_runs_always_then_success_post() {
        let f = Fixture::new(FakeRunner::new());
        let stage = StageDefinition::new("build", vec![cmd(&["make"])]).with_post(StagePost {
            always: vec![cmd(&["archive"])],
            success: vec![cmd(&["notify", "ok"])],
            failure: vec![cmd(&["notify", "bad"])],
            unstable: vec![],
        });

        let exec = execute_stage(&stage, &f.ctx(Duration::from_secs(60))).await.unwrap();
        assert_eq!(exec.result.status, StageStatus::Success);
        assert_eq!(exec.state, StageState::Success);
        assert_eq!(exec.result.post.status, PostStatus::NotRun);
        assert!(!exec.result.post.failed());

        let calls: Vec<String> = f.runner.calls().iter().map(|c| c.display()).collect();
        assert_eq!(calls, vec!["make", "archive", "notify ok"]);
    }

    #[tokio::test]
    async fn test_first_failure_halts_remaining_commands() {
        let runner = FakeRunner::new().respond("pytest", FakeResponse::output(1, "", "2 failed"));
        let f = Fixture::new(runner);
        let stage = StageDefinition::new(
            "tests",
            vec![cmd(&["pytest"]), cmd(&["coverage", "report"])],
        )
        .with_post(StagePost {
            failure: vec![cmd(&["collect-logs"])],
            ..Default::default()
        });

        let exec = execute_stage(&stage, &f.ctx(Duration::from_secs(60))).await.unwrap();
        assert_eq!(exec.result.status, StageStatus::Failure);
        assert_eq!(exec.result.reason, Some(FailureReason::ExitCode { code: 1 }));
        assert_eq!(exec.result.exit_code, Some(1));
        assert!(exec.result.stderr.contains("2 failed"));
        assert_eq!(exec.result.commands.len(), 1);

        let calls: Vec<String> = f.runner.calls().iter().map(|c| c.display()).collect();
        assert_eq!(calls, vec!["pytest", "collect-logs"]);
    }

    #[tokio::test]
    async fn test_best_effort_failure_is_a_warning() {
        let runner = FakeRunner::new()
            .respond("docker stop app", FakeResponse::exit(1))
            .respond("docker rm app", FakeResponse::SpawnError);
        let f = Fixture::new(runner);
        let stage = StageDefinition::new(
            "teardown",
            vec![
                cmd(&["docker", "stop", "app"]).best_effort(),
                cmd(&["docker", "rm", "app"]).best_effort(),
                cmd(&["echo", "done"]),
            ],
        );

        let exec = execute_stage(&stage, &f.ctx(Duration::from_secs(60))).await.unwrap();
        assert_eq!(exec.result.status, StageStatus::Success);
        assert_eq!(exec.warnings.len(), 2);
        assert!(exec.warnings.iter().all(EngineError::is_best_effort));
        assert_eq!(exec.result.commands.len(), 3);
    }

    #[tokio::test]
    async fn test_unstable_exit_code_degrades() {
        let runner = FakeRunner::new().respond("pytest", FakeResponse::exit(1));
        let f = Fixture::new(runner);
        let stage = StageDefinition::new("tests", vec![cmd(&["pytest"]).unstable_on(&[1])])
            .with_post(StagePost {
                unstable: vec![cmd(&["mark-unstable"])],
                ..Default::default()
            });

        let exec = execute_stage(&stage, &f.ctx(Duration::from_secs(60))).await.unwrap();
        assert_eq!(exec.result.status, StageStatus::Unstable);
        assert!(exec.result.reason.is_none());
        assert!(f.runner.calls().iter().any(|c| c.display() == "mark-unstable"));
    }

    #[tokio::test]
    async fn test_post_failure_does_not_change_status() {
        let runner = FakeRunner::new().respond("archive", FakeResponse::exit(2));
        let f = Fixture::new(runner);
        let stage = StageDefinition::new("build", vec![cmd(&["make"])]).with_post(StagePost {
            always: vec![cmd(&["archive"])],
            ..Default::default()
        });

        let exec = execute_stage(&stage, &f.ctx(Duration::from_secs(60))).await.unwrap();
        assert_eq!(exec.result.status, StageStatus::Success);
        assert!(exec.result.post.failed());
        assert!(exec.result.post.failures[0].contains("archive"));
    }

    #[tokio::test]
    async fn test_command_timeout_fails_stage_with_timeout_reason() {
        let runner = FakeRunner::new().respond("sleep", FakeResponse::Hang);
        let f = Fixture::new(runner);
        let stage = StageDefinition::new("slow", vec![cmd(&["sleep"])]).with_timeout_secs(0);

        let exec = execute_stage(&stage, &f.ctx(Duration::from_secs(60))).await.unwrap();
        assert_eq!(exec.result.status, StageStatus::Failure);
        assert_eq!(exec.result.reason, Some(FailureReason::Timeout));
        assert!(!exec.deadline_exceeded);
    }

    #[tokio::test]
    async fn test_global_deadline_skips_post_actions() {
        let runner = FakeRunner::new().respond("sleep", FakeResponse::Hang);
        let f = Fixture::new(runner);
        let stage = StageDefinition::new("slow", vec![cmd(&["sleep"])]).with_post(StagePost {
            always: vec![cmd(&["archive"])],
            ..Default::default()
        });

        let exec = execute_stage(&stage, &f.ctx(Duration::from_millis(50))).await.unwrap();
        assert_eq!(exec.result.reason, Some(FailureReason::Timeout));
        assert!(exec.deadline_exceeded);
        assert_eq!(exec.result.post.status, PostStatus::NotRun);
        assert_eq!(f.runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_interrupts_stage() {
        let runner = FakeRunner::new().respond("deploy", FakeResponse::Hang);
        let f = Fixture::new(runner);
        let trigger = f.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel("operator abort");
        });
        let stage = StageDefinition::new("deploy", vec![cmd(&["deploy"]), cmd(&["verify"])]);

        let exec = execute_stage(&stage, &f.ctx(Duration::from_secs(60))).await.unwrap();
        assert!(exec.aborted);
        assert_eq!(exec.result.reason, Some(FailureReason::Aborted));
        assert_eq!(f.runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_stage() {
        let runner = FakeRunner::new().respond("docker build .", FakeResponse::SpawnError);
        let f = Fixture::new(runner);
        let stage = StageDefinition::new("containerize", vec![cmd(&["docker", "build", "."])]);

        let exec = execute_stage(&stage, &f.ctx(Duration::from_secs(60))).await.unwrap();
        assert_eq!(exec.result.status, StageStatus::Failure);
        assert!(matches!(
            exec.result.reason,
            Some(FailureReason::SpawnFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_command_env_overrides_build_env() {
        let mut f = Fixture::new(FakeRunner::new());
        f.env.insert("IMAGE_TAG".to_string(), "7".to_string());
        f.env.insert("STAGE".to_string(), "build".to_string());
        let stage = StageDefinition::new(
            "build",
            vec![cmd(&["make"]).with_env("STAGE", "override").with_timeout_secs(5)],
        );

        execute_stage(&stage, &f.ctx(Duration::from_secs(60))).await.unwrap();
        let calls = f.runner.calls();
        assert_eq!(calls[0].env.get("IMAGE_TAG").map(String::as_str), Some("7"));
        assert_eq!(calls[0].env.get("STAGE").map(String::as_str), Some("override"));
        assert_eq!(calls[0].timeout, Duration::from_secs(5));
        assert_eq!(calls[0].working_dir, f.dir.path());
    }
}
