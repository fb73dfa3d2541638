//! Scripted command runner for deterministic pipeline tests.
//!
//! Responses are keyed by the command line (`argv` joined with spaces).
//! Unscripted commands exit 0 with no output.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::cancel::CancelSignal;
use crate::runner::{CommandOutput, CommandRunner, Invocation, RunnerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeResponse {
    Output {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// Never exits on its own: ends with the invocation timeout or on cancel.
    Hang,
    /// Behaves like an executable that is not installed.
    SpawnError,
}

impl FakeResponse {
    pub fn exit(code: i32) -> Self {
        Self::output(code, "", "")
    }

    pub fn output(code: i32, stdout: &str, stderr: &str) -> Self {
        FakeResponse::Output {
            exit_code: code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeRunner {
    responses: HashMap<String, FakeResponse>,
    calls: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, command_line: &str, response: FakeResponse) -> Self {
        self.responses.insert(command_line.to_string(), response);
        self
    }

    /// Invocations seen so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Whether a command line was invoked.
    pub fn was_called(&self, command_line: &str) -> bool {
        self.calls().iter().any(|c| c.display() == command_line)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancelSignal,
    ) -> Result<CommandOutput, RunnerError> {
        if invocation.argv.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(invocation.clone());

        let start = Instant::now();
        let response = self
            .responses
            .get(&invocation.display())
            .cloned()
            .unwrap_or_else(|| FakeResponse::exit(0));

        match response {
            FakeResponse::Output {
                exit_code,
                stdout,
                stderr,
            } => Ok(CommandOutput {
                exit_code: Some(exit_code),
                stdout,
                stderr,
                duration_ms: start.elapsed().as_millis() as u64,
                ..Default::default()
            }),
            FakeResponse::Hang => {
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(invocation.timeout) => false,
                    _ = cancel.cancelled() => true,
                };
                Ok(CommandOutput {
                    exit_code: None,
                    timed_out: !cancelled,
                    cancelled,
                    duration_ms: start.elapsed().as_millis() as u64,
                    ..Default::default()
                })
            }
            FakeResponse::SpawnError => Err(RunnerError::ToolMissing {
                program: invocation.argv[0].clone(),
            }),
        }
    }
}
