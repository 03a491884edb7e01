//! Execution adapter: the one boundary where the engine touches external processes.
//!
//! The [`ExecutionAdapter`] trait decouples run orchestration from the actual
//! planner and coding-agent binaries (currently `codex exec`). Tests use the
//! scripted adapter from `test_support`, which never spawns a process.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{AgentCommandConfig, StashConfig};
use crate::io::process::{ChildRun, ProcessError, Supervisor};

/// Input for a planner invocation.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// Fully rendered planner prompt (transcript + project context).
    pub prompt: String,
    /// Working directory for the planner process.
    pub project_root: PathBuf,
    pub timeout: Duration,
}

/// Input for one command execution.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub command: String,
    /// Validated directory under the project root.
    pub cwd: PathBuf,
    pub worktree: String,
    pub timeout: Duration,
}

/// Result of a command that ran to completion (any exit code).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub exit_code: i32,
    /// stdout followed by stderr.
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

impl ExecOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Adapter-level failures. A non-zero exit from `execute` is not one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    Timeout { after: Duration, diagnostics: String },
    Launch { message: String },
    Failed { exit_code: Option<i32>, diagnostics: String },
    Decode { message: String },
}

impl AdapterError {
    /// Captured process output, when there is any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Timeout { diagnostics, .. } | Self::Failed { diagnostics, .. } => {
                Some(diagnostics)
            }
            Self::Launch { .. } | Self::Decode { .. } => None,
        }
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { after, .. } => write!(f, "AdapterTimeout: timed out after {after:?}"),
            Self::Launch { message } => write!(f, "AdapterLaunchFailure: {message}"),
            Self::Failed { exit_code, .. } => {
                write!(f, "ExecutionError: planner exited with status {exit_code:?}")
            }
            Self::Decode { message } => write!(f, "ExecutionError: {message}"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// Capability interface for the two external agents.
///
/// Both calls block until the child exits or the request timeout expires.
pub trait ExecutionAdapter: Send + Sync {
    /// Ask the planning agent for a reply to the rendered prompt.
    fn plan(&self, request: &PlanRequest) -> Result<String, AdapterError>;

    /// Run one command through the coding agent inside `request.cwd`.
    fn execute(&self, request: &ExecuteRequest) -> Result<ExecOutcome, AdapterError>;
}

/// Adapter that spawns the configured `codex exec` command lines.
#[derive(Debug, Clone)]
pub struct CodexAdapter {
    planner: Vec<String>,
    executor: Vec<String>,
    output_limit_bytes: usize,
}

impl CodexAdapter {
    pub fn new(planner: &AgentCommandConfig, executor: &AgentCommandConfig, limit: usize) -> Self {
        Self {
            planner: planner.command.clone(),
            executor: executor.command.clone(),
            output_limit_bytes: limit,
        }
    }

    pub fn from_config(cfg: &StashConfig) -> Self {
        Self::new(&cfg.planner, &cfg.executor, cfg.output_limit_bytes)
    }

    fn run(
        &self,
        argv: &[String],
        workdir: &Path,
        input: &str,
        timeout: Duration,
    ) -> Result<ChildRun, AdapterError> {
        let (program, args) = argv.split_first().ok_or_else(|| AdapterError::Launch {
            message: "empty command line".to_string(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);

        let supervisor = Supervisor {
            deadline: timeout,
            output_limit: self.output_limit_bytes,
        };
        supervisor
            .run(cmd, input.as_bytes())
            .map_err(|err| match err {
                ProcessError::Launch { .. } => AdapterError::Launch {
                    message: err.to_string(),
                },
                other => AdapterError::Failed {
                    exit_code: None,
                    diagnostics: other.to_string(),
                },
            })
    }
}

impl ExecutionAdapter for CodexAdapter {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn plan(&self, request: &PlanRequest) -> Result<String, AdapterError> {
        info!(workdir = %request.project_root.display(), "starting planner");
        let output = self.run(
            &self.planner,
            &request.project_root,
            &request.prompt,
            request.timeout,
        )?;

        if output.timed_out {
            let diagnostics = output.diagnostics("planner");
            warn!(timeout_secs = request.timeout.as_secs(), %diagnostics, "planner timed out");
            return Err(AdapterError::Timeout {
                after: request.timeout,
                diagnostics,
            });
        }
        if !output.status.success() {
            let diagnostics = output.diagnostics("planner");
            warn!(exit_code = ?output.status.code(), %diagnostics, "planner failed");
            return Err(AdapterError::Failed {
                exit_code: output.status.code(),
                diagnostics,
            });
        }

        let text = String::from_utf8(output.stdout.bytes).map_err(|err| AdapterError::Decode {
            message: format!("planner output is not valid UTF-8: {err}"),
        })?;
        debug!(bytes = text.len(), "planner completed successfully");
        Ok(text)
    }

    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), worktree = %request.worktree))]
    fn execute(&self, request: &ExecuteRequest) -> Result<ExecOutcome, AdapterError> {
        info!(cwd = %request.cwd.display(), "starting executor");
        let output = self.run(
            &self.executor,
            &request.cwd,
            &request.command,
            request.timeout,
        )?;

        if output.timed_out {
            let diagnostics = output.diagnostics("executor");
            warn!(timeout_secs = request.timeout.as_secs(), %diagnostics, "executor timed out");
            return Err(AdapterError::Timeout {
                after: request.timeout,
                diagnostics,
            });
        }

        // Killed by a signal: no exit code.
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = output.stdout.text();
        let stderr = output.stderr.text();
        if exit_code != 0 {
            warn!(exit_code, "executed command failed");
        }
        Ok(ExecOutcome {
            exit_code,
            output: format!("{stdout}{stderr}"),
            truncated: output.truncated(),
            stdout,
            stderr,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn adapter(planner: &[&str], executor: &[&str]) -> CodexAdapter {
        let to_cfg = |argv: &[&str]| AgentCommandConfig {
            command: argv.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 5,
        };
        CodexAdapter::new(&to_cfg(planner), &to_cfg(executor), 10_000)
    }

    fn plan_request(dir: &std::path::Path, timeout: Duration) -> PlanRequest {
        PlanRequest {
            prompt: "make notes".to_string(),
            project_root: dir.to_path_buf(),
            timeout,
        }
    }

    #[test]
    fn plan_returns_stdout_of_planner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let codex = adapter(&["sh", "-c", "printf 'reply: '; cat"], &["true"]);
        let text = codex
            .plan(&plan_request(temp.path(), Duration::from_secs(5)))
            .expect("plan");
        assert_eq!(text, "reply: make notes");
    }

    #[test]
    fn plan_nonzero_exit_is_failed_with_diagnostics() {
        let temp = tempfile::tempdir().expect("tempdir");
        let codex = adapter(&["sh", "-c", "echo nope >&2; exit 4"], &["true"]);
        let err = codex
            .plan(&plan_request(temp.path(), Duration::from_secs(5)))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Failed { exit_code: Some(4), .. }));
        assert!(err.diagnostics().is_some_and(|d| d.contains("nope")));
    }

    #[test]
    fn plan_timeout_is_distinct() {
        let temp = tempfile::tempdir().expect("tempdir");
        let codex = adapter(&["sh", "-c", "exec sleep 5"], &["true"]);
        let err = codex
            .plan(&plan_request(temp.path(), Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
    }

    #[test]
    fn missing_binary_is_launch_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let codex = adapter(&["no-such-planner-binary-xyz"], &["true"]);
        let err = codex
            .plan(&plan_request(temp.path(), Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Launch { .. }));
        assert!(err.to_string().starts_with("AdapterLaunchFailure"));
    }

    #[test]
    fn execute_records_nonzero_exit_without_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let codex = adapter(&["true"], &["sh", "-c", "read line; echo \"got $line\"; pwd; exit 2"]);
        let outcome = codex
            .execute(&ExecuteRequest {
                command: "create notes.md\n".to_string(),
                cwd: temp.path().to_path_buf(),
                worktree: "main".to_string(),
                timeout: Duration::from_secs(5),
            })
            .expect("execute");
        assert_eq!(outcome.exit_code, 2);
        assert!(!outcome.succeeded());
        assert!(outcome.stdout.starts_with("got create notes.md"));
        let canonical = temp.path().canonicalize().expect("canonical");
        assert!(outcome.stdout.contains(canonical.to_str().expect("utf8")));
    }
}
