//! Invoking the agent under test.
//!
//! The agent is a black-box binary run as
//! `<binary> <mode> <prompt> --trajectory-file <path> --non-interactive [--max-steps N]`
//! inside the instance workspace. Only its exit status and whether it wrote a
//! trajectory file are consumed; success is judged downstream from the diff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::process::{CommandSpec, ProcessRunner};
use crate::config::{AgentConfig, EvalConfig};
use crate::swe::{instance_dir_name, tail, Workspace};

const TASK_PREAMBLE: &str = "\
## Bug fix task

Fix the bug described below by changing the repository's source code.

Rules:
1. Edit existing tracked files with your edit tool. Do not write new files \
unless the fix genuinely needs one inside the source tree.
2. Only changes visible in `git diff` are evaluated. Explanations, suggestions \
and analysis count for nothing.
3. Do not write scripts, examples or patches to /tmp or any other scratch location.
4. Work in this order: read the report, locate the relevant code, make the fix, \
then check it with `git diff`.

---

## Bug report

";

const RETRY_ADMONITION: &str = "

## Your previous attempt changed nothing

The last run ended with an empty `git diff`: no tracked file was modified.
This time, edit the existing source files directly with your edit tool and
make the actual code change. Do not create new files.
";

/// Builds the prompt for one attempt.
pub fn build_prompt(problem_statement: &str, is_retry: bool) -> String {
    let mut prompt = String::with_capacity(
        TASK_PREAMBLE.len() + problem_statement.len() + RETRY_ADMONITION.len(),
    );
    prompt.push_str(TASK_PREAMBLE);
    prompt.push_str(problem_statement);
    if is_retry {
        prompt.push_str(RETRY_ADMONITION);
    }
    prompt
}

/// Finds `name` in `./target/release`, then `~/.cargo/bin`, then `PATH`.
pub fn locate_binary(name: &str) -> Option<PathBuf> {
    let mut candidates = vec![PathBuf::from("target").join("release").join(name)];
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".cargo").join("bin").join(name));
    }
    if let Some(paths) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&paths).map(|dir| dir.join(name)));
    }
    candidates.into_iter().find(|p| p.is_file())
}

/// What one agent run left behind.
#[derive(Debug, Clone, Default)]
pub struct InvocationOutcome {
    /// Exit code; `None` if the agent timed out, failed to launch or was signalled.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Launch or I/O failure, if any.
    pub error: Option<String>,
    pub duration: Duration,
    /// Trajectory file, if the agent created one.
    pub trajectory_file: Option<PathBuf>,
    /// Tail of the agent's combined output.
    pub output_tail: String,
}

impl InvocationOutcome {
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Launches the agent binary through a [`ProcessRunner`].
pub struct AgentInvoker {
    runner: Arc<dyn ProcessRunner>,
    binary: PathBuf,
    config: AgentConfig,
    trajectory_root: PathBuf,
}

impl AgentInvoker {
    /// Resolves the binary from the config, falling back to discovery and
    /// finally to the bare name (a launch failure is then reported per attempt).
    pub fn new(runner: Arc<dyn ProcessRunner>, config: &EvalConfig) -> Self {
        let binary = config
            .agent
            .binary
            .clone()
            .or_else(|| locate_binary(&config.agent.binary_name))
            .unwrap_or_else(|| {
                warn!(
                    name = %config.agent.binary_name,
                    "Agent binary not found in target/release, ~/.cargo/bin or PATH"
                );
                PathBuf::from(&config.agent.binary_name)
            });
        Self {
            runner,
            binary,
            config: config.agent.clone(),
            trajectory_root: config.trajectory_dir(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Trajectory path for the given instance and attempt.
    pub fn trajectory_path(&self, instance_id: &str, attempt: u32) -> PathBuf {
        self.trajectory_root
            .join(instance_dir_name(instance_id))
            .join(format!("attempt-{}.json", attempt))
    }

    /// Command line for one attempt.
    pub fn command(&self, workspace: &Workspace, prompt: String, trajectory: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new(self.binary.display().to_string());
        if let Some(mode) = &self.config.mode {
            spec = spec.arg(mode.clone());
        }
        spec = spec
            .arg(prompt)
            .arg("--trajectory-file")
            .arg(trajectory.display().to_string())
            .arg("--non-interactive");
        if let Some(steps) = self.config.step_budget() {
            spec = spec.arg("--max-steps").arg(steps.to_string());
        }
        for (key, value) in &self.config.env {
            spec = spec.env(key.clone(), value.clone());
        }
        spec.current_dir(&workspace.path)
            .timeout(self.config.timeout())
    }

    /// Runs the agent once. Never fails: launch errors and timeouts are
    /// recorded on the outcome.
    pub async fn invoke(
        &self,
        workspace: &Workspace,
        problem_statement: &str,
        attempt: u32,
        is_retry: bool,
    ) -> InvocationOutcome {
        let trajectory = self.trajectory_path(&workspace.instance_id, attempt);
        if let Some(parent) = trajectory.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %e, "Cannot create trajectory directory");
            }
        }
        if tokio::fs::remove_file(&trajectory).await.is_ok() {
            debug!(path = %trajectory.display(), "Removed stale trajectory");
        }

        info!(
            instance_id = %workspace.instance_id,
            attempt,
            retry = is_retry,
            "Running agent {}",
            self.binary.display()
        );
        let spec = self.command(workspace, build_prompt(problem_statement, is_retry), &trajectory);

        let mut outcome = match self.runner.run(&spec).await {
            Ok(out) => {
                if !out.success() {
                    warn!(
                        instance_id = %workspace.instance_id,
                        exit_code = out.code(),
                        "Agent exited with non-zero code"
                    );
                }
                InvocationOutcome {
                    exit_code: out.exit_code,
                    duration: out.duration,
                    output_tail: tail(&out.combined(), 4000),
                    ..Default::default()
                }
            }
            Err(e) if e.is_timeout() => {
                warn!(
                    instance_id = %workspace.instance_id,
                    "Agent timed out after {}s",
                    self.config.timeout_secs
                );
                InvocationOutcome {
                    timed_out: true,
                    duration: self.config.timeout(),
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!(instance_id = %workspace.instance_id, error = %e, "Agent failed to run");
                InvocationOutcome {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        if trajectory.is_file() {
            debug!(path = %trajectory.display(), "Trajectory saved");
            outcome.trajectory_file = Some(trajectory);
        } else {
            debug!(instance_id = %workspace.instance_id, "No trajectory file created");
        }
        outcome
    }
}
