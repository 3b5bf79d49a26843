//! External process execution with a hard wall-clock deadline.
//!
//! Every git, agent and test invocation goes through [`ProcessRunner`], so
//! the pipeline can be driven by a scripted double in tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::ProcessError;

/// A fully described external command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to launch.
    pub program: String,
    /// Arguments passed verbatim (no shell).
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Environment overrides layered over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Text piped to standard input, if any.
    pub stdin: Option<String>,
    /// Wall-clock deadline.
    pub timeout: Duration,
}

impl CommandSpec {
    /// Creates a command with a 60 second default deadline.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Adds an environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Pipes the given text to standard input.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Sets the deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program and arguments joined by spaces, for logs and matching.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a process that exited before its deadline.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    /// Returns true if the process exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Exit code with signals folded to -1.
    pub fn code(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Launches external programs.
///
/// A timeout is reported as [`ProcessError::Timeout`], never as a non-zero
/// exit code: callers treat it as "unknown", not "failed".
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands on the host through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        debug!(command = %truncate_line(&spec.command_line(), 200), "Spawning process");

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        let input = spec.stdin.clone();
        let stdin = child.stdin.take();
        // The child is owned by this future; dropping it on timeout kills the process.
        let wait = async move {
            if let (Some(input), Some(mut stdin)) = (input, stdin) {
                // A child may exit without draining its input; its status and stderr still count.
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "Child closed stdin early");
                }
                stdin.shutdown().await.ok();
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(spec.timeout, wait).await {
            Ok(Ok(output)) => Ok(ProcessOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: start.elapsed(),
            }),
            Ok(Err(e)) => Err(ProcessError::Io(e)),
            Err(_) => Err(ProcessError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout,
            }),
        }
    }
}

fn truncate_line(s: &str, max: usize) -> String {
    crate::swe::truncate(s, max)
}

/// Scripted [`ProcessRunner`] used by tests.
///
/// Rules match on the prefix of [`CommandSpec::command_line`] and are
/// checked in insertion order. Unmatched commands exit 0 with no output.
pub mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Produces the reply for a matched command.
    pub type Responder =
        Arc<dyn Fn(&CommandSpec) -> Result<ProcessOutput, ProcessError> + Send + Sync>;

    struct Rule {
        prefix: String,
        remaining: Option<usize>,
        responder: Responder,
    }

    /// Records every command and answers from a rule table.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answers every command starting with `prefix`.
        pub fn on(&self, prefix: impl Into<String>, responder: Responder) -> &Self {
            self.push(prefix.into(), None, responder)
        }

        /// Answers the next command starting with `prefix`, then falls through.
        pub fn once(&self, prefix: impl Into<String>, responder: Responder) -> &Self {
            self.push(prefix.into(), Some(1), responder)
        }

        fn push(&self, prefix: String, remaining: Option<usize>, responder: Responder) -> &Self {
            if let Ok(mut rules) = self.rules.lock() {
                rules.push(Rule {
                    prefix,
                    remaining,
                    responder,
                });
            }
            self
        }

        /// Every command run so far, in order.
        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        /// Number of recorded commands whose command line starts with `prefix`.
        pub fn count(&self, prefix: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.command_line().starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(spec.clone());
            }
            let line = spec.command_line();
            let responder = {
                let mut rules = match self.rules.lock() {
                    Ok(rules) => rules,
                    Err(_) => return Ok(ProcessOutput::default()),
                };
                rules
                    .iter_mut()
                    .find(|r| r.remaining != Some(0) && line.starts_with(&r.prefix))
                    .map(|rule| {
                        if let Some(n) = rule.remaining.as_mut() {
                            *n -= 1;
                        }
                        rule.responder.clone()
                    })
            };
            match responder {
                Some(responder) => responder(spec),
                None => Ok(ProcessOutput {
                    exit_code: Some(0),
                    ..Default::default()
                }),
            }
        }
    }

    /// Exit 0 with the given stdout.
    pub fn reply_ok(stdout: impl Into<String>) -> Responder {
        let stdout = stdout.into();
        Arc::new(move |_: &CommandSpec| -> Result<ProcessOutput, ProcessError> {
            Ok(ProcessOutput {
                exit_code: Some(0),
                stdout: stdout.clone(),
                ..Default::default()
            })
        })
    }

    /// Exit with `code` and the given stderr.
    pub fn reply_exit(code: i32, stderr: impl Into<String>) -> Responder {
        let stderr = stderr.into();
        Arc::new(move |_: &CommandSpec| -> Result<ProcessOutput, ProcessError> {
            Ok(ProcessOutput {
                exit_code: Some(code),
                stderr: stderr.clone(),
                ..Default::default()
            })
        })
    }

    /// Deadline elapsed.
    pub fn reply_timeout() -> Responder {
        Arc::new(|spec: &CommandSpec| -> Result<ProcessOutput, ProcessError> {
            Err(ProcessError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout,
            })
        })
    }
}
