//! Test command selection and execution.
//!
//! The project family is looked up from the repository identifier in a small
//! closed table. Django narrows its run to the test modules touched by the
//! instance's test patch; every other family runs a fixed pytest invocation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::patch::PatchDocument;
use super::workspace::Workspace;
use super::{tail, SweInstance};
use crate::error::ErrorKind;
use crate::runner::{CommandSpec, ProcessRunner};

const OUTPUT_LIMIT: usize = 20_000;
const MAX_DJANGO_LABELS: usize = 3;

/// Known project families, each with its own test strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectFamily {
    Django,
    Sympy,
    Requests,
    Flask,
    /// Fallback for repositories with no dedicated strategy.
    Generic,
}

/// Lookup table, checked in order against the lowercased repository.
const FAMILIES: [(&str, ProjectFamily); 4] = [
    ("django", ProjectFamily::Django),
    ("sympy", ProjectFamily::Sympy),
    ("requests", ProjectFamily::Requests),
    ("flask", ProjectFamily::Flask),
];

impl ProjectFamily {
    pub fn detect(repo: &str) -> Self {
        let repo_lower = repo.to_lowercase();
        match FAMILIES.iter().find(|(key, _)| repo_lower.contains(key)) {
            Some((_, family)) => *family,
            None => {
                debug!(repo = %repo, "No test strategy for repository, using generic pytest run");
                ProjectFamily::Generic
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Django => "django",
            Self::Sympy => "sympy",
            Self::Requests => "requests",
            Self::Flask => "flask",
            Self::Generic => "generic",
        }
    }

    /// Interpreter arguments for this family.
    pub fn test_args(&self, test_patch: Option<&str>) -> Vec<String> {
        match self {
            Self::Django => {
                let mut args = vec!["tests/runtests.py".to_string(), "--verbosity=2".to_string()];
                if let Some(patch) = test_patch {
                    args.extend(django_test_labels(patch));
                }
                args
            }
            Self::Sympy => ["-m", "pytest", "-xvs", "sympy/"].map(String::from).to_vec(),
            Self::Requests | Self::Flask | Self::Generic => {
                ["-m", "pytest", "-xvs"].map(String::from).to_vec()
            }
        }
    }
}

impl std::fmt::Display for ProjectFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Test module labels for Django's runner, from the files a test patch touches.
///
/// `tests/queries/test_q.py` becomes `queries.test_q`. At most three labels.
pub fn django_test_labels(test_patch: &str) -> Vec<String> {
    PatchDocument::new(test_patch)
        .changed_files()
        .into_iter()
        .filter(|path| path.contains("test"))
        .map(|path| {
            let path = path.strip_prefix("tests/").unwrap_or(&path);
            let path = path.strip_suffix(".py").unwrap_or(path);
            path.replace('/', ".")
        })
        .take(MAX_DJANGO_LABELS)
        .collect()
}

/// Result of one test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// True iff the test process exited with code zero.
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// `timeout` or `test_execution_error` when the run did not pass.
    pub error: Option<ErrorKind>,
    pub command: String,
    /// Tail of combined stdout and stderr.
    pub output: String,
    pub duration_secs: f64,
}

/// Runs the project test suite in a workspace.
pub struct TestExecutor {
    runner: Arc<dyn ProcessRunner>,
    python: String,
    timeout: Duration,
}

impl TestExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>, python: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            python: python.into(),
            timeout,
        }
    }

    /// Full command for `instance` in `workspace`.
    pub fn command(&self, workspace: &Workspace, instance: &SweInstance) -> CommandSpec {
        let family = ProjectFamily::detect(&instance.repo);
        CommandSpec::new(self.python.clone())
            .args(family.test_args(instance.test_patch.as_deref()))
            .current_dir(&workspace.path)
            .env("PYTHONPATH", workspace.path.display().to_string())
            .timeout(self.timeout)
    }

    pub async fn run(&self, workspace: &Workspace, instance: &SweInstance) -> TestOutcome {
        let spec = self.command(workspace, instance);
        let command = spec.command_line();
        info!(
            instance_id = %instance.instance_id,
            family = %ProjectFamily::detect(&instance.repo),
            "Running: {}",
            command
        );

        match self.runner.run(&spec).await {
            Ok(out) => {
                let passed = out.success();
                if passed {
                    info!(instance_id = %instance.instance_id, "Tests PASSED");
                } else {
                    info!(instance_id = %instance.instance_id, exit_code = out.code(), "Tests FAILED");
                    debug!("{}", tail(&out.combined(), 1000));
                }
                TestOutcome {
                    passed,
                    exit_code: out.exit_code,
                    timed_out: false,
                    error: (!passed).then_some(ErrorKind::TestExecutionError),
                    command,
                    output: tail(&out.combined(), OUTPUT_LIMIT),
                    duration_secs: out.duration.as_secs_f64(),
                }
            }
            Err(e) if e.is_timeout() => {
                warn!(
                    instance_id = %instance.instance_id,
                    "Tests timed out after {}s",
                    self.timeout.as_secs()
                );
                TestOutcome {
                    passed: false,
                    exit_code: None,
                    timed_out: true,
                    error: Some(ErrorKind::Timeout),
                    command,
                    output: e.to_string(),
                    duration_secs: self.timeout.as_secs_f64(),
                }
            }
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "Test command could not run");
                TestOutcome {
                    passed: false,
                    exit_code: None,
                    timed_out: false,
                    error: Some(ErrorKind::TestExecutionError),
                    command,
                    output: e.to_string(),
                    duration_secs: 0.0,
                }
            }
        }
    }
}
