//! SWE-bench evaluation pipeline.
//!
//! Runs the agent under test on pinned repository snapshots, applies the
//! resulting patch together with the instance's held-out test patch, runs the
//! project's tests and records one verdict per instance.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::patch::{ApplyOutcome, PatchApplier, PatchDocument};
use super::retry::{AttemptRecord, RetryController};
use super::test_runner::TestExecutor;
use super::workspace::{Workspace, WorkspaceManager};
use super::{truncate, Prediction, SweInstance};
use crate::config::EvalConfig;
use crate::error::ErrorKind;
use crate::runner::{AgentInvoker, ProcessRunner};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    /// Patch applied and tests passed.
    Resolved,
    /// Patch applied, tests ran and failed.
    Unresolved,
    /// The agent left no diff after every attempt.
    NoPatch,
    /// A patch was produced; scoring was not requested.
    Predicted,
    PatchFailed,
    TestPatchFailed,
    SetupError,
    AgentTimeout,
    TestTimeout,
    InternalError,
}

impl VerdictStatus {
    /// Human-readable label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Unresolved => "tests failed",
            Self::NoPatch => "no patch generated",
            Self::Predicted => "patch generated",
            Self::PatchFailed => "patch failed to apply",
            Self::TestPatchFailed => "test patch failed to apply",
            Self::SetupError => "could not set up",
            Self::AgentTimeout => "agent timed out",
            Self::TestTimeout => "tests timed out",
            Self::InternalError => "internal error",
        }
    }
}

impl std::fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::Unresolved => write!(f, "unresolved"),
            Self::NoPatch => write!(f, "no_patch"),
            Self::Predicted => write!(f, "predicted"),
            Self::PatchFailed => write!(f, "patch_failed"),
            Self::TestPatchFailed => write!(f, "test_patch_failed"),
            Self::SetupError => write!(f, "setup_error"),
            Self::AgentTimeout => write!(f, "agent_timeout"),
            Self::TestTimeout => write!(f, "test_timeout"),
            Self::InternalError => write!(f, "internal_error"),
        }
    }
}

/// Final outcome for one instance. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    pub instance_id: String,
    pub repo: String,
    pub status: VerdictStatus,
    /// Extracted (or supplied) patch; empty when none was produced.
    pub model_patch: String,
    pub patch_applied: bool,
    pub tests_passed: bool,
    /// `patch_applied && tests_passed`.
    pub resolved: bool,
    pub test_command: Option<String>,
    pub test_output: String,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub duration_secs: f64,
}

impl EvaluationVerdict {
    pub fn has_patch(&self) -> bool {
        !self.model_patch.trim().is_empty()
    }

    pub fn to_prediction(&self, model_name: &str) -> Prediction {
        Prediction::new(self.instance_id.clone(), self.model_patch.clone(), model_name)
    }
}

/// Accumulates verdict fields while an instance is in flight.
struct VerdictDraft {
    instance_id: String,
    repo: String,
    model_patch: String,
    patch_applied: bool,
    tests_passed: bool,
    test_command: Option<String>,
    test_output: String,
    attempts: Vec<AttemptRecord>,
    started: Instant,
}

impl VerdictDraft {
    fn new(instance: &SweInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            repo: instance.repo.clone(),
            model_patch: String::new(),
            patch_applied: false,
            tests_passed: false,
            test_command: None,
            test_output: String::new(),
            attempts: Vec::new(),
            started: Instant::now(),
        }
    }

    fn finish(self, status: VerdictStatus) -> EvaluationVerdict {
        self.build(status, None, None)
    }

    fn fail(self, status: VerdictStatus, kind: ErrorKind, error: impl ToString) -> EvaluationVerdict {
        self.build(status, Some(kind), Some(error.to_string()))
    }

    fn build(
        self,
        status: VerdictStatus,
        error_kind: Option<ErrorKind>,
        error: Option<String>,
    ) -> EvaluationVerdict {
        let resolved = self.patch_applied && self.tests_passed && error_kind.is_none();
        EvaluationVerdict {
            instance_id: self.instance_id,
            repo: self.repo,
            status,
            model_patch: self.model_patch,
            patch_applied: self.patch_applied,
            tests_passed: self.tests_passed,
            resolved,
            test_command: self.test_command,
            test_output: self.test_output,
            error_kind,
            error,
            attempts: self.attempts,
            duration_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub patches_generated: usize,
    pub patches_applied: usize,
    /// Instances whose tests passed after the patch applied.
    pub resolved: usize,
    pub pass_rate: f64,
    pub status_counts: BTreeMap<String, usize>,
    pub error_counts: BTreeMap<String, usize>,
    pub elapsed_secs: f64,
    pub verdicts: Vec<EvaluationVerdict>,
}

impl BatchSummary {
    pub fn from_verdicts(
        run_id: String,
        started_at: DateTime<Utc>,
        elapsed_secs: f64,
        verdicts: Vec<EvaluationVerdict>,
    ) -> Self {
        let total = verdicts.len();
        let patches_generated = verdicts.iter().filter(|v| v.has_patch()).count();
        let patches_applied = verdicts.iter().filter(|v| v.patch_applied).count();
        let resolved = verdicts.iter().filter(|v| v.resolved).count();

        let mut status_counts = BTreeMap::new();
        let mut error_counts = BTreeMap::new();
        for v in &verdicts {
            *status_counts.entry(v.status.to_string()).or_insert(0) += 1;
            if let Some(kind) = v.error_kind {
                *error_counts.entry(kind.to_string()).or_insert(0) += 1;
            }
        }

        let pass_rate = if total == 0 {
            0.0
        } else {
            resolved as f64 / total as f64 * 100.0
        };

        Self {
            run_id,
            started_at,
            total,
            patches_generated,
            patches_applied,
            resolved,
            pass_rate: (pass_rate * 10.0).round() / 10.0,
            status_counts,
            error_counts,
            elapsed_secs: (elapsed_secs * 10.0).round() / 10.0,
            verdicts,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One unit of batch work.
#[derive(Debug, Clone)]
pub enum EvaluationJob {
    /// Agent, patch, tests.
    Run(SweInstance),
    /// Agent and retry loop only; yields a prediction.
    Predict(SweInstance),
    /// Score an existing patch; no agent.
    Score { instance: SweInstance, patch: String },
}

impl EvaluationJob {
    pub fn instance(&self) -> &SweInstance {
        match self {
            Self::Run(i) | Self::Predict(i) => i,
            Self::Score { instance, .. } => instance,
        }
    }

    fn produces_prediction(&self) -> bool {
        !matches!(self, Self::Score { .. })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Composes workspace setup, the agent retry loop, patch application and the
/// test run into one verdict per instance.
pub struct EvaluationPipeline {
    config: EvalConfig,
    workspaces: Arc<WorkspaceManager>,
    retry: RetryController,
    patches: Arc<PatchApplier>,
    tests: TestExecutor,
}

impl EvaluationPipeline {
    /// A relative `work_dir` is anchored at the current directory first.
    pub fn new(mut config: EvalConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        config.work_dir = config.work_root();
        let workspaces = Arc::new(WorkspaceManager::new(runner.clone(), &config));
        let agent = Arc::new(AgentInvoker::new(runner.clone(), &config));
        let patches = Arc::new(PatchApplier::new(runner.clone(), config.git_timeout()));
        let retry = RetryController::new(
            workspaces.clone(),
            agent,
            patches.clone(),
            config.max_retries,
        );
        let tests = TestExecutor::new(runner, config.python.clone(), config.test_timeout());
        Self {
            config,
            workspaces,
            retry,
            patches,
            tests,
        }
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Full evaluation: agent, patch, tests.
    pub async fn evaluate(&self, instance: &SweInstance) -> EvaluationVerdict {
        self.execute(&EvaluationJob::Run(instance.clone())).await
    }

    /// Agent and retry loop only.
    pub async fn predict(&self, instance: &SweInstance) -> EvaluationVerdict {
        self.execute(&EvaluationJob::Predict(instance.clone())).await
    }

    /// Scores an existing patch against a fresh workspace.
    pub async fn evaluate_prediction(&self, instance: &SweInstance, patch: &str) -> EvaluationVerdict {
        self.execute(&EvaluationJob::Score {
            instance: instance.clone(),
            patch: patch.to_string(),
        })
        .await
    }

    /// Runs one job to a verdict. Panics are converted to `internal_error`.
    pub async fn execute(&self, job: &EvaluationJob) -> EvaluationVerdict {
        let instance = job.instance();
        match AssertUnwindSafe(self.execute_inner(job)).catch_unwind().await {
            Ok(verdict) => verdict,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(instance_id = %instance.instance_id, "Evaluation panicked: {}", message);
                VerdictDraft::new(instance).fail(
                    VerdictStatus::InternalError,
                    ErrorKind::InternalError,
                    message,
                )
            }
        }
    }

    async fn execute_inner(&self, job: &EvaluationJob) -> EvaluationVerdict {
        let instance = job.instance();
        let mut draft = VerdictDraft::new(instance);

        let workspace = match self.workspaces.prepare(instance).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "Setup failed");
                return draft.fail(VerdictStatus::SetupError, ErrorKind::SetupError, e);
            }
        };

        let patch = match job {
            EvaluationJob::Score { patch, .. } => PatchDocument::new(patch.clone()),
            EvaluationJob::Run(_) | EvaluationJob::Predict(_) => {
                let outcome = match self.retry.run(&workspace, &instance.problem_statement).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let status = match e.kind() {
                            ErrorKind::SetupError => VerdictStatus::SetupError,
                            ErrorKind::Timeout => VerdictStatus::AgentTimeout,
                            _ => VerdictStatus::InternalError,
                        };
                        return draft.fail(status, e.kind(), e);
                    }
                };
                draft.attempts = outcome.attempts;
                if outcome.timed_out {
                    return draft.fail(
                        VerdictStatus::AgentTimeout,
                        ErrorKind::Timeout,
                        format!(
                            "agent timed out after {}s without producing a patch",
                            self.config.agent.timeout_secs
                        ),
                    );
                }
                outcome.patch
            }
        };

        draft.model_patch = patch.text().to_string();
        if patch.is_empty() {
            info!(instance_id = %instance.instance_id, "No patch generated");
            return draft.finish(VerdictStatus::NoPatch);
        }
        if matches!(job, EvaluationJob::Predict(_)) {
            return draft.finish(VerdictStatus::Predicted);
        }

        // The agent's edits are still in the tree; score from a clean checkout.
        if matches!(job, EvaluationJob::Run(_)) {
            if let Err(e) = self.workspaces.reset(&workspace).await {
                return draft.fail(VerdictStatus::SetupError, ErrorKind::SetupError, e);
            }
        }

        self.score(&workspace, instance, patch, draft).await
    }

    async fn score(
        &self,
        workspace: &Workspace,
        instance: &SweInstance,
        mut patch: PatchDocument,
        mut draft: VerdictDraft,
    ) -> EvaluationVerdict {
        match self.patches.validate_and_apply(workspace, &mut patch).await {
            Ok(ApplyOutcome::Applied) => draft.patch_applied = true,
            Ok(ApplyOutcome::NothingToApply) => return draft.finish(VerdictStatus::NoPatch),
            Err(e) => {
                warn!(instance_id = %instance.instance_id, "Patch failed to apply: {}", e);
                return draft.fail(
                    VerdictStatus::PatchFailed,
                    ErrorKind::PatchApplyError,
                    format!("patch failed to apply: {}", e),
                );
            }
        }

        match &instance.test_patch {
            Some(text) => {
                let mut test_patch = PatchDocument::new(text.clone());
                if let Err(e) = self.patches.validate_and_apply(workspace, &mut test_patch).await {
                    warn!(instance_id = %instance.instance_id, "Test patch failed to apply: {}", e);
                    return draft.fail(
                        VerdictStatus::TestPatchFailed,
                        ErrorKind::PatchApplyError,
                        format!("test patch failed to apply: {}", e),
                    );
                }
            }
            None => debug!(instance_id = %instance.instance_id, "No test patch available"),
        }

        let outcome = self.tests.run(workspace, instance).await;
        draft.tests_passed = outcome.passed;
        draft.test_command = Some(outcome.command);
        draft.test_output = outcome.output;

        if outcome.passed {
            draft.finish(VerdictStatus::Resolved)
        } else if outcome.timed_out {
            let message = format!("tests timed out after {}s", self.config.test_timeout_secs);
            draft.fail(VerdictStatus::TestTimeout, ErrorKind::Timeout, message)
        } else {
            let kind = outcome.error.unwrap_or(ErrorKind::TestExecutionError);
            let message = match outcome.exit_code {
                Some(code) => format!("tests exited with code {}", code),
                None => truncate(&draft.test_output, 200),
            };
            draft.fail(VerdictStatus::Unresolved, kind, message)
        }
    }

    /// Runs `jobs` with bounded concurrency, persisting results after each one.
    pub async fn run_batch(&self, jobs: Vec<EvaluationJob>) -> BatchSummary {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();
        let jobs = dedupe_jobs(jobs);
        let total = jobs.len();
        let concurrency = self.config.concurrency.max(1);

        info!(
            run_id = %run_id,
            "Evaluating {} instances with concurrency={}",
            total,
            concurrency
        );

        let mut finished: Vec<(usize, bool, EvaluationVerdict)> = Vec::with_capacity(total);
        let mut stream = futures::stream::iter(jobs.into_iter().enumerate())
            .map(|(idx, job)| async move {
                info!(
                    instance_id = %job.instance().instance_id,
                    "[{}/{}] Evaluating",
                    idx + 1,
                    total
                );
                let verdict = self.execute(&job).await;
                (idx, job.produces_prediction(), verdict)
            })
            .buffer_unordered(concurrency);

        while let Some((idx, predicts, verdict)) = stream.next().await {
            info!(
                instance_id = %verdict.instance_id,
                status = %verdict.status,
                "Finished: {}",
                verdict.status.label()
            );
            finished.push((idx, predicts, verdict));
            finished.sort_by_key(|(idx, _, _)| *idx);
            self.persist(&finished).await;
        }

        let verdicts = finished.into_iter().map(|(_, _, v)| v).collect();
        let summary = BatchSummary::from_verdicts(
            run_id,
            started_at,
            start.elapsed().as_secs_f64(),
            verdicts,
        );
        info!(
            "Batch complete: {}/{} resolved, {} patches generated, {} applied",
            summary.resolved,
            summary.total,
            summary.patches_generated,
            summary.patches_applied
        );
        summary
    }

    async fn persist(&self, finished: &[(usize, bool, EvaluationVerdict)]) {
        let verdicts: Vec<EvaluationVerdict> = finished.iter().map(|(_, _, v)| v.clone()).collect();
        let predictions: Vec<Prediction> = finished
            .iter()
            .filter(|(_, predicts, _)| *predicts)
            .map(|(_, _, v)| v.to_prediction(&self.config.model_name))
            .collect();
        let results_path = self.config.results_path();
        let predictions_path = self.config.predictions_path();

        let written = tokio::task::spawn_blocking(move || {
            if let Err(e) = write_json_atomic(&results_path, &verdicts) {
                warn!(error = %e, "Failed to save results");
            }
            if !predictions.is_empty() {
                if let Err(e) = write_json_atomic(&predictions_path, &predictions) {
                    warn!(error = %e, "Failed to save predictions");
                }
            }
        })
        .await;
        if let Err(e) = written {
            warn!(error = %e, "Persistence task failed");
        }
    }
}

/// Drops jobs whose instance id was already seen; workspaces are keyed by id.
fn dedupe_jobs(jobs: Vec<EvaluationJob>) -> Vec<EvaluationJob> {
    let mut seen = std::collections::HashSet::new();
    jobs.into_iter()
        .filter(|job| {
            let id = &job.instance().instance_id;
            let fresh = seen.insert(id.clone());
            if !fresh {
                warn!(instance_id = %id, "Skipping duplicate instance");
            }
            fresh
        })
        .collect()
}

/// Writes pretty JSON through a temp file in the same directory, then renames.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
