//! End-to-end pipeline runs against a scripted process runner.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use swe_eval::runner::process::testing::*;
use swe_eval::runner::{CommandSpec, ProcessOutput};
use swe_eval::swe::{EvaluationJob, Prediction};
use swe_eval::trajectory::{analyze_paths, TrajectoryAnalyzer};
use swe_eval::{
    EvalConfig, EvaluationPipeline, EvaluationVerdict, ProcessError, SweInstance, VerdictStatus,
};
use tempfile::TempDir;

const DIFF: &str = "diff --git a/src/app.py b/src/app.py\n--- a/src/app.py\n+++ b/src/app.py\n@@ -1 +1 @@\n-a\n+b\n";

fn config(root: &Path, retries: u32) -> EvalConfig {
    EvalConfig::default()
        .with_work_dir(root)
        .with_agent_binary("/opt/sage")
        .with_max_retries(retries)
        .with_test_timeout(Duration::from_secs(30))
}

/// Agent double that records a trajectory with a scratch-directory write.
fn agent_writing_trajectory() -> Responder {
    Arc::new(|spec: &CommandSpec| -> Result<ProcessOutput, ProcessError> {
        let idx = spec
            .args
            .iter()
            .position(|a| a == "--trajectory-file")
            .expect("trajectory flag");
        let trajectory = json!({
            "task": "fix",
            "agent_steps": [{
                "step_number": 1,
                "tool_calls": [
                    {"name": "write_file", "arguments": {"path": "/tmp/scratch.py", "content": "x"}},
                    {"name": "bash", "arguments": {"command": "head -n 20 src/app.py"}}
                ],
                "tool_results": [{"tool_name": "bash", "error": "permission denied"}]
            }]
        });
        std::fs::write(&spec.args[idx + 1], trajectory.to_string()).expect("write trajectory");
        Ok(ProcessOutput {
            exit_code: Some(0),
            stdout: "done".to_string(),
            ..Default::default()
        })
    })
}

#[tokio::test]
async fn retry_then_resolve_and_analyze_trajectories() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    runner.on("/opt/sage", agent_writing_trajectory());
    runner.once("git diff", reply_ok("  \n"));
    runner.on("git diff", reply_ok(DIFF));
    runner.on("python", reply_ok("3 passed"));

    let cfg = config(tmp.path(), 1);
    let trajectory_dir = cfg.trajectory_dir();
    let pipeline = EvaluationPipeline::new(cfg, runner.clone());
    let instance = SweInstance::new("pallets__flask-7", "pallets/flask", "0a1b2c", "Crash on import.");

    let verdict = pipeline.evaluate(&instance).await;
    assert_eq!(verdict.status, VerdictStatus::Resolved);
    assert!(verdict.resolved);
    assert_eq!(verdict.attempts.len(), 2);
    assert!(verdict.attempts[1].is_retry);
    assert_eq!(runner.count("/opt/sage"), 2);

    let first = verdict.attempts[0].trajectory_file.clone().unwrap();
    assert!(first.starts_with(&trajectory_dir));
    assert!(first.ends_with("attempt-0.json"));

    let (reports, totals) =
        analyze_paths(&TrajectoryAnalyzer::new(), &[trajectory_dir]).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(totals.parse_failures, 0);
    assert_eq!(totals.findings_by_label.get("temp_dir_write"), Some(&2));
    assert_eq!(totals.findings_by_label.get("shell_file_read"), Some(&2));
    assert_eq!(totals.error_categories.get("permission_denied"), Some(&2));
    assert_eq!(totals.ranked_tools()[0].1, 2);
}

#[tokio::test]
async fn scoring_existing_predictions() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    runner.on("python", reply_exit(1, "FAILED tests/test_app.py::test_crash"));

    let pipeline = EvaluationPipeline::new(config(tmp.path(), 0), runner.clone());
    let jobs = vec![
        EvaluationJob::Score {
            instance: SweInstance::new("a-1", "acme/widgets", "abc", "p"),
            patch: DIFF.to_string(),
        },
        EvaluationJob::Score {
            instance: SweInstance::new("a-2", "acme/widgets", "abc", "p"),
            patch: String::new(),
        },
    ];
    let summary = pipeline.run_batch(jobs).await;

    assert_eq!(summary.total, 2);
    assert_eq!(summary.patches_generated, 1);
    assert_eq!(summary.patches_applied, 1);
    assert_eq!(summary.resolved, 0);
    assert_eq!(summary.verdicts[0].status, VerdictStatus::Unresolved);
    assert_eq!(summary.verdicts[1].status, VerdictStatus::NoPatch);
    assert_eq!(summary.error_counts.get("test_execution_error"), Some(&1));
    assert_eq!(runner.count("/opt/sage"), 0);
    assert_eq!(runner.count("python"), 1);

    let results: Vec<EvaluationVerdict> =
        serde_json::from_str(&std::fs::read_to_string(tmp.path().join("results.json")).unwrap())
            .unwrap();
    assert_eq!(results.len(), 2);
    assert!(!tmp.path().join("predictions.json").exists());
}

#[tokio::test]
async fn predict_writes_predictions_only() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    runner.on("git diff", reply_ok(DIFF));

    let pipeline = EvaluationPipeline::new(
        config(tmp.path(), 0).with_model_name("sage-nightly"),
        runner.clone(),
    );
    let instance = SweInstance::new("acme__widgets-3", "acme/widgets", "abc", "p");
    let summary = pipeline.run_batch(vec![EvaluationJob::Predict(instance)]).await;

    assert_eq!(summary.verdicts[0].status, VerdictStatus::Predicted);
    assert_eq!(runner.count("git apply"), 0);
    assert_eq!(runner.count("python"), 0);

    let predictions: Vec<Prediction> = serde_json::from_str(
        &std::fs::read_to_string(tmp.path().join("predictions.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(predictions.len(), 1);
    assert_eq!(predictions[0].instance_id, "acme__widgets-3");
    assert_eq!(predictions[0].model_patch, DIFF);
    assert_eq!(predictions[0].model_name_or_path, "sage-nightly");
}

/// Agent double that resolves `--trajectory-file` against its own working
/// directory, the way a real child process would.
fn agent_writing_relative_to_cwd() -> Responder {
    Arc::new(|spec: &CommandSpec| -> Result<ProcessOutput, ProcessError> {
        let idx = spec
            .args
            .iter()
            .position(|a| a == "--trajectory-file")
            .expect("trajectory flag");
        let cwd = spec.cwd.clone().expect("agent cwd");
        let target = cwd.join(&spec.args[idx + 1]);
        std::fs::create_dir_all(target.parent().expect("parent"))?;
        std::fs::write(&target, json!({"task": "t", "agent_steps": []}).to_string())?;
        Ok(ProcessOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    })
}

/// Test double that passes only when `PYTHONPATH` names its working directory.
fn python_checking_search_path() -> Responder {
    Arc::new(|spec: &CommandSpec| -> Result<ProcessOutput, ProcessError> {
        let cwd = spec.cwd.clone().expect("test cwd");
        let search_path = spec
            .env
            .iter()
            .find(|(k, _)| k == "PYTHONPATH")
            .map(|(_, v)| Path::new(v).to_path_buf());
        let resolves = search_path.is_some_and(|p| p.is_absolute() && p == cwd && p.is_dir());
        Ok(ProcessOutput {
            exit_code: Some(if resolves { 0 } else { 1 }),
            ..Default::default()
        })
    })
}

#[tokio::test]
async fn relative_work_dir_hands_absolute_paths_to_children() {
    let tmp = TempDir::new_in(".").unwrap();
    let relative = Path::new(tmp.path().file_name().unwrap()).to_path_buf();
    assert!(relative.is_relative());

    let runner = Arc::new(ScriptedRunner::new());
    runner.on("/opt/sage", agent_writing_relative_to_cwd());
    runner.on("git diff", reply_ok(DIFF));
    runner.on("python", python_checking_search_path());

    let cfg = config(&relative, 0);
    let trajectory_dir = std::env::current_dir().unwrap().join(&relative).join("trajectories");
    let pipeline = EvaluationPipeline::new(cfg, runner.clone());
    let instance = SweInstance::new("acme__widgets-9", "acme/widgets", "abc", "p");

    let verdict = pipeline.evaluate(&instance).await;
    assert_eq!(verdict.status, VerdictStatus::Resolved);

    let trajectory = verdict.attempts[0].trajectory_file.clone().unwrap();
    assert!(trajectory.is_absolute());
    assert!(trajectory.starts_with(&trajectory_dir));
    assert!(trajectory.is_file());

    let clone = runner
        .calls()
        .into_iter()
        .find(|c| c.command_line().starts_with("git clone"))
        .unwrap();
    let workspace = Path::new(clone.args.last().unwrap()).to_path_buf();
    assert!(workspace.is_absolute());
    assert!(!workspace.join(&relative).exists());
}
