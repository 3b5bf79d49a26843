//! CLI command definitions for swe-eval.
//!
//! Four subcommands share one configuration path: defaults, then the optional
//! YAML file, then `SWE_EVAL_*` variables, then the flags given here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EvalConfig;
use crate::runner::{ProcessRunner, SystemProcessRunner};
use crate::swe::{
    load_instances, load_predictions, BatchSummary, EvaluationJob, EvaluationPipeline,
    InstanceFilter, SweInstance,
};
use crate::trajectory::{analyze_paths, AnalysisAccumulator, Severity, TrajectoryAnalyzer};

/// Default number of entries shown per ranked table.
const DEFAULT_TOP: usize = 10;

/// SWE-bench style evaluation harness for coding agents.
#[derive(Parser)]
#[command(name = "swe-eval")]
#[command(about = "Evaluate a coding agent on pinned repository snapshots")]
#[command(version)]
#[command(
    long_about = "swe-eval runs a coding agent against benchmark instances, applies the patch it \
produces together with the held-out test patch, runs the project's tests and records a verdict.\n\n\
Example usage:\n  swe-eval run --dataset instances.jsonl --limit 5\n  swe-eval analyze ./swebench_runs/trajectories"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the agent, apply its patch and run the tests.
    Run(RunArgs),

    /// Run the agent only and write predictions.
    #[command(alias = "infer")]
    Predict(RunArgs),

    /// Score an existing predictions file; the agent is not invoked.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),

    /// Flag anomalous agent behavior in recorded trajectories.
    Analyze(AnalyzeArgs),
}

/// Instance selection and output flags shared by the evaluation commands.
#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// Instances file (JSON array or JSONL).
    #[arg(short = 'd', long)]
    pub dataset: PathBuf,

    /// YAML configuration file.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Root directory for workspaces, trajectories and result files.
    #[arg(short = 'w', long)]
    pub work_dir: Option<PathBuf>,

    /// Only evaluate these instance ids.
    #[arg(short = 'i', long, num_args = 1..)]
    pub instances: Vec<String>,

    /// Only evaluate repositories containing this substring.
    #[arg(long)]
    pub repo: Option<String>,

    /// Evaluate at most this many instances.
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Number of instances evaluated concurrently.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Test command deadline in seconds.
    #[arg(long)]
    pub test_timeout: Option<u64>,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl CommonArgs {
    fn filter(&self) -> InstanceFilter {
        InstanceFilter {
            instance_ids: self.instances.clone(),
            repo: self.repo.clone(),
            limit: self.limit,
        }
    }
}

/// Arguments for `swe-eval run` and `swe-eval predict`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Agent binary (default: discovered from target/release, ~/.cargo/bin, PATH).
    #[arg(long, env = "SWE_EVAL_AGENT_BINARY")]
    pub agent_binary: Option<PathBuf>,

    /// Agent step budget; 0 for unbounded.
    #[arg(long)]
    pub max_steps: Option<u32>,

    /// Agent deadline in seconds.
    #[arg(long)]
    pub agent_timeout: Option<u64>,

    /// Extra agent attempts when no diff is produced.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Label written as `model_name_or_path` in predictions.
    #[arg(long)]
    pub model_name: Option<String>,
}

/// Arguments for `swe-eval evaluate`.
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Predictions file (JSON array or JSONL).
    #[arg(short = 'p', long)]
    pub predictions: PathBuf,
}

/// Arguments for `swe-eval analyze`.
#[derive(Parser, Debug)]
pub struct AnalyzeArgs {
    /// Trajectory files or directories (walked for *.json).
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<PathBuf>,

    /// Rows shown per ranked table.
    #[arg(long, default_value_t = DEFAULT_TOP)]
    pub top: usize,

    /// List every finding, not only medium and high severity.
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_agent_command(args, false).await,
        Commands::Predict(args) => run_agent_command(args, true).await,
        Commands::Evaluate(args) => run_evaluate_command(args).await,
        Commands::Analyze(args) => run_analyze_command(args).await,
    }
}

// ============================================================================
// Configuration
// ============================================================================

fn build_config(common: &CommonArgs, run: Option<&RunArgs>) -> anyhow::Result<EvalConfig> {
    let mut config = EvalConfig::load(common.config.as_deref())
        .context("Failed to load configuration")?;

    if let Some(dir) = &common.work_dir {
        config = config.with_work_dir(dir);
    }
    if let Some(concurrency) = common.concurrency {
        config = config.with_concurrency(concurrency);
    }
    if let Some(secs) = common.test_timeout {
        config = config.with_test_timeout(Duration::from_secs(secs));
    }

    if let Some(args) = run {
        if let Some(binary) = &args.agent_binary {
            config = config.with_agent_binary(binary);
        }
        if let Some(steps) = args.max_steps {
            config = config.with_max_steps(Some(steps));
        }
        if let Some(secs) = args.agent_timeout {
            config = config.with_agent_timeout(Duration::from_secs(secs));
        }
        if let Some(retries) = args.max_retries {
            config = config.with_max_retries(retries);
        }
        if let Some(name) = &args.model_name {
            config = config.with_model_name(name);
        }
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn select_instances(common: &CommonArgs) -> anyhow::Result<Vec<SweInstance>> {
    let instances = load_instances(&common.dataset)
        .with_context(|| format!("Failed to load instances from {}", common.dataset.display()))?;
    Ok(common.filter().apply(instances))
}

fn system_runner() -> Arc<dyn ProcessRunner> {
    Arc::new(SystemProcessRunner::new())
}

// ============================================================================
// run / predict / evaluate
// ============================================================================

async fn run_agent_command(args: RunArgs, predict_only: bool) -> anyhow::Result<()> {
    let config = build_config(&args.common, Some(&args))?;
    let instances = select_instances(&args.common)?;
    if instances.is_empty() {
        return report_empty(args.common.json);
    }

    info!(
        "{} {} instances (work dir {})",
        if predict_only { "Predicting" } else { "Evaluating" },
        instances.len(),
        config.work_dir.display()
    );

    let jobs = instances
        .into_iter()
        .map(|instance| {
            if predict_only {
                EvaluationJob::Predict(instance)
            } else {
                EvaluationJob::Run(instance)
            }
        })
        .collect();

    let pipeline = EvaluationPipeline::new(config, system_runner());
    let summary = pipeline.run_batch(jobs).await;
    print_batch_summary(&summary, pipeline.config(), args.common.json)
}

async fn run_evaluate_command(args: EvaluateArgs) -> anyhow::Result<()> {
    let config = build_config(&args.common, None)?;
    let instances = select_instances(&args.common)?;

    let predictions = load_predictions(&args.predictions).with_context(|| {
        format!("Failed to load predictions from {}", args.predictions.display())
    })?;
    let patches: HashMap<String, String> = predictions
        .into_iter()
        .map(|p| (p.instance_id, p.model_patch))
        .collect();

    let mut jobs = Vec::new();
    let mut missing = 0usize;
    for instance in instances {
        match patches.get(&instance.instance_id) {
            Some(patch) => jobs.push(EvaluationJob::Score {
                instance,
                patch: patch.clone(),
            }),
            None => missing += 1,
        }
    }
    if missing > 0 {
        warn!("{} selected instances have no prediction and are skipped", missing);
    }
    if jobs.is_empty() {
        return report_empty(args.common.json);
    }

    let pipeline = EvaluationPipeline::new(config, system_runner());
    let summary = pipeline.run_batch(jobs).await;
    print_batch_summary(&summary, pipeline.config(), args.common.json)
}

fn report_empty(json: bool) -> anyhow::Result<()> {
    if json {
        println!("{{\"status\":\"empty\",\"total\":0}}");
    } else {
        println!("No instances selected.");
    }
    Ok(())
}

fn print_batch_summary(
    summary: &BatchSummary,
    config: &EvalConfig,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!();
    for v in &summary.verdicts {
        let mark = if v.resolved { "PASS" } else { "FAIL" };
        println!(
            "  {} {} [{}] {:.1}s",
            mark,
            v.instance_id,
            v.status.label(),
            v.duration_secs
        );
        if let Some(err) = &v.error {
            println!("       error: {}", err);
        }
    }

    println!("\n=== Evaluation Summary ===");
    println!("Run id:             {}", summary.run_id);
    println!("Total instances:    {}", summary.total);
    println!("Patches generated:  {}", summary.patches_generated);
    println!("Patches applied:    {}", summary.patches_applied);
    println!("Tests passed:       {}", summary.resolved);
    println!("Pass rate:          {:.1}%", summary.pass_rate);
    println!("Elapsed:            {:.1}s", summary.elapsed_secs);
    if !summary.error_counts.is_empty() {
        println!("Errors:");
        for (kind, count) in &summary.error_counts {
            println!("  {}: {}", kind, count);
        }
    }
    println!("Results:            {}", config.results_path().display());
    if summary.verdicts.iter().any(|v| v.has_patch()) {
        println!("Predictions:        {}", config.predictions_path().display());
    }
    Ok(())
}

// ============================================================================
// analyze
// ============================================================================

#[derive(Debug, Serialize)]
struct AnalyzeOutput {
    status: String,
    #[serde(flatten)]
    totals: AnalysisAccumulator,
    top_tools: Vec<(String, usize)>,
    top_findings: Vec<(String, usize)>,
    top_error_categories: Vec<(String, usize)>,
}

async fn run_analyze_command(args: AnalyzeArgs) -> anyhow::Result<()> {
    let paths = args.paths.clone();
    let (_, totals) = tokio::task::spawn_blocking(move || {
        analyze_paths(&TrajectoryAnalyzer::new(), &paths)
    })
    .await
    .context("Trajectory analysis task failed")?
    .context("Failed to collect trajectory files")?;

    if totals.trajectories == 0 {
        warn!("No trajectory files found");
    }

    let top = |ranked: Vec<(String, usize)>| ranked.into_iter().take(args.top).collect::<Vec<_>>();
    if args.json {
        let output = AnalyzeOutput {
            status: "completed".to_string(),
            top_tools: top(totals.ranked_tools()),
            top_findings: top(totals.ranked_labels()),
            top_error_categories: top(totals.ranked_error_categories()),
            totals,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\n=== Trajectory Analysis ===");
    println!("Trajectories:    {}", totals.trajectories);
    println!("Parse failures:  {}", totals.parse_failures);
    println!("Total steps:     {}", totals.total_steps);
    println!("Tool errors:     {}", totals.total_errors);
    println!("Findings:        {}", totals.total_findings());

    print_ranked("Tool usage", &top(totals.ranked_tools()));
    print_ranked("Findings by type", &top(totals.ranked_labels()));
    print_ranked("Errors by category", &top(totals.ranked_error_categories()));

    let listed: Vec<_> = totals
        .findings
        .iter()
        .filter(|f| args.all || f.finding.severity >= Severity::Medium)
        .collect();
    if !listed.is_empty() {
        println!("\nFindings:");
        for located in listed {
            let f = &located.finding;
            println!(
                "  [{}] {} step {} {}: {}",
                f.severity,
                located.file.as_deref().map(display_path).unwrap_or_default(),
                f.step,
                f.label,
                f.detail
            );
            println!("      suggestion: {}", f.suggestion);
        }
    }

    for file in &totals.failed_files {
        println!("  unreadable: {}", file.display());
    }
    Ok(())
}

fn print_ranked(title: &str, rows: &[(String, usize)]) {
    if rows.is_empty() {
        return;
    }
    println!("\n{}:", title);
    for (name, count) in rows {
        println!("  {:<24} {}", name, count);
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
