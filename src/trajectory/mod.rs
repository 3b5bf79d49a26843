//! Post-hoc analysis of recorded agent trajectories.
//!
//! A trajectory is the JSON file the agent writes while it works: the task
//! plus an ordered list of steps, each with the tool calls it made and the
//! results it got back. The analyzer reads these files after the fact and
//! flags behavior worth a second look.
//!
//! # Overview
//!
//! For every step the analyzer:
//! - records tool results that carry an error, classified into a small set
//!   of categories (`file_not_found`, `edit_mismatch`, `timeout`, ...)
//! - flags write-type calls that target scratch directories such as `/tmp/`
//! - flags shell commands that print source files or write files through
//!   `echo`/`printf`/heredoc redirection
//!
//! Malformed files never raise; they produce a report with only a parse
//! error so a batch over a directory keeps going.
//!
//! # Usage
//!
//! ```rust,ignore
//! use swe_eval::trajectory::{analyze_paths, TrajectoryAnalyzer};
//!
//! let analyzer = TrajectoryAnalyzer::new();
//! let (reports, totals) = analyze_paths(&analyzer, &["./swebench_runs/trajectories".into()])?;
//! for (tool, count) in totals.ranked_tools() {
//!     println!("{tool}: {count}");
//! }
//! ```

pub mod analyzer;
pub mod report;
pub mod types;

pub use analyzer::{
    AnalysisReport, AnomalyFinding, ErrorCategory, ErrorEntry, Severity, TrajectoryAnalyzer,
};
pub use report::{
    analyze_paths, collect_trajectory_files, ranked, AnalysisAccumulator, LocatedFinding,
};
pub use types::{AgentStep, ToolCall, ToolResult, TrajectoryRecord};
