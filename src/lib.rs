//! swe-eval: SWE-bench style evaluation of autonomous coding agents.
//!
//! For each benchmark instance the library prepares a pinned repository
//! snapshot, runs the agent under test with a bounded retry budget, recovers
//! the diff it leaves behind, applies it together with the held-out test
//! patch, runs the project's tests and records a verdict. Recorded agent
//! trajectories can be analyzed afterwards for wasteful or risky behavior.

pub mod cli;
pub mod config;
pub mod error;
pub mod runner;
pub mod swe;
pub mod trajectory;

pub use config::{AgentConfig, EvalConfig};
pub use error::{
    ConfigError, ErrorKind, LoadError, PatchApplyError, ProcessError, RetryError, SetupError,
    TrajectoryParseError,
};
pub use swe::{BatchSummary, EvaluationPipeline, EvaluationVerdict, SweInstance, VerdictStatus};
pub use trajectory::{AnalysisReport, TrajectoryAnalyzer};
