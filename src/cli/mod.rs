//! Command-line interface for swe-eval.
//!
//! Provides the `run`, `predict`, `evaluate` and `analyze` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
