//! Error types for swe-eval operations.
//!
//! Defines error types for every subsystem of the evaluation harness:
//! - Workspace setup (clone, fetch, checkout)
//! - External process execution and timeouts
//! - Patch validation and application
//! - Configuration and input loading
//! - Trajectory parsing

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while materializing a workspace for an instance.
///
/// Always fatal for the instance; setup is never retried.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Invalid repository coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("Clone of {repo} failed: {stderr}")]
    CloneFailed { repo: String, stderr: String },

    #[error("Fetch of revision {revision} failed: {stderr}")]
    FetchFailed { revision: String, stderr: String },

    #[error("Checkout of revision {revision} failed: {stderr}")]
    CheckoutFailed { revision: String, stderr: String },

    #[error("Reset of workspace {path} failed: {stderr}")]
    ResetFailed { path: PathBuf, stderr: String },

    #[error("Process error during setup: {0}")]
    Process(#[from] ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the external process runner.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("'{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Returns true if the process was terminated because its deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout { .. })
    }
}

/// Errors raised while applying a patch to a workspace.
#[derive(Debug, Error)]
pub enum PatchApplyError {
    #[error("Patch was not validated before apply")]
    NotValidated,

    #[error("Patch rejected by dry run: {diagnostic}")]
    DryRunFailed { diagnostic: String },

    #[error("Patch apply failed: {diagnostic}")]
    ApplyFailed { diagnostic: String },

    #[error("Process error during patch apply: {0}")]
    Process(#[from] ProcessError),
}

/// Errors that end the agent retry loop early.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Workspace reset between attempts failed: {0}")]
    Reset(#[from] SetupError),

    #[error("Patch extraction failed: {0}")]
    Extract(#[from] ProcessError),
}

impl RetryError {
    /// Verdict classification for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetryError::Reset(_) => ErrorKind::SetupError,
            RetryError::Extract(e) if e.is_timeout() => ErrorKind::Timeout,
            RetryError::Extract(_) => ErrorKind::InternalError,
        }
    }
}

/// Errors raised while reading a trajectory file.
#[derive(Debug, Error)]
pub enum TrajectoryParseError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed trajectory {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while loading instance or prediction files.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid record on line {line} of {path}: {reason}")]
    InvalidLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while building the evaluation configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Terminal error classification attached to a verdict.
///
/// At most one kind is recorded per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Clone, fetch or checkout failed.
    SetupError,
    /// The agent or the test process exceeded its deadline.
    Timeout,
    /// The agent patch or the test patch did not apply.
    PatchApplyError,
    /// The test command exited non-zero or could not be launched.
    TestExecutionError,
    /// Anything else caught at the pipeline boundary.
    InternalError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SetupError => write!(f, "setup_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::PatchApplyError => write!(f, "patch_apply_error"),
            Self::TestExecutionError => write!(f, "test_execution_error"),
            Self::InternalError => write!(f, "internal_error"),
        }
    }
}
