//! Evaluation configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `SWE_EVAL_*` environment variables, then CLI flags (applied by the caller).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default directory holding workspaces, trajectories and output files.
pub const DEFAULT_WORK_DIR: &str = "./swebench_runs";

/// Settings for invoking the agent under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Explicit path to the agent binary; discovered from `binary_name` when unset.
    pub binary: Option<PathBuf>,
    /// Name searched for when `binary` is unset.
    pub binary_name: String,
    /// Subcommand selecting the agent's run mode.
    pub mode: Option<String>,
    /// Step budget; `None` or `0` leaves the agent unbounded.
    pub max_steps: Option<u32>,
    /// Wall-clock deadline for one invocation.
    pub timeout_secs: u64,
    /// Environment overrides for the agent process.
    pub env: BTreeMap<String, String>,
    /// Agent config file copied into every workspace.
    pub extra_config_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: None,
            binary_name: "sage".to_string(),
            mode: Some("unified".to_string()),
            max_steps: Some(25),
            timeout_secs: 600,
            env: BTreeMap::new(),
            extra_config_file: None,
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Step budget to pass on the command line, if bounded.
    pub fn step_budget(&self) -> Option<u32> {
        self.max_steps.filter(|n| *n > 0)
    }
}

/// Configuration for a batch evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Root for per-instance workspaces and outputs.
    pub work_dir: PathBuf,
    /// Base URL repositories are cloned from (`<base>/<owner>/<repo>.git`).
    pub clone_base_url: String,
    /// History depth fetched to reach the pinned revision.
    pub fetch_depth: u32,
    pub clone_timeout_secs: u64,
    /// Deadline for local git operations (diff, apply, reset).
    pub git_timeout_secs: u64,
    pub agent: AgentConfig,
    /// Extra agent invocations when an attempt leaves no diff.
    pub max_retries: u32,
    pub test_timeout_secs: u64,
    /// Interpreter used by the test commands.
    pub python: String,
    /// Instances evaluated at once.
    pub concurrency: usize,
    /// Label written into prediction records.
    pub model_name: String,
    /// Predictions output, relative to `work_dir` unless absolute.
    pub predictions_file: PathBuf,
    /// Verdicts output, relative to `work_dir` unless absolute.
    pub results_file: PathBuf,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            clone_base_url: "https://github.com".to_string(),
            fetch_depth: 100,
            clone_timeout_secs: 600,
            git_timeout_secs: 120,
            agent: AgentConfig::default(),
            max_retries: 1,
            test_timeout_secs: 300,
            python: "python".to_string(),
            concurrency: 1,
            model_name: crate::swe::DEFAULT_MODEL_NAME.to_string(),
            predictions_file: PathBuf::from("predictions.json"),
            results_file: PathBuf::from("results.json"),
        }
    }
}

impl EvalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a YAML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Defaults, optional YAML file, then the process environment; validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `SWE_EVAL_*` overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `SWE_EVAL_WORK_DIR`: workspace root (default: ./swebench_runs)
    /// - `SWE_EVAL_CLONE_BASE_URL`: clone base URL (default: https://github.com)
    /// - `SWE_EVAL_AGENT_BINARY`: path to the agent binary
    /// - `SWE_EVAL_MAX_STEPS`: agent step budget, 0 for unbounded (default: 25)
    /// - `SWE_EVAL_AGENT_TIMEOUT_SECS`: agent deadline (default: 600)
    /// - `SWE_EVAL_MAX_RETRIES`: retries on empty diff (default: 1)
    /// - `SWE_EVAL_TEST_TIMEOUT_SECS`: test deadline (default: 300)
    /// - `SWE_EVAL_CONCURRENCY`: instances in flight (default: 1)
    /// - `SWE_EVAL_PYTHON`: test interpreter (default: python)
    /// - `SWE_EVAL_MODEL_NAME`: prediction label (default: sage-agent)
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SWE_EVAL_WORK_DIR") {
            self.work_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("SWE_EVAL_CLONE_BASE_URL") {
            self.clone_base_url = val;
        }
        if let Some(val) = lookup("SWE_EVAL_AGENT_BINARY") {
            self.agent.binary = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("SWE_EVAL_MAX_STEPS") {
            self.agent.max_steps = Some(parse_env_value(&val, "SWE_EVAL_MAX_STEPS")?);
        }
        if let Some(val) = lookup("SWE_EVAL_AGENT_TIMEOUT_SECS") {
            self.agent.timeout_secs = parse_env_value(&val, "SWE_EVAL_AGENT_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("SWE_EVAL_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "SWE_EVAL_MAX_RETRIES")?;
        }
        if let Some(val) = lookup("SWE_EVAL_TEST_TIMEOUT_SECS") {
            self.test_timeout_secs = parse_env_value(&val, "SWE_EVAL_TEST_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("SWE_EVAL_CONCURRENCY") {
            self.concurrency = parse_env_value(&val, "SWE_EVAL_CONCURRENCY")?;
        }
        if let Some(val) = lookup("SWE_EVAL_PYTHON") {
            self.python = val;
        }
        if let Some(val) = lookup("SWE_EVAL_MODEL_NAME") {
            self.model_name = val;
        }
        Ok(())
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "work_dir cannot be empty".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.agent.timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "agent timeout must be greater than 0".to_string(),
            ));
        }
        if self.test_timeout_secs == 0 || self.clone_timeout_secs == 0 || self.git_timeout_secs == 0
        {
            return Err(ConfigError::ValidationFailed(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        if self.fetch_depth == 0 {
            return Err(ConfigError::ValidationFailed(
                "fetch_depth must be greater than 0".to_string(),
            ));
        }
        if self.agent.binary_name.trim().is_empty() && self.agent.binary.is_none() {
            return Err(ConfigError::ValidationFailed(
                "agent binary cannot be empty".to_string(),
            ));
        }
        if self.clone_base_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "clone_base_url cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    /// `work_dir` anchored at the current directory when relative.
    pub fn work_root(&self) -> PathBuf {
        std::path::absolute(&self.work_dir).unwrap_or_else(|_| self.work_dir.clone())
    }

    /// Directory holding one checkout per instance.
    pub fn workspace_root(&self) -> PathBuf {
        self.work_root().join("workspaces")
    }

    /// Directory holding per-attempt trajectory files.
    pub fn trajectory_dir(&self) -> PathBuf {
        self.work_root().join("trajectories")
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.resolve_output(&self.predictions_file)
    }

    pub fn results_path(&self) -> PathBuf {
        self.resolve_output(&self.results_file)
    }

    fn resolve_output(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.work_root().join(file)
        }
    }

    /// Builder method to set the workspace root.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Builder method to set the clone base URL.
    pub fn with_clone_base_url(mut self, url: impl Into<String>) -> Self {
        self.clone_base_url = url.into();
        self
    }

    /// Builder method to set the agent binary path.
    pub fn with_agent_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.agent.binary = Some(binary.into());
        self
    }

    /// Builder method to set the agent step budget.
    pub fn with_max_steps(mut self, max_steps: Option<u32>) -> Self {
        self.agent.max_steps = max_steps;
        self
    }

    /// Builder method to set the agent deadline.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent.timeout_secs = timeout.as_secs();
        self
    }

    /// Builder method to set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method to set the test deadline.
    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout_secs = timeout.as_secs();
        self
    }

    /// Builder method to set batch concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Builder method to set the prediction label.
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }
}

/// Parses an environment variable value into the specified type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}
