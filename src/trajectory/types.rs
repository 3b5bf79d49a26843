//! Trajectory file data types.
//!
//! Trajectories are written by the agent under test, so parsing is lenient:
//! unknown fields are ignored, missing lists and `null` lists read as empty.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::TrajectoryParseError;

/// A recorded agent run: the task and its ordered steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub task: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub agent_steps: Vec<AgentStep>,
}

impl TrajectoryRecord {
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Reads and parses a trajectory file.
    pub fn from_path(path: &Path) -> Result<Self, TrajectoryParseError> {
        let content = std::fs::read_to_string(path).map_err(|source| TrajectoryParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|source| TrajectoryParseError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// One iteration of the agent loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    #[serde(default, deserialize_with = "null_as_default")]
    pub step_number: u32,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_calls: Vec<ToolCall>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_results: Vec<ToolResult>,
}

/// A tool invocation: name plus argument mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,

    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// String argument by key. Arguments encoded as a JSON string are decoded first.
    pub fn argument(&self, key: &str) -> Option<String> {
        match &self.arguments {
            Value::Object(map) => map.get(key).and_then(Value::as_str).map(str::to_string),
            Value::String(raw) => serde_json::from_str::<Value>(raw)
                .ok()?
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }
}

/// Output of a tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub tool_name: Option<String>,

    #[serde(default)]
    pub success: Option<bool>,

    /// Free-form; only non-empty strings other than `"null"` count as errors.
    #[serde(default)]
    pub error: Option<Value>,
}

impl ToolResult {
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(Value::String(error.into())),
            ..Default::default()
        }
    }

    /// The error message, if this result carries a real one.
    pub fn error_message(&self) -> Option<&str> {
        match &self.error {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed == "null" {
                    None
                } else {
                    Some(s.as_str())
                }
            }
            _ => None,
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
