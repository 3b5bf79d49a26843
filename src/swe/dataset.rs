//! Loading instances and predictions from local JSON / JSONL files.

use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::info;

use super::{Prediction, SweInstance};
use crate::error::LoadError;

/// Selects a subset of loaded instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Keep only these ids (empty keeps all).
    pub instance_ids: Vec<String>,
    /// Keep only repositories containing this substring.
    pub repo: Option<String>,
    /// Keep at most this many, after the other filters.
    pub limit: Option<usize>,
}

impl InstanceFilter {
    pub fn apply(&self, instances: Vec<SweInstance>) -> Vec<SweInstance> {
        let selected = instances
            .into_iter()
            .filter(|i| self.instance_ids.is_empty() || self.instance_ids.contains(&i.instance_id))
            .filter(|i| {
                self.repo
                    .as_deref()
                    .map(|r| i.repo.contains(r))
                    .unwrap_or(true)
            });
        match self.limit {
            Some(limit) => selected.take(limit).collect(),
            None => selected.collect(),
        }
    }
}

/// Load instances from a JSON array or a JSONL file.
pub fn load_instances(path: &Path) -> Result<Vec<SweInstance>, LoadError> {
    let instances: Vec<SweInstance> = load_records(path)?;
    info!("Loaded {} instances from {}", instances.len(), path.display());
    Ok(instances)
}

/// Load prediction records from a JSON array or a JSONL file.
pub fn load_predictions(path: &Path) -> Result<Vec<Prediction>, LoadError> {
    let predictions: Vec<Prediction> = load_records(path)?;
    info!(
        "Loaded {} predictions from {}",
        predictions.len(),
        path.display()
    );
    Ok(predictions)
}

fn load_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, LoadError> {
    if !path.exists() {
        return Err(LoadError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let trimmed = content.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| LoadError::InvalidLine {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}
