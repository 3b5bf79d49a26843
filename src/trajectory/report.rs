//! Aggregation of analysis reports across many trajectories.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::analyzer::{AnalysisReport, AnomalyFinding, TrajectoryAnalyzer};

/// A finding tagged with the trajectory it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocatedFinding {
    pub file: Option<PathBuf>,
    #[serde(flatten)]
    pub finding: AnomalyFinding,
}

/// Running totals over analyzed trajectories.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisAccumulator {
    /// Every trajectory seen, parse failures included.
    pub trajectories: usize,
    pub parse_failures: usize,
    pub total_steps: usize,
    pub total_errors: usize,
    pub error_categories: BTreeMap<String, usize>,
    pub findings_by_label: BTreeMap<String, usize>,
    pub findings_by_severity: BTreeMap<String, usize>,
    pub tool_counts: BTreeMap<String, usize>,
    pub findings: Vec<LocatedFinding>,
    pub failed_files: Vec<PathBuf>,
}

impl AnalysisAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, report: &AnalysisReport) {
        self.trajectories += 1;
        if report.is_parse_failure() {
            self.parse_failures += 1;
            if let Some(path) = &report.path {
                self.failed_files.push(path.clone());
            }
            return;
        }

        self.total_steps += report.total_steps;
        self.total_errors += report.errors.len();
        for error in &report.errors {
            bump(&mut self.error_categories, error.category.name(), 1);
        }
        for finding in &report.findings {
            bump(&mut self.findings_by_label, &finding.label, 1);
            bump(&mut self.findings_by_severity, &finding.severity.to_string(), 1);
            self.findings.push(LocatedFinding {
                file: report.path.clone(),
                finding: finding.clone(),
            });
        }
        for (tool, count) in &report.tool_counts {
            bump(&mut self.tool_counts, tool, *count);
        }
    }

    pub fn merge(&mut self, other: AnalysisAccumulator) {
        self.trajectories += other.trajectories;
        self.parse_failures += other.parse_failures;
        self.total_steps += other.total_steps;
        self.total_errors += other.total_errors;
        for (target, source) in [
            (&mut self.error_categories, other.error_categories),
            (&mut self.findings_by_label, other.findings_by_label),
            (&mut self.findings_by_severity, other.findings_by_severity),
            (&mut self.tool_counts, other.tool_counts),
        ] {
            for (key, count) in source {
                *target.entry(key).or_insert(0) += count;
            }
        }
        self.findings.extend(other.findings);
        self.failed_files.extend(other.failed_files);
    }

    pub fn total_findings(&self) -> usize {
        self.findings.len()
    }

    pub fn ranked_tools(&self) -> Vec<(String, usize)> {
        ranked(&self.tool_counts)
    }

    pub fn ranked_labels(&self) -> Vec<(String, usize)> {
        ranked(&self.findings_by_label)
    }

    pub fn ranked_error_categories(&self) -> Vec<(String, usize)> {
        ranked(&self.error_categories)
    }
}

fn bump(map: &mut BTreeMap<String, usize>, key: &str, by: usize) {
    *map.entry(key.to_string()).or_insert(0) += by;
}

/// Count descending, then name ascending.
pub fn ranked(map: &BTreeMap<String, usize>) -> Vec<(String, usize)> {
    let mut entries: Vec<(String, usize)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

/// Expands the given paths into a sorted, deduplicated list of trajectory
/// files. Files are taken as given; directories are walked for `*.json`.
pub fn collect_trajectory_files(paths: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
        } else if path.is_dir() {
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable directory entry");
                        continue;
                    }
                };
                if entry.file_type().is_file() && is_json(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        } else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file or directory: {}", path.display()),
            ));
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Analyzes every trajectory under `paths`. Malformed files are counted as
/// parse failures and never abort the batch.
pub fn analyze_paths(
    analyzer: &TrajectoryAnalyzer,
    paths: &[PathBuf],
) -> io::Result<(Vec<AnalysisReport>, AnalysisAccumulator)> {
    let files = collect_trajectory_files(paths)?;
    debug!(count = files.len(), "Analyzing trajectories");

    let mut accumulator = AnalysisAccumulator::new();
    let mut reports = Vec::with_capacity(files.len());
    for file in &files {
        let report = analyzer.analyze(file);
        accumulator.add(&report);
        reports.push(report);
    }
    Ok((reports, accumulator))
}
