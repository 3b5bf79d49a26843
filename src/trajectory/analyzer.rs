//! Anomaly detection over recorded trajectories.
//!
//! Each step's tool results are scanned for errors and each tool call is
//! checked against a few known anti-patterns: writing into scratch
//! directories, printing source files through the shell, and writing files
//! through shell redirection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{AgentStep, ToolCall, TrajectoryRecord};
use crate::swe::truncate;

/// Maximum stored length of an error message.
pub const MAX_ERROR_LEN: usize = 200;

const WRITE_TOOLS: [&str; 4] = ["write", "write_file", "create_file", "writefile"];
const SHELL_TOOLS: [&str; 4] = ["bash", "shell", "execute_command", "run_command"];
const TEMP_PREFIXES: [&str; 4] = ["/tmp/", "/var/tmp/", "/private/tmp/", "/dev/shm/"];

pub const LABEL_TEMP_WRITE: &str = "temp_dir_write";
pub const LABEL_SHELL_READ: &str = "shell_file_read";
pub const LABEL_SHELL_WRITE: &str = "shell_file_write";

static BENIGN_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbinary file\b.*\bmatches\b").expect("valid regex")
});

/// A print idiom directly followed by a source file operand.
static SHELL_SOURCE_READ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|[\s;&|(])(?:cat|head|tail|less|more|sed\s+-n)\s+[^<>|;&]*?[\w./-]+\.(?:py|pyi|rs|js|jsx|ts|tsx|go|java|kt|scala|c|h|cc|cpp|hpp|rb|php|cs|swift)\b",
    )
    .expect("valid regex")
});

static SHELL_TEXT_WRITER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s;&|(])(?:echo|printf)\b|\bcat\b[^|;]*<<").expect("valid regex")
});

/// Output redirection: optional fd, operator, target.
static REDIRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d?)>>?\s*([^\s;|<>]+)").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A questionable action flagged in one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyFinding {
    pub step: u32,
    pub tool: String,
    pub label: String,
    pub severity: Severity,
    /// The offending path or command, truncated.
    pub detail: String,
    /// Structured capability that should have been used.
    pub suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    FileNotFound,
    EditMismatch,
    Timeout,
    PermissionDenied,
    SyntaxError,
    Other,
}

impl ErrorCategory {
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("permission denied") || msg.contains("operation not permitted") {
            Self::PermissionDenied
        } else if msg.contains("timed out") || msg.contains("timeout") {
            Self::Timeout
        } else if msg.contains("syntaxerror")
            || msg.contains("syntax error")
            || msg.contains("invalid syntax")
        {
            Self::SyntaxError
        } else if msg.contains("old_string")
            || msg.contains("not unique")
            || msg.contains("string to replace")
            || msg.contains("did not match")
            || msg.contains("no match")
        {
            Self::EditMismatch
        } else if msg.contains("no such file")
            || msg.contains("not found")
            || msg.contains("does not exist")
        {
            Self::FileNotFound
        } else {
            Self::Other
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FileNotFound => "file_not_found",
            Self::EditMismatch => "edit_mismatch",
            Self::Timeout => "timeout",
            Self::PermissionDenied => "permission_denied",
            Self::SyntaxError => "syntax_error",
            Self::Other => "other",
        }
    }
}

/// A tool result that carried an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub step: u32,
    pub tool: Option<String>,
    pub category: ErrorCategory,
    /// Message truncated to [`MAX_ERROR_LEN`].
    pub message: String,
}

/// Everything found in one trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub path: Option<PathBuf>,
    pub task: String,
    pub total_steps: usize,
    pub errors: Vec<ErrorEntry>,
    pub findings: Vec<AnomalyFinding>,
    pub tool_counts: BTreeMap<String, usize>,
    /// Set when the trajectory could not be read; all other fields are empty.
    pub parse_error: Option<String>,
}

impl AnalysisReport {
    pub fn parse_failure(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path,
            parse_error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_parse_failure(&self) -> bool {
        self.parse_error.is_some()
    }

    pub fn findings_at(&self, severity: Severity) -> impl Iterator<Item = &AnomalyFinding> {
        self.findings.iter().filter(move |f| f.severity == severity)
    }
}

/// Stateless trajectory scanner.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrajectoryAnalyzer;

impl TrajectoryAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyzes a trajectory file. Unreadable or malformed files yield a
    /// report carrying only the parse error.
    pub fn analyze(&self, path: &Path) -> AnalysisReport {
        match TrajectoryRecord::from_path(path) {
            Ok(record) => {
                let mut report = self.analyze_record(&record);
                report.path = Some(path.to_path_buf());
                report
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable trajectory");
                AnalysisReport::parse_failure(Some(path.to_path_buf()), e.to_string())
            }
        }
    }

    /// Analyzes trajectory JSON held in memory.
    pub fn analyze_json(&self, content: &str) -> AnalysisReport {
        match TrajectoryRecord::from_json(content) {
            Ok(record) => self.analyze_record(&record),
            Err(e) => AnalysisReport::parse_failure(None, e.to_string()),
        }
    }

    pub fn analyze_record(&self, record: &TrajectoryRecord) -> AnalysisReport {
        let mut report = AnalysisReport {
            task: record.task.clone(),
            total_steps: record.agent_steps.len(),
            ..Default::default()
        };
        for step in &record.agent_steps {
            self.scan_results(step, &mut report);
            for call in &step.tool_calls {
                let name = if call.name.is_empty() {
                    "unknown".to_string()
                } else {
                    call.name.clone()
                };
                *report.tool_counts.entry(name).or_insert(0) += 1;
                report.findings.extend(inspect_call(step.step_number, call));
            }
        }
        report
    }

    fn scan_results(&self, step: &AgentStep, report: &mut AnalysisReport) {
        for result in &step.tool_results {
            let Some(message) = result.error_message() else {
                continue;
            };
            if BENIGN_ERROR.is_match(message) {
                continue;
            }
            report.errors.push(ErrorEntry {
                step: step.step_number,
                tool: result.tool_name.clone(),
                category: ErrorCategory::classify(message),
                message: truncate(message, MAX_ERROR_LEN),
            });
        }
    }
}

fn inspect_call(step: u32, call: &ToolCall) -> Vec<AnomalyFinding> {
    let name = call.name.to_lowercase();
    let mut findings = Vec::new();

    if WRITE_TOOLS.contains(&name.as_str()) {
        let target = call.argument("file_path").or_else(|| call.argument("path"));
        if let Some(path) = target {
            if is_temp_path(&path) {
                findings.push(AnomalyFinding {
                    step,
                    tool: call.name.clone(),
                    label: LABEL_TEMP_WRITE.to_string(),
                    severity: Severity::High,
                    detail: truncate(&path, MAX_ERROR_LEN),
                    suggestion: "Edit tracked files in the repository instead of a scratch directory"
                        .to_string(),
                });
            }
        }
    }

    if SHELL_TOOLS.contains(&name.as_str()) {
        if let Some(command) = call.argument("command") {
            if SHELL_SOURCE_READ.is_match(&command) {
                findings.push(AnomalyFinding {
                    step,
                    tool: call.name.clone(),
                    label: LABEL_SHELL_READ.to_string(),
                    severity: Severity::Low,
                    detail: truncate(&command, MAX_ERROR_LEN),
                    suggestion: "Use the Read tool to view source files".to_string(),
                });
            }
            if writes_text_to_file(&command) {
                findings.push(AnomalyFinding {
                    step,
                    tool: call.name.clone(),
                    label: LABEL_SHELL_WRITE.to_string(),
                    severity: Severity::Medium,
                    detail: truncate(&command, MAX_ERROR_LEN),
                    suggestion: "Use the Write or Edit tool to change files".to_string(),
                });
            }
        }
    }

    findings
}

fn is_temp_path(path: &str) -> bool {
    TEMP_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// `echo`, `printf` or a `cat` heredoc whose stdout is redirected into a real file.
fn writes_text_to_file(command: &str) -> bool {
    if !SHELL_TEXT_WRITER.is_match(command) {
        return false;
    }
    REDIRECT.captures_iter(command).any(|caps| {
        let fd = caps.get(1).map_or("", |m| m.as_str());
        let target = caps.get(2).map_or("", |m| m.as_str());
        (fd.is_empty() || fd == "1") && !target.starts_with('&') && target != "/dev/null"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::types::ToolResult;
    use serde_json::json;

    fn trajectory(calls: Vec<ToolCall>, results: Vec<ToolResult>) -> TrajectoryRecord {
        TrajectoryRecord {
            task: "t".to_string(),
            agent_steps: vec![AgentStep {
                step_number: 3,
                tool_calls: calls,
                tool_results: results,
            }],
        }
    }

    fn bash(command: &str) -> ToolCall {
        ToolCall::new("bash", json!({ "command": command }))
    }

    fn labels(report: &AnalysisReport) -> Vec<(&str, Severity)> {
        report
            .findings
            .iter()
            .map(|f| (f.label.as_str(), f.severity))
            .collect()
    }

    #[test]
    fn test_benign_binary_warning_ignored() {
        let record = trajectory(
            vec![],
            vec![
                ToolResult::with_error("Binary file /a.bin matches"),
                ToolResult::with_error("null"),
            ],
        );
        let report = TrajectoryAnalyzer::new().analyze_record(&record);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_errors_truncated_and_classified() {
        let long = format!("No such file or directory: {}", "x".repeat(500));
        let record = trajectory(
            vec![],
            vec![
                ToolResult::with_error(long),
                ToolResult::with_error("old_string not found in file"),
                ToolResult::with_error("Command timed out after 120s"),
            ],
        );
        let report = TrajectoryAnalyzer::new().analyze_record(&record);
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.errors[0].category, ErrorCategory::FileNotFound);
        assert!(report.errors[0].message.len() <= MAX_ERROR_LEN + "... [truncated]".len());
        assert_eq!(report.errors[1].category, ErrorCategory::EditMismatch);
        assert_eq!(report.errors[2].category, ErrorCategory::Timeout);
        assert_eq!(report.errors[0].step, 3);
    }

    #[test]
    fn test_cat_source_file_is_low() {
        let report =
            TrajectoryAnalyzer::new().analyze_record(&trajectory(vec![bash("cat foo.py")], vec![]));
        assert_eq!(labels(&report), vec![(LABEL_SHELL_READ, Severity::Low)]);
        assert!(report.findings[0].suggestion.contains("Read tool"));
        assert_eq!(report.tool_counts.get("bash"), Some(&1));
    }

    #[test]
    fn test_shell_read_variants() {
        let analyzer = TrajectoryAnalyzer::new();
        for cmd in [
            "head -n 40 src/lib.rs",
            "cd repo && sed -n '10,20p' django/db/models/query.py",
            "tail -f app.js",
        ] {
            let report = analyzer.analyze_record(&trajectory(vec![bash(cmd)], vec![]));
            assert_eq!(labels(&report), vec![(LABEL_SHELL_READ, Severity::Low)], "{}", cmd);
        }
        for cmd in ["cat README", "ls src/", "python -m pytest tests/test_a.py", "cat notes.txt"] {
            let report = analyzer.analyze_record(&trajectory(vec![bash(cmd)], vec![]));
            assert!(report.findings.is_empty(), "{}", cmd);
        }
    }

    #[test]
    fn test_shell_redirect_write_is_medium() {
        let analyzer = TrajectoryAnalyzer::new();
        for cmd in [
            "echo 'x = 1' > fix.py",
            "printf 'a\\n' >> notes.txt",
            "cat > patch.py << 'EOF'\nprint(1)\nEOF",
        ] {
            let report = analyzer.analyze_record(&trajectory(vec![bash(cmd)], vec![]));
            assert_eq!(labels(&report), vec![(LABEL_SHELL_WRITE, Severity::Medium)], "{}", cmd);
        }
        for cmd in ["echo hi 2>&1", "echo hi > /dev/null", "echo done", "python run.py > out.log 2>&1"] {
            let report = analyzer.analyze_record(&trajectory(vec![bash(cmd)], vec![]));
            assert!(report.findings.is_empty(), "{}", cmd);
        }
    }

    #[test]
    fn test_temp_dir_write_is_high() {
        let analyzer = TrajectoryAnalyzer::new();
        let report = analyzer.analyze_record(&trajectory(
            vec![
                ToolCall::new("Write", json!({"file_path": "/tmp/fix.py", "content": "x"})),
                ToolCall::new("write_file", json!({"path": "/var/tmp/a.patch"})),
                ToolCall::new("Write", json!({"file_path": "/repo/src/fix.py"})),
                ToolCall::new("Edit", json!({"file_path": "/tmp/other.py"})),
            ],
            vec![],
        ));
        assert_eq!(
            labels(&report),
            vec![(LABEL_TEMP_WRITE, Severity::High), (LABEL_TEMP_WRITE, Severity::High)]
        );
        assert_eq!(report.tool_counts.get("Write"), Some(&2));
        assert_eq!(report.findings_at(Severity::High).count(), 2);
    }

    #[test]
    fn test_malformed_content_reports_parse_error() {
        let report = TrajectoryAnalyzer::new().analyze_json("{\"agent_steps\": 7");
        assert!(report.is_parse_failure());
        assert!(report.findings.is_empty() && report.errors.is_empty());
    }

    #[test]
    fn test_deterministic() {
        let raw = json!({
            "task": "t",
            "agent_steps": [
                {"step_number": 1, "tool_calls": [{"name": "bash", "arguments": {"command": "cat a.py"}}]},
                {"step_number": 2, "tool_calls": [{"name": "Grep", "arguments": {}}, {"name": "bash", "arguments": {"command": "echo x > y.py"}}]}
            ]
        })
        .to_string();
        let analyzer = TrajectoryAnalyzer::new();
        assert_eq!(analyzer.analyze_json(&raw), analyzer.analyze_json(&raw));
    }
}
