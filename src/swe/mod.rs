//! SWE-bench instance evaluation.
//!
//! This module implements the per-instance evaluation flow:
//! - Materialize the pinned repository snapshot in an isolated workspace
//! - Invoke the agent under a bounded budget, retrying when it produces no diff
//! - Validate and apply the agent patch, then the held-out test patch
//! - Run the project's test suite and record a verdict

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

pub mod dataset;
pub mod harness;
pub mod patch;
pub mod retry;
pub mod test_runner;
pub mod workspace;

pub use dataset::{load_instances, load_predictions, InstanceFilter};
pub use harness::{
    write_json_atomic, BatchSummary, EvaluationJob, EvaluationPipeline, EvaluationVerdict,
    VerdictStatus,
};
pub use patch::{ApplyOutcome, PatchApplier, PatchDocument};
pub use retry::{AttemptRecord, RetryController, RetryOutcome};
pub use test_runner::{ProjectFamily, TestExecutor, TestOutcome};
pub use workspace::{Workspace, WorkspaceManager, PROBLEM_STATEMENT_FILE};

/// Default label written into prediction records.
pub const DEFAULT_MODEL_NAME: &str = "sage-agent";

/// Validate a git ref (commit SHA, branch name) before it reaches a git command line.
///
/// Accepts hex-only SHAs (short or full) and standard git ref names
/// (alphanumeric, `/`, `.`, `-`, `_`). Rejects shell metacharacters,
/// `..` sequences, and refs starting with `-` (flag injection).
pub fn validate_git_ref(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("git ref is empty".to_string());
    }
    if s.len() > 256 {
        return Err(format!("git ref too long ({} chars, max 256)", s.len()));
    }
    if s.starts_with('-') {
        return Err(format!(
            "git ref '{}' must not start with '-' (could be interpreted as a flag)",
            s
        ));
    }
    if s.contains("..") {
        return Err(format!("git ref '{}' must not contain '..'", s));
    }
    if let Some(ch) = s
        .chars()
        .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '.' | '-' | '_' | '~' | '^'))
    {
        return Err(format!(
            "invalid character '{}' in git ref '{}': only alphanumeric, /, ., -, _, ~, ^ allowed",
            ch, s
        ));
    }
    Ok(())
}

/// Validate a repository identifier in `owner/repo` form.
///
/// Both parts must be non-empty, contain only alphanumerics, `-`, `_`, `.`,
/// and must not start with `.` or `-`.
pub fn validate_repo_name(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("repository name is empty".to_string());
    }
    if s.len() > 256 {
        return Err(format!("repository name too long ({} chars, max 256)", s.len()));
    }
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != 2 {
        return Err(format!(
            "invalid repository name '{}': expected 'owner/repo' format",
            s
        ));
    }
    for part in &parts {
        if part.is_empty() {
            return Err(format!(
                "invalid repository name '{}': owner and repo must be non-empty",
                s
            ));
        }
        if part.starts_with('.') || part.starts_with('-') {
            return Err(format!(
                "invalid repository name '{}': parts must not start with '.' or '-'",
                s
            ));
        }
        if let Some(ch) = part
            .chars()
            .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
        {
            return Err(format!(
                "invalid character '{}' in repository name '{}': only alphanumeric, -, _, . allowed",
                ch, s
            ));
        }
    }
    Ok(())
}

/// Truncate to at most `max` bytes on a char boundary, marking the cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}

/// Keep the last `max` bytes, marking the cut. Test logs end with the verdict.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut start = s.len() - max;
        while !s.is_char_boundary(start) && start < s.len() {
            start += 1;
        }
        format!("[truncated] ...{}", &s[start..])
    }
}

/// One benchmark task: a repository, a pinned revision, a problem statement.
///
/// Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweInstance {
    /// Stable identifier (e.g. `django__django-11099`).
    pub instance_id: String,
    /// Repository in `owner/repo` form.
    pub repo: String,
    /// Pinned base revision.
    pub base_commit: String,
    /// Bug report shown to the agent.
    #[serde(default)]
    pub problem_statement: String,
    /// Held-out test patch applied before running tests.
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub test_patch: Option<String>,
    /// Reference solution, never shown to the agent.
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub patch: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub hints_text: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl SweInstance {
    pub fn new(
        instance_id: impl Into<String>,
        repo: impl Into<String>,
        base_commit: impl Into<String>,
        problem_statement: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            repo: repo.into(),
            base_commit: base_commit.into(),
            problem_statement: problem_statement.into(),
            test_patch: None,
            patch: None,
            hints_text: None,
            version: None,
        }
    }

    pub fn with_test_patch(mut self, test_patch: impl Into<String>) -> Self {
        let test_patch = test_patch.into();
        self.test_patch = if test_patch.trim().is_empty() {
            None
        } else {
            Some(test_patch)
        };
        self
    }

    /// Clone URL under the given base (e.g. `https://github.com`).
    pub fn repo_url(&self, base_url: &str) -> String {
        format!("{}/{}.git", base_url.trim_end_matches('/'), self.repo)
    }

    /// Directory name for this instance's workspace; unique per instance id.
    pub fn workspace_dir_name(&self) -> String {
        instance_dir_name(&self.instance_id)
    }

    /// Checks repository coordinates before anything is launched.
    pub fn validate(&self) -> Result<(), String> {
        if self.instance_id.trim().is_empty() {
            return Err("instance id is empty".to_string());
        }
        validate_repo_name(&self.repo)?;
        validate_git_ref(&self.base_commit)?;
        Ok(())
    }
}

/// Prediction record consumed by downstream scorers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    #[serde(default)]
    pub model_patch: String,
    #[serde(default = "default_model_name")]
    pub model_name_or_path: String,
}

impl Prediction {
    pub fn new(
        instance_id: impl Into<String>,
        model_patch: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            model_patch: model_patch.into(),
            model_name_or_path: model_name.into(),
        }
    }
}

fn default_model_name() -> String {
    DEFAULT_MODEL_NAME.to_string()
}

/// Filesystem-safe form of an identifier.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

/// Directory name for an instance id. Ids that are not already filesystem
/// safe get a digest of the raw id appended, so distinct ids never share a
/// directory.
pub fn instance_dir_name(id: &str) -> String {
    let safe = sanitize_id(id);
    if safe == id && !safe.trim_matches('.').is_empty() {
        return safe;
    }
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{}-{}", safe, &digest[..12])
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_git_ref_accepts_hex_sha() {
        assert!(validate_git_ref("abc123def456").is_ok());
        assert!(validate_git_ref("a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2").is_ok());
        assert!(validate_git_ref("HEAD~1").is_ok());
    }

    #[test]
    fn validate_git_ref_rejects_injection() {
        assert!(validate_git_ref("").is_err());
        assert!(validate_git_ref("abc123; rm -rf /").is_err());
        assert!(validate_git_ref("$(whoami)").is_err());
        assert!(validate_git_ref("--upload-pack=evil").is_err());
        assert!(validate_git_ref("main..HEAD").is_err());
        assert!(validate_git_ref(&"a".repeat(257)).is_err());
    }

    #[test]
    fn validate_repo_name_accepts_valid() {
        assert!(validate_repo_name("django/django").is_ok());
        assert!(validate_repo_name("psf/requests").is_ok());
        assert!(validate_repo_name("pallets/flask.js").is_ok());
    }

    #[test]
    fn validate_repo_name_rejects_invalid() {
        assert!(validate_repo_name("").is_err());
        assert!(validate_repo_name("noslash").is_err());
        assert!(validate_repo_name("too/many/slashes").is_err());
        assert!(validate_repo_name(".hidden/repo").is_err());
        assert!(validate_repo_name("owner/-repo").is_err());
        assert!(validate_repo_name("owner/repo && echo").is_err());
    }

    #[test]
    fn test_truncate_and_tail() {
        assert_eq!(truncate("hello", 10), "hello");
        assert!(truncate("hello world", 5).ends_with("... [truncated]"));
        assert!(truncate("héllo wörld", 2).starts_with('h'));
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello world", 5), "[truncated] ...world");
    }

    #[test]
    fn test_instance_deserialize_empty_test_patch() {
        let json = r#"{
            "instance_id": "psf__requests-1",
            "repo": "psf/requests",
            "base_commit": "abc123",
            "problem_statement": "broken",
            "test_patch": "   ",
            "FAIL_TO_PASS": "[]"
        }"#;
        let inst: SweInstance = serde_json::from_str(json).unwrap();
        assert_eq!(inst.test_patch, None);
        assert_eq!(inst.problem_statement, "broken");
        assert!(inst.validate().is_ok());
    }

    #[test]
    fn test_instance_dir_names_do_not_collide() {
        assert_eq!(instance_dir_name("django__django-11099"), "django__django-11099");
        assert_ne!(instance_dir_name("acme/x-1"), instance_dir_name("acme_x-1"));
        assert_ne!(instance_dir_name("acme/x-1"), instance_dir_name("acme:x-1"));
        assert_eq!(instance_dir_name("acme/x-1"), instance_dir_name("acme/x-1"));
        for id in ["..", ".", ""] {
            let name = instance_dir_name(id);
            assert!(!name.trim_matches('.').is_empty(), "{:?}", id);
            assert!(!name.contains('/'));
        }
    }

    #[test]
    fn test_instance_paths() {
        let inst = SweInstance::new("org/x 1", "django/django", "abc", "p");
        assert!(inst.workspace_dir_name().starts_with("org_x_1-"));
        assert_eq!(inst.workspace_dir_name().len(), "org_x_1-".len() + 12);
        assert_eq!(
            inst.repo_url("https://github.com/"),
            "https://github.com/django/django.git"
        );
        assert_eq!(inst.with_test_patch("").test_patch, None);
    }

    #[test]
    fn test_prediction_default_model_name() {
        let p: Prediction =
            serde_json::from_str(r#"{"instance_id": "a", "model_patch": "diff"}"#).unwrap();
        assert_eq!(p.model_name_or_path, DEFAULT_MODEL_NAME);
    }
}
