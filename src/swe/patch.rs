//! Patch extraction, dry-run validation and application.
//!
//! Patches go through `git apply` on standard input in two phases. A
//! [`PatchDocument`] records whether its dry run passed, and [`PatchApplier::apply`]
//! refuses any document that has not been validated.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use super::workspace::Workspace;
use super::tail;
use crate::error::{PatchApplyError, ProcessError};
use crate::runner::{CommandSpec, ProcessRunner};

const DIAGNOSTIC_LIMIT: usize = 2000;

/// Unified-diff text plus the result of its dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchDocument {
    text: String,
    validated: bool,
    diagnostic: Option<String>,
}

impl PatchDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            validated: false,
            diagnostic: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// True for empty or whitespace-only text.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// True once a dry run has accepted this patch.
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Output of the last rejected dry run.
    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    /// Files touched by the patch, as named on its `diff --git` headers (b-side).
    pub fn changed_files(&self) -> Vec<String> {
        self.text
            .lines()
            .filter_map(|line| line.strip_prefix("diff --git "))
            .filter_map(|rest| rest.split_whitespace().nth(1))
            .map(|b| b.strip_prefix("b/").unwrap_or(b).to_string())
            .collect()
    }

    /// Text as fed to `git apply`, which requires a final newline.
    fn apply_input(&self) -> String {
        if self.text.ends_with('\n') {
            self.text.clone()
        } else {
            format!("{}\n", self.text)
        }
    }
}

impl Serialize for PatchDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

/// Outcome of a successful [`PatchApplier::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The patch was empty; the tree is unchanged.
    NothingToApply,
}

/// Runs `git diff` and `git apply` inside a workspace.
pub struct PatchApplier {
    runner: Arc<dyn ProcessRunner>,
    timeout: Duration,
}

impl PatchApplier {
    pub fn new(runner: Arc<dyn ProcessRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Current changes to tracked files as a patch.
    ///
    /// A non-zero exit from `git diff` yields an empty patch; a timeout or
    /// launch failure is returned.
    pub async fn extract(&self, workspace: &Workspace) -> Result<PatchDocument, ProcessError> {
        let spec = CommandSpec::new("git")
            .arg("diff")
            .current_dir(&workspace.path)
            .timeout(self.timeout);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            warn!(
                instance_id = %workspace.instance_id,
                exit_code = out.code(),
                "git diff failed: {}",
                tail(&out.stderr, 500)
            );
            return Ok(PatchDocument::empty());
        }
        Ok(PatchDocument::new(out.stdout))
    }

    /// Non-mutating dry run. Records the verdict on `patch`; never errors.
    pub async fn validate(&self, workspace: &Workspace, patch: &mut PatchDocument) -> bool {
        if patch.is_empty() {
            patch.validated = true;
            patch.diagnostic = None;
            return true;
        }

        let spec = CommandSpec::new("git")
            .args(["apply", "--check"])
            .current_dir(&workspace.path)
            .stdin(patch.apply_input())
            .timeout(self.timeout);

        let (valid, diagnostic) = match self.runner.run(&spec).await {
            Ok(out) if out.success() => (true, None),
            Ok(out) => (false, Some(tail(&out.combined(), DIAGNOSTIC_LIMIT))),
            Err(e) => (false, Some(e.to_string())),
        };
        if let Some(diag) = &diagnostic {
            debug!(instance_id = %workspace.instance_id, "Dry run rejected patch: {}", diag);
        }
        patch.validated = valid;
        patch.diagnostic = diagnostic;
        valid
    }

    /// Applies a validated patch. Empty patches are a no-op.
    pub async fn apply(
        &self,
        workspace: &Workspace,
        patch: &PatchDocument,
    ) -> Result<ApplyOutcome, PatchApplyError> {
        if patch.is_empty() {
            return Ok(ApplyOutcome::NothingToApply);
        }
        if !patch.validated {
            return Err(PatchApplyError::NotValidated);
        }

        let spec = CommandSpec::new("git")
            .arg("apply")
            .current_dir(&workspace.path)
            .stdin(patch.apply_input())
            .timeout(self.timeout);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(PatchApplyError::ApplyFailed {
                diagnostic: tail(&out.combined(), DIAGNOSTIC_LIMIT),
            });
        }
        info!(
            instance_id = %workspace.instance_id,
            files = patch.changed_files().len(),
            "Applied patch ({} bytes)",
            patch.len()
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Dry run then apply; a rejected dry run becomes [`PatchApplyError::DryRunFailed`].
    pub async fn validate_and_apply(
        &self,
        workspace: &Workspace,
        patch: &mut PatchDocument,
    ) -> Result<ApplyOutcome, PatchApplyError> {
        if !self.validate(workspace, patch).await {
            return Err(PatchApplyError::DryRunFailed {
                diagnostic: patch.diagnostic.clone().unwrap_or_default(),
            });
        }
        self.apply(workspace, patch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::process::testing::*;
    use crate::runner::SystemProcessRunner;
    use std::path::Path;
    use tempfile::TempDir;

    const PATCH: &str = "diff --git a/pkg/mod.py b/pkg/mod.py\n--- a/pkg/mod.py\n+++ b/pkg/mod.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n";

    fn applier(runner: Arc<ScriptedRunner>) -> PatchApplier {
        PatchApplier::new(runner, Duration::from_secs(5))
    }

    fn ws() -> Workspace {
        Workspace::new("demo-1", "/tmp/demo-1")
    }

    #[test]
    fn test_document_basics() {
        assert!(PatchDocument::new("  \n\t").is_empty());
        let doc = PatchDocument::new(PATCH);
        assert!(!doc.is_empty());
        assert!(!doc.is_validated());
        assert_eq!(doc.changed_files(), vec!["pkg/mod.py"]);
        assert_eq!(PatchDocument::new("diff").apply_input(), "diff\n");
        assert_eq!(serde_json::to_string(&doc).unwrap(), serde_json::to_string(PATCH).unwrap());
    }

    #[tokio::test]
    async fn test_apply_requires_validation() {
        let runner = Arc::new(ScriptedRunner::new());
        let err = applier(runner.clone())
            .apply(&ws(), &PatchDocument::new(PATCH))
            .await
            .unwrap_err();
        assert!(matches!(err, PatchApplyError::NotValidated));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_patch_is_nothing_to_apply() {
        let runner = Arc::new(ScriptedRunner::new());
        let applier = applier(runner.clone());
        let mut doc = PatchDocument::new("   \n");
        assert!(applier.validate(&ws(), &mut doc).await);
        assert_eq!(applier.apply(&ws(), &doc).await.unwrap(), ApplyOutcome::NothingToApply);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_failure_never_applies() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("git apply --check", reply_exit(1, "error: patch does not apply"));
        let applier = applier(runner.clone());

        let mut doc = PatchDocument::new(PATCH);
        let err = applier.validate_and_apply(&ws(), &mut doc).await.unwrap_err();
        assert!(matches!(err, PatchApplyError::DryRunFailed { ref diagnostic } if diagnostic.contains("does not apply")));
        assert!(!doc.is_validated());
        assert_eq!(runner.count("git apply --check"), 1);
        assert_eq!(runner.count("git apply"), 1);
    }

    #[tokio::test]
    async fn test_validate_then_apply_pipes_patch() {
        let runner = Arc::new(ScriptedRunner::new());
        let applier = applier(runner.clone());
        let mut doc = PatchDocument::new(PATCH.trim_end());

        let outcome = applier.validate_and_apply(&ws(), &mut doc).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].command_line(), "git apply");
        assert!(calls[1].stdin.as_deref().unwrap().ends_with("+x = 2\n"));
    }

    #[tokio::test]
    async fn test_validate_timeout_is_false() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("git apply", reply_timeout());
        let mut doc = PatchDocument::new(PATCH);
        assert!(!applier(runner).validate(&ws(), &mut doc).await);
        assert!(doc.diagnostic().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_extract_failure_yields_empty() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("git diff", reply_exit(128, "not a git repository"));
        let doc = applier(runner).extract(&ws()).await.unwrap();
        assert!(doc.is_empty());
    }

    fn git(dir: &Path, args: &[&str]) -> bool {
        std::process::Command::new("git")
            .args(["-c", "user.email=eval@example.com", "-c", "user.name=eval"])
            .args(args)
            .current_dir(dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_real_git_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path();
        if !git(repo, &["init", "-q"]) {
            return;
        }
        std::fs::create_dir_all(repo.join("pkg")).unwrap();
        std::fs::write(repo.join("pkg/mod.py"), "x = 1\n").unwrap();
        assert!(git(repo, &["add", "."]));
        assert!(git(repo, &["commit", "-q", "-m", "init"]));

        let ws = Workspace::new("real", repo);
        let applier = PatchApplier::new(Arc::new(SystemProcessRunner::new()), Duration::from_secs(30));

        let mut good = PatchDocument::new(PATCH);
        assert!(applier.validate(&ws, &mut good).await);
        assert_eq!(applier.apply(&ws, &good).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(std::fs::read_to_string(repo.join("pkg/mod.py")).unwrap(), "x = 2\n");

        let extracted = applier.extract(&ws).await.unwrap();
        assert_eq!(extracted.changed_files(), vec!["pkg/mod.py"]);

        // Already applied, so the same patch no longer applies.
        let mut again = PatchDocument::new(PATCH);
        assert!(!applier.validate(&ws, &mut again).await);
        assert!(again.diagnostic().is_some());
    }
}
