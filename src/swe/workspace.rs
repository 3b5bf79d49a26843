//! Per-instance working directories.
//!
//! A workspace is a shallow clone of the instance's repository checked out at
//! the pinned base revision. It is rebuilt from scratch by `prepare` and
//! rolled back in place by `reset` between agent attempts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{tail, SweInstance};
use crate::config::EvalConfig;
use crate::error::SetupError;
use crate::runner::{CommandSpec, ProcessOutput, ProcessRunner};

/// File written into every workspace with the bug report.
pub const PROBLEM_STATEMENT_FILE: &str = "PROBLEM_STATEMENT.md";

const STDERR_LIMIT: usize = 2000;

/// A checked-out repository owned by exactly one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub instance_id: String,
    pub path: PathBuf,
    /// Untracked files seeded by `prepare`; kept across resets.
    pub seeded_files: Vec<String>,
}

impl Workspace {
    pub fn new(instance_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            instance_id: instance_id.into(),
            path: path.into(),
            seeded_files: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates, seeds and resets workspaces under a common root.
pub struct WorkspaceManager {
    runner: Arc<dyn ProcessRunner>,
    root: PathBuf,
    clone_base_url: String,
    fetch_depth: u32,
    clone_timeout: Duration,
    git_timeout: Duration,
    agent_config_file: Option<PathBuf>,
}

impl WorkspaceManager {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: &EvalConfig) -> Self {
        Self {
            runner,
            root: config.workspace_root(),
            clone_base_url: config.clone_base_url.clone(),
            fetch_depth: config.fetch_depth,
            clone_timeout: config.clone_timeout(),
            git_timeout: config.git_timeout(),
            agent_config_file: config.agent.extra_config_file.clone(),
        }
    }

    /// Directory the given instance's workspace lives in.
    pub fn workspace_path(&self, instance: &SweInstance) -> PathBuf {
        self.root.join(instance.workspace_dir_name())
    }

    /// Builds a fresh workspace for `instance` at its pinned revision.
    ///
    /// Any previous directory for the instance is deleted first. Failures are
    /// fatal for the instance and are not retried here.
    pub async fn prepare(&self, instance: &SweInstance) -> Result<Workspace, SetupError> {
        instance.validate().map_err(SetupError::InvalidCoordinates)?;

        let path = self.workspace_path(instance);
        if path.exists() {
            debug!(instance_id = %instance.instance_id, path = %path.display(), "Removing stale workspace");
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&path).await?;

        info!(instance_id = %instance.instance_id, repo = %instance.repo, "Cloning repository");
        let url = instance.repo_url(&self.clone_base_url);
        let out = self
            .runner
            .run(
                &CommandSpec::new("git")
                    .args(["clone", "--depth", "1"])
                    .arg(url)
                    .arg(path.display().to_string())
                    .timeout(self.clone_timeout),
            )
            .await?;
        if !out.success() {
            return Err(SetupError::CloneFailed {
                repo: instance.repo.clone(),
                stderr: tail(&out.stderr, STDERR_LIMIT),
            });
        }

        let depth = self.fetch_depth.to_string();
        let out = self
            .git(
                &path,
                ["fetch", "--depth", depth.as_str(), "origin", instance.base_commit.as_str()],
                self.clone_timeout,
            )
            .await?;
        if !out.success() {
            return Err(SetupError::FetchFailed {
                revision: instance.base_commit.clone(),
                stderr: tail(&out.stderr, STDERR_LIMIT),
            });
        }

        let out = self
            .git(&path, ["checkout", instance.base_commit.as_str()], self.git_timeout)
            .await?;
        if !out.success() {
            return Err(SetupError::CheckoutFailed {
                revision: instance.base_commit.clone(),
                stderr: tail(&out.stderr, STDERR_LIMIT),
            });
        }

        let mut workspace = Workspace::new(instance.instance_id.clone(), path);
        self.seed(&mut workspace, instance).await?;
        info!(
            instance_id = %instance.instance_id,
            revision = %instance.base_commit,
            "Workspace ready at {}",
            workspace.path.display()
        );
        Ok(workspace)
    }

    async fn seed(
        &self,
        workspace: &mut Workspace,
        instance: &SweInstance,
    ) -> Result<(), SetupError> {
        let statement = format!("# {}\n\n{}", instance.instance_id, instance.problem_statement);
        tokio::fs::write(workspace.path.join(PROBLEM_STATEMENT_FILE), statement).await?;
        workspace.seeded_files.push(PROBLEM_STATEMENT_FILE.to_string());

        if let Some(src) = &self.agent_config_file {
            if let Some(name) = src.file_name() {
                if src.exists() {
                    tokio::fs::copy(src, workspace.path.join(name)).await?;
                    workspace
                        .seeded_files
                        .push(name.to_string_lossy().to_string());
                } else {
                    debug!(path = %src.display(), "Agent config file not found, skipping");
                }
            }
        }
        Ok(())
    }

    /// Discards every change to tracked files and removes untracked files,
    /// keeping the cloned history and the seeded files.
    pub async fn reset(&self, workspace: &Workspace) -> Result<(), SetupError> {
        debug!(instance_id = %workspace.instance_id, "Resetting workspace");

        let out = self
            .git(&workspace.path, ["reset", "--hard", "--quiet"], self.git_timeout)
            .await?;
        if !out.success() {
            return Err(SetupError::ResetFailed {
                path: workspace.path.clone(),
                stderr: tail(&out.stderr, STDERR_LIMIT),
            });
        }

        let mut clean = vec!["clean".to_string(), "-fd".to_string()];
        for name in &workspace.seeded_files {
            clean.push("-e".to_string());
            clean.push(name.clone());
        }
        let out = self.git(&workspace.path, clean, self.git_timeout).await?;
        if !out.success() {
            return Err(SetupError::ResetFailed {
                path: workspace.path.clone(),
                stderr: tail(&out.stderr, STDERR_LIMIT),
            });
        }
        Ok(())
    }

    async fn git<I, S>(
        &self,
        cwd: &Path,
        args: I,
        timeout: Duration,
    ) -> Result<ProcessOutput, SetupError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new("git")
            .args(args)
            .current_dir(cwd)
            .timeout(timeout);
        Ok(self.runner.run(&spec).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::process::testing::*;
    use crate::runner::SystemProcessRunner;
    use tempfile::TempDir;

    fn manager(runner: Arc<dyn ProcessRunner>, root: &Path) -> WorkspaceManager {
        WorkspaceManager::new(runner, &EvalConfig::default().with_work_dir(root))
    }

    fn instance() -> SweInstance {
        SweInstance::new("psf__requests-1", "psf/requests", "abc123", "It breaks.")
    }

    #[tokio::test]
    async fn test_prepare_runs_clone_fetch_checkout() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let mgr = manager(runner.clone(), tmp.path());

        let stale = tmp.path().join("workspaces").join("psf__requests-1");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("leftover.txt"), "old").unwrap();

        let ws = mgr.prepare(&instance()).await.unwrap();
        assert_eq!(ws.path, stale);
        assert!(!ws.path.join("leftover.txt").exists());

        let lines: Vec<String> = runner.calls().iter().map(|c| c.command_line()).collect();
        assert!(lines[0].starts_with("git clone --depth 1 https://github.com/psf/requests.git"));
        assert_eq!(lines[1], "git fetch --depth 100 origin abc123");
        assert_eq!(lines[2], "git checkout abc123");

        let statement = std::fs::read_to_string(ws.path.join(PROBLEM_STATEMENT_FILE)).unwrap();
        assert_eq!(statement, "# psf__requests-1\n\nIt breaks.");
        assert_eq!(ws.seeded_files, vec![PROBLEM_STATEMENT_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_prepare_maps_failures() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("git clone", reply_exit(128, "repository not found"));
        let err = manager(runner, tmp.path()).prepare(&instance()).await.unwrap_err();
        assert!(matches!(err, SetupError::CloneFailed { .. }));
        assert!(err.to_string().contains("repository not found"));

        let runner = Arc::new(ScriptedRunner::new());
        runner.on("git checkout", reply_exit(1, "reference is not a tree"));
        let err = manager(runner, tmp.path()).prepare(&instance()).await.unwrap_err();
        assert!(matches!(err, SetupError::CheckoutFailed { .. }));

        let runner = Arc::new(ScriptedRunner::new());
        runner.on("git fetch", reply_timeout());
        let err = manager(runner, tmp.path()).prepare(&instance()).await.unwrap_err();
        assert!(matches!(err, SetupError::Process(ref e) if e.is_timeout()));
    }

    #[tokio::test]
    async fn test_prepare_rejects_bad_coordinates_before_running() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let bad = SweInstance::new("x", "psf/requests", "--upload-pack=evil", "p");

        let err = manager(runner.clone(), tmp.path()).prepare(&bad).await.unwrap_err();
        assert!(matches!(err, SetupError::InvalidCoordinates(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_copies_agent_config() {
        let tmp = TempDir::new().unwrap();
        let cfg_file = tmp.path().join("sage_config.json");
        std::fs::write(&cfg_file, "{}").unwrap();

        let mut config = EvalConfig::default().with_work_dir(tmp.path().join("runs"));
        config.agent.extra_config_file = Some(cfg_file);
        let mgr = WorkspaceManager::new(Arc::new(ScriptedRunner::new()), &config);

        let ws = mgr.prepare(&instance()).await.unwrap();
        assert!(ws.path.join("sage_config.json").exists());
        assert!(ws.seeded_files.contains(&"sage_config.json".to_string()));
    }

    #[tokio::test]
    async fn test_reset_excludes_seeded_files() {
        let runner = Arc::new(ScriptedRunner::new());
        let mgr = manager(runner.clone(), Path::new("/tmp"));
        let mut ws = Workspace::new("a", "/tmp/a");
        ws.seeded_files = vec![PROBLEM_STATEMENT_FILE.to_string()];

        mgr.reset(&ws).await.unwrap();
        let lines: Vec<String> = runner.calls().iter().map(|c| c.command_line()).collect();
        assert_eq!(
            lines,
            vec![
                "git reset --hard --quiet".to_string(),
                format!("git clean -fd -e {}", PROBLEM_STATEMENT_FILE),
            ]
        );
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(["-c", "user.email=eval@example.com", "-c", "user.name=eval"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap()
            .status;
        assert!(status.success(), "git {:?} failed", args);
    }

    #[tokio::test]
    async fn test_reset_restores_real_repository() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(repo.join("pkg")).unwrap();
        std::fs::write(repo.join("pkg/mod.py"), "x = 1\n").unwrap();
        git(&repo, &["init", "-q"]);
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "init"]);

        std::fs::write(repo.join(PROBLEM_STATEMENT_FILE), "# a\n").unwrap();
        let mut ws = Workspace::new("a", &repo);
        ws.seeded_files.push(PROBLEM_STATEMENT_FILE.to_string());

        std::fs::write(repo.join("pkg/mod.py"), "x = 2\n").unwrap();
        std::fs::write(repo.join("pkg/scratch.py"), "junk\n").unwrap();

        let mgr = manager(Arc::new(SystemProcessRunner::new()), tmp.path());
        mgr.reset(&ws).await.unwrap();

        assert_eq!(std::fs::read_to_string(repo.join("pkg/mod.py")).unwrap(), "x = 1\n");
        assert!(!repo.join("pkg/scratch.py").exists());
        assert!(repo.join(PROBLEM_STATEMENT_FILE).exists());
    }

    #[tokio::test]
    async fn test_reset_makes_test_patch_apply_again() {
        if !git_available() {
            return;
        }
        use crate::swe::patch::{PatchApplier, PatchDocument};

        const TEST_PATCH: &str = "diff --git a/tests/test_mod.py b/tests/test_mod.py\n--- a/tests/test_mod.py\n+++ b/tests/test_mod.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n";

        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(repo.join("tests")).unwrap();
        std::fs::write(repo.join("tests/test_mod.py"), "x = 1\n").unwrap();
        git(&repo, &["init", "-q"]);
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "init"]);
        let ws = Workspace::new("a", &repo);

        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner::new());
        let patches = PatchApplier::new(runner.clone(), Duration::from_secs(30));
        let mgr = manager(runner, tmp.path());

        let mut fresh = PatchDocument::new(TEST_PATCH);
        let after_prepare = patches.validate(&ws, &mut fresh).await;
        assert!(after_prepare);

        std::fs::write(repo.join("tests/test_mod.py"), "x = 9\n").unwrap();
        let mut dirty = PatchDocument::new(TEST_PATCH);
        assert!(!patches.validate(&ws, &mut dirty).await);

        mgr.reset(&ws).await.unwrap();
        let mut again = PatchDocument::new(TEST_PATCH);
        assert_eq!(patches.validate(&ws, &mut again).await, after_prepare);
        assert!(again.is_validated());
    }
}
