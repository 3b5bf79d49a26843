//! Bounded agent retry loop.
//!
//! Attempts run `0..=max_retries`. Before every attempt after the first the
//! workspace is reset in place; the agent is invoked; the diff is extracted.
//! The first non-empty diff ends the loop. Running out of attempts is not an
//! error: the outcome simply carries an empty patch.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::patch::{PatchApplier, PatchDocument};
use super::workspace::{Workspace, WorkspaceManager};
use crate::error::RetryError;
use crate::runner::AgentInvoker;

/// One agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-based ordinal, strictly increasing.
    pub index: u32,
    pub is_retry: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_secs: f64,
    pub trajectory_file: Option<PathBuf>,
    /// Size in bytes of the diff left after this attempt.
    pub patch_bytes: usize,
}

/// Result of the whole loop.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// The first non-empty diff, or an empty patch.
    pub patch: PatchDocument,
    pub attempts: Vec<AttemptRecord>,
    /// The loop stopped because the agent timed out without leaving a diff.
    pub timed_out: bool,
}

impl RetryOutcome {
    pub fn invocations(&self) -> usize {
        self.attempts.len()
    }

    pub fn produced_patch(&self) -> bool {
        !self.patch.is_empty()
    }
}

/// Drives agent attempts until a diff appears or the budget runs out.
pub struct RetryController {
    workspaces: Arc<WorkspaceManager>,
    agent: Arc<AgentInvoker>,
    patches: Arc<PatchApplier>,
    max_retries: u32,
}

impl RetryController {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        agent: Arc<AgentInvoker>,
        patches: Arc<PatchApplier>,
        max_retries: u32,
    ) -> Self {
        Self {
            workspaces,
            agent,
            patches,
            max_retries,
        }
    }

    /// Upper bound on agent invocations per instance.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub async fn run(
        &self,
        workspace: &Workspace,
        problem_statement: &str,
    ) -> Result<RetryOutcome, RetryError> {
        let mut attempts = Vec::new();

        for attempt in 0..=self.max_retries {
            let is_retry = attempt > 0;
            if is_retry {
                info!(
                    instance_id = %workspace.instance_id,
                    "Retry attempt {}/{}",
                    attempt,
                    self.max_retries
                );
                self.workspaces.reset(workspace).await?;
            }

            let invocation = self
                .agent
                .invoke(workspace, problem_statement, attempt, is_retry)
                .await;
            let patch = self.patches.extract(workspace).await?;

            attempts.push(AttemptRecord {
                index: attempt,
                is_retry,
                exit_code: invocation.exit_code,
                timed_out: invocation.timed_out,
                duration_secs: invocation.duration.as_secs_f64(),
                trajectory_file: invocation.trajectory_file.clone(),
                patch_bytes: if patch.is_empty() { 0 } else { patch.len() },
            });

            if !patch.is_empty() {
                info!(
                    instance_id = %workspace.instance_id,
                    attempt,
                    "Generated patch ({} bytes)",
                    patch.len()
                );
                return Ok(RetryOutcome {
                    patch,
                    attempts,
                    timed_out: false,
                });
            }

            if invocation.timed_out {
                warn!(
                    instance_id = %workspace.instance_id,
                    attempt,
                    "Agent timed out without changes, not retrying"
                );
                return Ok(RetryOutcome {
                    patch: PatchDocument::empty(),
                    attempts,
                    timed_out: true,
                });
            }

            if attempt < self.max_retries {
                info!(instance_id = %workspace.instance_id, "No patch generated, will retry");
            } else {
                warn!(
                    instance_id = %workspace.instance_id,
                    "No patch generated after {} attempts",
                    self.max_attempts()
                );
            }
        }

        Ok(RetryOutcome {
            patch: PatchDocument::empty(),
            attempts,
            timed_out: false,
        })
    }
}
