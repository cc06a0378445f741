//! Git worktree-based sandbox implementation.

use std::path::PathBuf;
use std::process::Command;

use crate::error::{Error, Result};

use super::provider::{dir_label, Sandbox, SandboxProvider};

/// A sandbox implemented as a detached git worktree of `HEAD`.
///
/// Only committed content is visible inside it; uncommitted changes in the
/// main working tree are not carried over.
#[derive(Debug)]
pub struct WorktreeSandboxInstance {
    id: String,
    /// Path to the worktree directory.
    path: PathBuf,
    /// Path to the parent git repository.
    repo_path: PathBuf,
    /// Whether the sandbox has been cleaned up.
    cleaned_up: bool,
}

impl Sandbox for WorktreeSandboxInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> &PathBuf {
        &self.path
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }

        // Must run from the parent repo
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["worktree", "remove", "--force"])
            .arg(&self.path)
            .output()?;

        if !output.status.success() && self.path.exists() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(path = ?self.path, stderr = %stderr, "git worktree remove failed, deleting directory");
            std::fs::remove_dir_all(&self.path).map_err(|e| Error::SandboxCleanup {
                path: self.path.clone(),
                reason: format!("{}; {}", stderr.trim(), e),
            })?;
        }

        let prune = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["worktree", "prune"])
            .output()?;
        if !prune.status.success() {
            // Stale metadata only; the directory is already gone
            tracing::warn!(path = ?self.path, "git worktree prune failed");
        }

        self.cleaned_up = true;
        tracing::debug!(sandbox_id = %self.id, "removed sandbox worktree");
        Ok(())
    }
}

impl Drop for WorktreeSandboxInstance {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, path = ?self.path, "failed to cleanup sandbox on drop");
            }
        }
    }
}

/// Provider that creates sandboxes using git worktrees.
#[derive(Debug, Clone)]
pub struct WorktreeSandbox {
    /// Path to the git repository.
    repo_path: PathBuf,
    /// Base directory for worktrees. If None, uses a temp directory.
    base_dir: Option<PathBuf>,
}

impl WorktreeSandbox {
    /// Creates a new worktree sandbox provider.
    pub fn new(repo_path: PathBuf, base_dir: Option<PathBuf>) -> Self {
        Self {
            repo_path,
            base_dir,
        }
    }

    fn worktree_path(&self, id: &str) -> Result<PathBuf> {
        let base = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("remediation-sandboxes"),
        };
        std::fs::create_dir_all(&base)?;
        Ok(base.join(id))
    }
}

impl SandboxProvider for WorktreeSandbox {
    type Sandbox = WorktreeSandboxInstance;

    fn repo_path(&self) -> &PathBuf {
        &self.repo_path
    }

    fn name(&self) -> &str {
        "worktree"
    }

    fn create(&self, label: &str) -> Result<Self::Sandbox> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", dir_label(label), &suffix[..8]);
        let worktree_path = self.worktree_path(&id)?;

        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["worktree", "add", "--detach"])
            .arg(&worktree_path)
            .arg("HEAD")
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Sandbox(format!("git worktree add failed: {}", stderr.trim())));
        }

        tracing::info!(path = ?worktree_path, sandbox_id = %id, "created sandbox worktree");

        Ok(WorktreeSandboxInstance {
            id,
            path: worktree_path,
            repo_path: self.repo_path.clone(),
            cleaned_up: false,
        })
    }
}
