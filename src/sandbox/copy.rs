//! File-copy sandbox implementation.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

use super::provider::{dir_label, Sandbox, SandboxProvider};

/// A private copy of the repository tree.
#[derive(Debug)]
pub struct CopySandboxInstance {
    id: String,
    path: PathBuf,
    cleaned_up: bool,
}

impl Sandbox for CopySandboxInstance {
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
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::SandboxCleanup {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        }
        self.cleaned_up = true;
        tracing::debug!(sandbox_id = %self.id, "removed sandbox copy");
        Ok(())
    }
}

impl Drop for CopySandboxInstance {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, path = ?self.path, "failed to cleanup sandbox on drop");
            }
        }
    }
}

/// Provider that copies the working tree, skipping ignored directories.
///
/// Unlike [`super::WorktreeSandbox`] this includes uncommitted changes and
/// does not need a git repository.
#[derive(Debug, Clone)]
pub struct CopySandbox {
    repo_path: PathBuf,
    base_dir: Option<PathBuf>,
    ignored_dirs: Vec<String>,
}

impl CopySandbox {
    pub fn new(repo_path: PathBuf, base_dir: Option<PathBuf>, ignored_dirs: Vec<String>) -> Self {
        Self {
            repo_path,
            base_dir,
            ignored_dirs,
        }
    }

    fn copy_tree(&self, dest: &Path) -> Result<usize> {
        let mut copied = 0;
        let walker = WalkDir::new(&self.repo_path)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && self
                        .ignored_dirs
                        .iter()
                        .any(|i| e.file_name().to_string_lossy() == *i))
            });

        for entry in walker {
            let entry = entry.map_err(|e| Error::Sandbox(format!("failed to walk repository: {}", e)))?;
            let rel = entry
                .path()
                .strip_prefix(&self.repo_path)
                .map_err(|e| Error::Sandbox(e.to_string()))?;
            let target = dest.join(rel);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if entry.file_type().is_file() {
                std::fs::copy(entry.path(), &target)?;
                copied += 1;
            } else if entry.path().is_file() {
                // Symlink to a file: copy its target's bytes
                std::fs::copy(entry.path(), &target)?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}

impl SandboxProvider for CopySandbox {
    type Sandbox = CopySandboxInstance;

    fn repo_path(&self) -> &PathBuf {
        &self.repo_path
    }

    fn name(&self) -> &str {
        "copy"
    }

    fn create(&self, label: &str) -> Result<Self::Sandbox> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", dir_label(label), &suffix[..8]);
        let base = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("remediation-sandboxes"),
        };
        let path = base.join(&id);
        std::fs::create_dir_all(&path)?;

        // Owns the directory from here on, so a failed copy is torn down.
        let mut sandbox = CopySandboxInstance {
            id,
            path,
            cleaned_up: false,
        };

        match self.copy_tree(&sandbox.path) {
            Ok(files) => {
                tracing::info!(path = ?sandbox.path, files, sandbox_id = %sandbox.id, "created sandbox copy");
                Ok(sandbox)
            }
            Err(e) => {
                if let Err(cleanup) = sandbox.cleanup() {
                    tracing::error!(error = %cleanup, "failed to remove partial sandbox");
                }
                Err(Error::Sandbox(format!("failed to copy repository: {}", e)))
            }
        }
    }
}
