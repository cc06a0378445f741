//! Candidate fixes produced by the generator.
//!
//! A [`CandidateFix`] is untrusted data. Nothing in it is executed or written
//! anywhere until it has passed preflight, and then only inside a sandbox or
//! through the deployer.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::diff::apply_unified_diff;

/// Version of the candidate schema the generator must emit.
pub const CANDIDATE_SCHEMA_VERSION: u32 = 1;

/// Self-reported risk of a candidate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    #[default]
    Medium,
    High,
}

impl RiskTier {
    /// Numeric rank, lowest risk first.
    pub fn rank(self) -> u8 {
        match self {
            RiskTier::Low => 0,
            RiskTier::Medium => 1,
            RiskTier::High => 2,
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(RiskTier::Low),
            "medium" => Ok(RiskTier::Medium),
            "high" => Ok(RiskTier::High),
            other => Err(format!("unknown risk tier '{}'", other)),
        }
    }
}

/// What a file operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOpKind {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for FileOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileOpKind::Create => "create",
            FileOpKind::Modify => "modify",
            FileOpKind::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// New file content, either complete or as a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChange {
    Content(String),
    Diff(String),
}

/// One step of a candidate's change-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub kind: FileOpKind,
    /// Required for create and modify, ignored for delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<FileChange>,
}

impl FileOperation {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileOpKind::Create,
            change: Some(FileChange::Content(content.into())),
        }
    }

    pub fn modify(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileOpKind::Modify,
            change: Some(FileChange::Content(content.into())),
        }
    }

    pub fn modify_with_diff(path: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileOpKind::Modify,
            change: Some(FileChange::Diff(diff.into())),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileOpKind::Delete,
            change: None,
        }
    }

    /// Computes the file's content after this operation.
    ///
    /// `current` is the file's content before the operation (`None` if it
    /// does not exist). Returns `None` when the file is deleted.
    pub fn resolve(&self, current: Option<&str>) -> Result<Option<String>, String> {
        match self.kind {
            FileOpKind::Delete => Ok(None),
            FileOpKind::Create | FileOpKind::Modify => match &self.change {
                Some(FileChange::Content(content)) => Ok(Some(content.clone())),
                Some(FileChange::Diff(diff)) => {
                    let base = match (self.kind, current) {
                        (FileOpKind::Create, _) => "",
                        (_, Some(text)) => text,
                        (_, None) => {
                            return Err(format!("cannot apply diff to missing file {}", self.path))
                        }
                    };
                    apply_unified_diff(base, diff)
                        .map(Some)
                        .map_err(|e| format!("diff for {} does not apply: {}", self.path, e))
                }
                None => Err(format!("{} operation on {} has no content", self.kind, self.path)),
            },
        }
    }
}

/// Returns why `path` is not a safe repository-relative path, if it isn't.
pub fn unsafe_path_reason(path: &str) -> Option<String> {
    if path.trim().is_empty() {
        return Some("path is empty".to_string());
    }
    let p = Path::new(path);
    if p.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return Some(format!("{} is an absolute path", path));
    }
    for component in p.components() {
        match component {
            Component::ParentDir => {
                return Some(format!("{} escapes the repository root", path));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Some(format!("{} is an absolute path", path));
            }
            Component::Normal(name) if name == ".git" => {
                return Some(format!("{} is inside .git", path));
            }
            _ => {}
        }
    }
    None
}

/// A proposed fix for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFix {
    pub id: String,
    pub request_id: String,
    pub schema_version: u32,
    pub title: String,
    pub description: String,
    pub risk: RiskTier,
    /// Applied in order.
    pub operations: Vec<FileOperation>,
}

impl CandidateFix {
    pub fn new(
        request_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        risk: RiskTier,
        operations: Vec<FileOperation>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            schema_version: CANDIDATE_SCHEMA_VERSION,
            title: title.into(),
            description: description.into(),
            risk,
            operations,
        }
    }

    /// Sorted, de-duplicated set of paths this candidate touches.
    pub fn touched_paths(&self) -> Vec<String> {
        touched_paths(&self.operations)
    }

    pub fn files_touched(&self) -> usize {
        self.touched_paths().len()
    }
}

/// Sorted, de-duplicated set of paths in an operation list.
pub fn touched_paths(operations: &[FileOperation]) -> Vec<String> {
    let mut paths: Vec<String> = operations.iter().map(|op| op.path.clone()).collect();
    paths.sort();
    paths.dedup();
    paths
}

/// Writes an operation list into the tree rooted at `root`.
///
/// Operations are resolved against the tree as it evolves, so a later
/// operation sees the result of an earlier one on the same path.
pub fn apply_operations(root: &Path, operations: &[FileOperation]) -> Result<(), String> {
    for op in operations {
        if let Some(reason) = unsafe_path_reason(&op.path) {
            return Err(reason);
        }
        let target = root.join(&op.path);
        let current = match std::fs::read(&target) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(format!("failed to read {}: {}", op.path, e)),
        };

        // Only a diff needs the current content as text
        let resolved = match (&op.change, current.as_deref()) {
            (Some(FileChange::Diff(_)), Some(bytes)) if op.kind != FileOpKind::Delete => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| format!("cannot apply diff to non-UTF-8 file {}", op.path))?;
                op.resolve(Some(text))?
            }
            _ => op.resolve(None)?,
        };

        match resolved {
            Some(content) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| format!("failed to create parent of {}: {}", op.path, e))?;
                }
                std::fs::write(&target, content)
                    .map_err(|e| format!("failed to write {}: {}", op.path, e))?;
            }
            None => {
                if current.is_some() {
                    std::fs::remove_file(&target)
                        .map_err(|e| format!("failed to delete {}: {}", op.path, e))?;
                }
            }
        }
    }
    Ok(())
}
