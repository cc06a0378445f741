//! Point-in-time view of the codebase used by preflight and context building.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::manifest::DependencyManifest;

/// Directories never captured, copied into sandboxes, or searched.
pub const DEFAULT_IGNORED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".remediation",
];

/// File and directory sets of a tree, plus its dependency manifest.
///
/// Contents are read lazily and cached, so every check against one snapshot
/// sees the same bytes even if the tree changes underneath.
#[derive(Debug)]
pub struct CodebaseSnapshot {
    root: PathBuf,
    files: BTreeSet<String>,
    dirs: BTreeSet<String>,
    manifest: DependencyManifest,
    contents: Mutex<HashMap<String, Option<Arc<str>>>>,
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

impl CodebaseSnapshot {
    /// Walks `root`, skipping directories named in `ignored`.
    pub fn capture(root: &Path, ignored: &[String]) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::not_found("repository", root.display().to_string()));
        }

        let mut files = BTreeSet::new();
        let mut dirs = BTreeSet::new();

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && ignored.iter().any(|i| e.file_name().to_string_lossy() == *i))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let Some(key) = relative_key(root, entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                dirs.insert(key);
            } else if entry.file_type().is_file() {
                files.insert(key);
            }
        }

        tracing::debug!(root = ?root, files = files.len(), dirs = dirs.len(), "captured snapshot");

        Ok(Self {
            root: root.to_path_buf(),
            files,
            dirs,
            manifest: DependencyManifest::load(root),
            contents: Mutex::new(HashMap::new()),
        })
    }

    /// Builds a snapshot from in-memory files. Nothing is read from disk.
    pub fn from_files<I, P, C>(files: I, manifest: DependencyManifest) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let mut file_set = BTreeSet::new();
        let mut dirs = BTreeSet::new();
        let mut contents = HashMap::new();

        for (path, content) in files {
            let path: String = path.into();
            let mut parent = path.as_str();
            while let Some((dir, _)) = parent.rsplit_once('/') {
                dirs.insert(dir.to_string());
                parent = dir;
            }
            let content: String = content.into();
            contents.insert(path.clone(), Some(Arc::from(content.as_str())));
            file_set.insert(path);
        }

        Self {
            root: PathBuf::new(),
            files: file_set,
            dirs,
            manifest,
            contents: Mutex::new(contents),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    /// True for existing directories; the empty path is the root.
    pub fn has_dir(&self, path: &str) -> bool {
        path.is_empty() || self.dirs.contains(path)
    }

    pub fn manifest(&self) -> &DependencyManifest {
        &self.manifest
    }

    /// Returns a file's text, or `None` if it is missing or not UTF-8.
    pub fn read(&self, path: &str) -> Option<Arc<str>> {
        if !self.files.contains(path) {
            return None;
        }
        let mut cache = self.contents.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(path) {
            return cached.clone();
        }
        let loaded = std::fs::read_to_string(self.root.join(path))
            .ok()
            .map(|s| Arc::from(s.as_str()));
        cache.insert(path.to_string(), loaded.clone());
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ignored() -> Vec<String> {
        DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn capture_records_files_and_dirs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src/pricing")).unwrap();
        std::fs::write(dir.path().join("src/pricing/discount.py"), "x = 1\n").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "").unwrap();

        let snapshot = CodebaseSnapshot::capture(dir.path(), &ignored()).unwrap();

        assert!(snapshot.has_file("src/pricing/discount.py"));
        assert!(snapshot.has_dir("src/pricing"));
        assert!(snapshot.has_dir(""));
        assert!(!snapshot.has_file("node_modules/pkg/index.js"));
        assert_eq!(snapshot.file_count(), 1);
    }

    #[test]
    fn read_is_cached_after_first_access() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "first").unwrap();
        let snapshot = CodebaseSnapshot::capture(dir.path(), &ignored()).unwrap();

        assert_eq!(snapshot.read("a.txt").as_deref(), Some("first"));
        std::fs::write(dir.path().join("a.txt"), "second").unwrap();
        assert_eq!(snapshot.read("a.txt").as_deref(), Some("first"));
        assert!(snapshot.read("missing.txt").is_none());
    }

    #[test]
    fn from_files_derives_directories() {
        let snapshot = CodebaseSnapshot::from_files(
            [("src/a/b.rs", "fn b() {}"), ("README.md", "hi")],
            DependencyManifest::default(),
        );
        assert!(snapshot.has_dir("src"));
        assert!(snapshot.has_dir("src/a"));
        assert!(!snapshot.has_dir("src/a/b.rs"));
        assert_eq!(snapshot.read("src/a/b.rs").as_deref(), Some("fn b() {}"));
    }

    #[test]
    fn capture_fails_for_missing_root() {
        let err = CodebaseSnapshot::capture(Path::new("/definitely/not/here"), &[]).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
