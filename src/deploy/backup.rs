//! Byte-exact backups of the paths a proposal touches.
//!
//! Layout: `<dir>/<backup_id>/manifest.json` plus one blob per path that
//! existed before the apply.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub path: String,
    /// Blob file name; `None` if the path did not exist.
    pub blob: Option<String>,
    /// Unix permission bits of the original file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl BackupEntry {
    pub fn existed(&self) -> bool {
        self.blob.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub proposal_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<BackupEntry>,
    /// Directories that did not exist before the apply, deepest first.
    #[serde(default)]
    pub missing_dirs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;
    Ok(Some(std::fs::metadata(path)?.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<Option<u32>> {
    Ok(None)
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// Ancestors of `path` (nearest first) that are missing under `root`.
fn missing_ancestors(root: &Path, path: &str) -> Vec<String> {
    let mut missing = Vec::new();
    let mut current = path;
    while let Some((parent, _)) = current.rsplit_once('/') {
        if root.join(parent).exists() {
            break;
        }
        missing.push(parent.to_string());
        current = parent;
    }
    missing
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.dir.join(backup_id)
    }

    /// Records the current content (or absence) of `paths` under `root`.
    pub fn capture(&self, proposal_id: &str, root: &Path, paths: &[String]) -> Result<Backup> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.backup_dir(&id);
        std::fs::create_dir_all(&dir)?;

        let mut entries = Vec::with_capacity(paths.len());
        let mut missing_dirs: Vec<String> = Vec::new();
        for (idx, path) in paths.iter().enumerate() {
            let source = root.join(path);
            let mut mode = None;
            let blob = match read_optional(&source)? {
                Some(bytes) => {
                    let name = format!("{}.blob", idx);
                    std::fs::write(dir.join(&name), bytes)?;
                    mode = file_mode(&source)?;
                    Some(name)
                }
                None => {
                    for dir in missing_ancestors(root, path) {
                        if !missing_dirs.contains(&dir) {
                            missing_dirs.push(dir);
                        }
                    }
                    None
                }
            };
            entries.push(BackupEntry {
                path: path.clone(),
                blob,
                mode,
            });
        }
        missing_dirs.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));

        let backup = Backup {
            id,
            proposal_id: proposal_id.to_string(),
            created_at: Utc::now(),
            entries,
            missing_dirs,
        };
        let manifest = serde_json::to_string_pretty(&backup)
            .map_err(|e| Error::Store(format!("failed to serialize backup manifest: {}", e)))?;
        std::fs::write(dir.join("manifest.json"), manifest)?;

        tracing::info!(backup_id = %backup.id, proposal_id = %proposal_id, paths = paths.len(), "captured backup");
        Ok(backup)
    }

    pub fn load(&self, backup_id: &str) -> Result<Backup> {
        let path = self.backup_dir(backup_id).join("manifest.json");
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("backup", backup_id))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| Error::Store(format!("corrupt backup manifest {}: {}", path.display(), e)))
    }

    fn blob(&self, backup: &Backup, entry: &BackupEntry) -> Result<Option<Vec<u8>>> {
        match &entry.blob {
            Some(name) => Ok(Some(std::fs::read(self.backup_dir(&backup.id).join(name))?)),
            None => Ok(None),
        }
    }

    /// Puts every backed-up path under `root` back to its captured state.
    pub fn restore(&self, backup: &Backup, root: &Path) -> Result<()> {
        for entry in &backup.entries {
            let target = root.join(&entry.path);
            match self.blob(backup, entry)? {
                Some(bytes) => {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&target, bytes)?;
                    set_file_mode(&target, entry.mode)?;
                }
                None => match std::fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        for dir in &backup.missing_dirs {
            // Only empty directories; anything else was not ours to remove
            let _ = std::fs::remove_dir(root.join(dir));
        }
        tracing::info!(backup_id = %backup.id, proposal_id = %backup.proposal_id, "restored backup");
        Ok(())
    }

    /// Paths under `root` whose content or mode differs from the backup.
    pub fn verify(&self, backup: &Backup, root: &Path) -> Result<Vec<String>> {
        let mut mismatched = Vec::new();
        for entry in &backup.entries {
            let target = root.join(&entry.path);
            let current = read_optional(&target)?;
            let mode_differs = current.is_some() && entry.mode.is_some() && file_mode(&target)? != entry.mode;
            if mode_differs || current != self.blob(backup, entry)? {
                mismatched.push(entry.path.clone());
            }
        }
        Ok(mismatched)
    }

    pub fn list(&self) -> Result<Vec<Backup>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&id) {
                Ok(backup) => backups.push(backup),
                Err(e) => tracing::warn!(backup_id = %id, error = %e, "skipping unreadable backup"),
            }
        }
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(backups)
    }

    pub fn remove(&self, backup_id: &str) -> Result<()> {
        match std::fs::remove_dir_all(self.backup_dir(backup_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
