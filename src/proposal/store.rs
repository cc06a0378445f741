//! Persistence for proposals and their audit trail.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{AuditEntry, Proposal, ProposalState};

/// Filter for [`ProposalStore::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProposalQuery {
    pub request_id: Option<String>,
    pub state: Option<ProposalState>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub until: Option<DateTime<Utc>>,
}

impl ProposalQuery {
    pub fn for_request(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Self::default()
        }
    }

    pub fn in_state(state: ProposalState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn matches(&self, proposal: &Proposal) -> bool {
        self.request_id
            .as_ref()
            .is_none_or(|id| *id == proposal.request_id)
            && self.state.is_none_or(|s| s == proposal.state)
            && self.since.is_none_or(|t| proposal.created_at >= t)
            && self.until.is_none_or(|t| proposal.created_at < t)
    }
}

/// Held while a proposal is read, checked and rewritten. Released on drop.
#[derive(Debug, Default)]
pub struct StoreGuard {
    file: Option<File>,
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = FileExt::unlock(file);
        }
    }
}

/// Current-state index plus append-only audit log.
pub trait ProposalStore: Send + Sync {
    /// Inserts or replaces the current state of a proposal.
    fn save(&self, proposal: &Proposal) -> Result<()>;

    /// Appends one entry to the audit log. Entries are never rewritten.
    fn append_audit(&self, proposal_id: &str, entry: &AuditEntry) -> Result<()>;

    fn load(&self, proposal_id: &str) -> Result<Proposal>;

    /// Matching proposals, oldest first.
    fn query(&self, query: &ProposalQuery) -> Result<Vec<Proposal>>;

    /// The audit log of one proposal, in append order.
    fn audit_log(&self, proposal_id: &str) -> Result<Vec<AuditEntry>>;

    /// Excludes every other handle on the same store, in any process, until
    /// the guard drops. Stores only reachable from one process need nothing.
    fn exclusive(&self) -> Result<StoreGuard> {
        Ok(StoreGuard::default())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditRecord {
    proposal_id: String,
    #[serde(flatten)]
    entry: AuditEntry,
}

fn sort_oldest_first(proposals: &mut [Proposal]) {
    proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Stores each proposal as `<dir>/<id>.json` and the audit log as
/// `<dir>/audit.jsonl`.
#[derive(Debug)]
pub struct FileProposalStore {
    dir: PathBuf,
    audit_guard: Mutex<()>,
}

impl FileProposalStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            audit_guard: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn proposal_path(&self, proposal_id: &str) -> Result<PathBuf> {
        let valid = !proposal_id.is_empty()
            && proposal_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::not_found("proposal", proposal_id));
        }
        Ok(self.dir.join(format!("{}.json", proposal_id)))
    }

    fn audit_path(&self) -> PathBuf {
        self.dir.join("audit.jsonl")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(".lock")
    }

    fn read_proposal(path: &Path) -> Result<Proposal> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Store(format!("corrupt proposal file {}: {}", path.display(), e)))
    }
}

impl ProposalStore for FileProposalStore {
    fn save(&self, proposal: &Proposal) -> Result<()> {
        let path = self.proposal_path(&proposal.id)?;
        let json = serde_json::to_string_pretty(proposal)
            .map_err(|e| Error::Store(format!("failed to serialize proposal: {}", e)))?;
        // Write-then-rename so readers never see a half-written index entry
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn append_audit(&self, proposal_id: &str, entry: &AuditEntry) -> Result<()> {
        let record = AuditRecord {
            proposal_id: proposal_id.to_string(),
            entry: entry.clone(),
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| Error::Store(format!("failed to serialize audit entry: {}", e)))?;

        let _guard = self
            .audit_guard
            .lock()
            .map_err(|_| Error::Store("audit log lock poisoned".to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.audit_path())?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn load(&self, proposal_id: &str) -> Result<Proposal> {
        let path = self.proposal_path(proposal_id)?;
        if !path.exists() {
            return Err(Error::not_found("proposal", proposal_id));
        }
        Self::read_proposal(&path)
    }

    fn query(&self, query: &ProposalQuery) -> Result<Vec<Proposal>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let proposal = Self::read_proposal(&path)?;
                if query.matches(&proposal) {
                    found.push(proposal);
                }
            }
        }
        sort_oldest_first(&mut found);
        Ok(found)
    }

    fn exclusive(&self) -> Result<StoreGuard> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.lock_path())?;
        FileExt::lock_exclusive(&file)?;
        Ok(StoreGuard { file: Some(file) })
    }

    fn audit_log(&self, proposal_id: &str) -> Result<Vec<AuditEntry>> {
        let content = match std::fs::read_to_string(self.audit_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(line)
                .map_err(|e| Error::Store(format!("corrupt audit log line {}: {}", idx + 1, e)))?;
            if record.proposal_id == proposal_id {
                entries.push(record.entry);
            }
        }
        Ok(entries)
    }
}

/// In-process store for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryProposalStore {
    proposals: Mutex<HashMap<String, Proposal>>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl MemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Store("memory store lock poisoned".to_string())
}

impl ProposalStore for MemoryProposalStore {
    fn save(&self, proposal: &Proposal) -> Result<()> {
        self.proposals
            .lock()
            .map_err(poisoned)?
            .insert(proposal.id.clone(), proposal.clone());
        Ok(())
    }

    fn append_audit(&self, proposal_id: &str, entry: &AuditEntry) -> Result<()> {
        self.audit.lock().map_err(poisoned)?.push(AuditRecord {
            proposal_id: proposal_id.to_string(),
            entry: entry.clone(),
        });
        Ok(())
    }

    fn load(&self, proposal_id: &str) -> Result<Proposal> {
        self.proposals
            .lock()
            .map_err(poisoned)?
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| Error::not_found("proposal", proposal_id))
    }

    fn query(&self, query: &ProposalQuery) -> Result<Vec<Proposal>> {
        let mut found: Vec<Proposal> = self
            .proposals
            .lock()
            .map_err(poisoned)?
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect();
        sort_oldest_first(&mut found);
        Ok(found)
    }

    fn audit_log(&self, proposal_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit
            .lock()
            .map_err(poisoned)?
            .iter()
            .filter(|r| r.proposal_id == proposal_id)
            .map(|r| r.entry.clone())
            .collect())
    }
}
