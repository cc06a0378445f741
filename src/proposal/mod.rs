//! Proposals: the persisted record of a selected candidate moving through
//! approval and deployment.
//!
//! [`ProposalManager`] is the only writer of proposal state. Every
//! transition is checked against [`ProposalState::can_transition`] and
//! appended to the audit log before the caller sees the new state.

mod state;
mod store;

pub use state::ProposalState;
pub use store::{FileProposalStore, MemoryProposalStore, ProposalQuery, ProposalStore, StoreGuard};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candidate::{touched_paths, CandidateFix, FileOperation, RiskTier};
use crate::diff::render_unified_diff;
use crate::error::{Error, Result};
use crate::events::{EventSink, NullSink, PipelineEvent};
use crate::snapshot::CodebaseSnapshot;
use crate::test_runner::TestResult;

/// Actor recorded for transitions the pipeline makes on its own.
pub const PIPELINE_ACTOR: &str = "pipeline";

/// One line of a proposal's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    /// `None` for the creation entry.
    pub from: Option<ProposalState>,
    pub to: ProposalState,
    pub reason: String,
}

/// Test outcome of the selected candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub session_id: String,
    pub passed: u32,
    pub total: u32,
    pub duration_ms: u64,
}

impl TestSummary {
    pub fn pass_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.passed) / f64::from(self.total)
        }
    }
}

impl From<&TestResult> for TestSummary {
    fn from(result: &TestResult) -> Self {
        Self {
            session_id: result.session_id.clone(),
            passed: result.passed,
            total: result.total,
            duration_ms: result.duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub request_id: String,
    pub candidate_id: String,
    pub title: String,
    pub narrative: String,
    pub risk: RiskTier,
    pub state: ProposalState,
    /// Fixed at creation.
    pub operations: Vec<FileOperation>,
    /// Unified diff of `operations` against the tree they were tested on.
    pub diff: String,
    pub test_summary: TestSummary,
    pub backup_id: Option<String>,
    pub audit: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn touched_paths(&self) -> Vec<String> {
        touched_paths(&self.operations)
    }

    /// The most recent audit entry that moved the proposal into `state`.
    pub fn last_entry_for(&self, state: ProposalState) -> Option<&AuditEntry> {
        self.audit.iter().rev().find(|e| e.to == state)
    }
}

/// Renders the combined diff of an operation list against a snapshot.
pub fn render_operations_diff(operations: &[FileOperation], snapshot: &CodebaseSnapshot) -> Result<String> {
    let mut overlay: HashMap<&str, Option<String>> = HashMap::new();
    let mut out = String::new();
    for op in operations {
        let before = match overlay.get(op.path.as_str()) {
            Some(content) => content.clone(),
            None => snapshot.read(&op.path).map(|s| s.to_string()),
        };
        let after = op.resolve(before.as_deref()).map_err(|reason| Error::Validation {
            candidate_id: String::new(),
            reason,
        })?;
        out.push_str(&render_unified_diff(&op.path, before.as_deref(), after.as_deref()));
        overlay.insert(op.path.as_str(), after);
    }
    Ok(out)
}

/// Owns the proposal state machine.
pub struct ProposalManager {
    store: Arc<dyn ProposalStore>,
    events: Arc<dyn EventSink>,
    // Serialises load-check-save within this process; the store guard
    // covers other processes.
    transitions: Mutex<()>,
}

impl ProposalManager {
    pub fn new(store: Arc<dyn ProposalStore>) -> Self {
        Self {
            store,
            events: Arc::new(NullSink),
            transitions: Mutex::new(()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Creates a Draft proposal from the selected candidate.
    pub fn create(
        &self,
        candidate: &CandidateFix,
        snapshot: &CodebaseSnapshot,
        test: &TestResult,
    ) -> Result<Proposal> {
        let diff = render_operations_diff(&candidate.operations, snapshot).map_err(|e| match e {
            Error::Validation { reason, .. } => Error::Validation {
                candidate_id: candidate.id.clone(),
                reason,
            },
            other => other,
        })?;

        let now = Utc::now();
        let entry = AuditEntry {
            at: now,
            actor: PIPELINE_ACTOR.to_string(),
            from: None,
            to: ProposalState::Draft,
            reason: format!(
                "selected candidate {} ({}/{} tests passed)",
                candidate.id, test.passed, test.total
            ),
        };
        let proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: candidate.request_id.clone(),
            candidate_id: candidate.id.clone(),
            title: candidate.title.clone(),
            narrative: candidate.description.clone(),
            risk: candidate.risk,
            state: ProposalState::Draft,
            operations: candidate.operations.clone(),
            diff,
            test_summary: TestSummary::from(test),
            backup_id: None,
            audit: vec![entry.clone()],
            created_at: now,
            updated_at: now,
            applied_at: None,
        };

        {
            let _guard = self.lock()?;
            self.store.save(&proposal)?;
            self.store.append_audit(&proposal.id, &entry)?;
        }

        tracing::info!(
            proposal_id = %proposal.id,
            request_id = %proposal.request_id,
            candidate_id = %proposal.candidate_id,
            "created proposal"
        );
        self.events.emit(PipelineEvent::ProposalStateChanged {
            proposal_id: proposal.id.clone(),
            from: None,
            to: ProposalState::Draft,
            actor: PIPELINE_ACTOR.to_string(),
        });
        Ok(proposal)
    }

    pub fn mark_validated(&self, proposal_id: &str, reason: &str) -> Result<Proposal> {
        self.transition(proposal_id, ProposalState::SandboxValidated, PIPELINE_ACTOR, reason, |_| {})
    }

    /// Makes the proposal visible to approvers.
    pub fn publish(&self, proposal_id: &str) -> Result<Proposal> {
        self.transition(
            proposal_id,
            ProposalState::AwaitingApproval,
            PIPELINE_ACTOR,
            "awaiting approver decision",
            |_| {},
        )
    }

    pub fn approve(&self, proposal_id: &str, actor: &str, reason: &str) -> Result<Proposal> {
        require_actor(actor)?;
        self.transition(proposal_id, ProposalState::Approved, actor, reason, |_| {})
    }

    pub fn reject(&self, proposal_id: &str, actor: &str, reason: &str) -> Result<Proposal> {
        require_actor(actor)?;
        self.transition(proposal_id, ProposalState::Rejected, actor, reason, |_| {})
    }

    /// Records the backup taken before applying. Not a state change.
    pub fn record_backup(&self, proposal_id: &str, backup_id: &str) -> Result<Proposal> {
        let _guard = self.lock()?;
        let mut proposal = self.store.load(proposal_id)?;
        if proposal.state != ProposalState::Approved {
            return Err(Error::InvalidTransition {
                proposal_id: proposal_id.to_string(),
                from: proposal.state,
                to: ProposalState::Applied,
            });
        }
        proposal.backup_id = Some(backup_id.to_string());
        proposal.updated_at = Utc::now();
        self.store.save(&proposal)?;
        Ok(proposal)
    }

    pub fn mark_applied(&self, proposal_id: &str, actor: &str, reason: &str) -> Result<Proposal> {
        self.transition(proposal_id, ProposalState::Applied, actor, reason, |p| {
            p.applied_at = Some(Utc::now());
        })
    }

    pub fn mark_rolled_back(&self, proposal_id: &str, actor: &str, reason: &str) -> Result<Proposal> {
        self.transition(proposal_id, ProposalState::RolledBack, actor, reason, |_| {})
    }

    pub fn get(&self, proposal_id: &str) -> Result<Proposal> {
        self.store.load(proposal_id)
    }

    /// Proposals waiting for an approver, oldest first.
    pub fn pending(&self) -> Result<Vec<Proposal>> {
        self.store
            .query(&ProposalQuery::in_state(ProposalState::AwaitingApproval))
    }

    pub fn query(&self, query: &ProposalQuery) -> Result<Vec<Proposal>> {
        self.store.query(query)
    }

    pub fn audit_log(&self, proposal_id: &str) -> Result<Vec<AuditEntry>> {
        self.store.audit_log(proposal_id)
    }

    /// Rejects every proposal of `request_id` still awaiting approval.
    ///
    /// Fails without touching anything if one of them is already Approved
    /// or Applied. Returns the rejected proposals.
    pub fn withdraw_request(&self, request_id: &str, actor: &str, reason: &str) -> Result<Vec<Proposal>> {
        let proposals = self.store.query(&ProposalQuery::for_request(request_id))?;
        if let Some(p) = proposals
            .iter()
            .find(|p| matches!(p.state, ProposalState::Approved | ProposalState::Applied))
        {
            return Err(Error::InvalidTransition {
                proposal_id: p.id.clone(),
                from: p.state,
                to: ProposalState::Rejected,
            });
        }

        let reason = format!("request cancelled: {}", reason);
        proposals
            .iter()
            .filter(|p| p.state == ProposalState::AwaitingApproval)
            .map(|p| self.reject(&p.id, actor, &reason))
            .collect()
    }

    fn lock(&self) -> Result<(std::sync::MutexGuard<'_, ()>, StoreGuard)> {
        let local = self
            .transitions
            .lock()
            .map_err(|_| Error::Store("proposal transition lock poisoned".to_string()))?;
        let shared = self.store.exclusive()?;
        Ok((local, shared))
    }

    fn transition(
        &self,
        proposal_id: &str,
        to: ProposalState,
        actor: &str,
        reason: &str,
        update: impl FnOnce(&mut Proposal),
    ) -> Result<Proposal> {
        let _guard = self.lock()?;
        let mut proposal = self.store.load(proposal_id)?;
        let from = proposal.state;
        if !from.can_transition(to) {
            tracing::warn!(
                proposal_id = %proposal_id,
                from = %from,
                to = %to,
                actor = %actor,
                "rejected invalid proposal transition"
            );
            return Err(Error::InvalidTransition {
                proposal_id: proposal_id.to_string(),
                from,
                to,
            });
        }

        let entry = AuditEntry {
            at: Utc::now(),
            actor: actor.to_string(),
            from: Some(from),
            to,
            reason: reason.to_string(),
        };
        proposal.state = to;
        proposal.updated_at = entry.at;
        update(&mut proposal);
        proposal.audit.push(entry.clone());

        self.store.save(&proposal)?;
        self.store.append_audit(proposal_id, &entry)?;

        tracing::info!(
            proposal_id = %proposal_id,
            from = %from,
            to = %to,
            actor = %actor,
            reason = %reason,
            "proposal transitioned"
        );
        self.events.emit(PipelineEvent::ProposalStateChanged {
            proposal_id: proposal_id.to_string(),
            from: Some(from),
            to,
            actor: actor.to_string(),
        });
        Ok(proposal)
    }
}

fn require_actor(actor: &str) -> Result<()> {
    if actor.trim().is_empty() {
        return Err(Error::Config("approver actions require an actor".to_string()));
    }
    Ok(())
}
