//! Applying approved proposals to the live tree, and rolling them back.
//!
//! Every apply follows the same sequence under an exclusive lease on the
//! proposal's paths: back up, write, smoke check, then either mark Applied
//! or restore the backup and mark RolledBack.

mod backup;
mod lock;
mod smoke;

pub use backup::{Backup, BackupEntry, BackupStore};
pub use lock::{PathLease, PathLockManager};
pub use smoke::{CommandSmokeCheck, SmokeCheck, SmokeResult, SyntaxSmokeCheck};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::budget::ExecutionBudget;
use crate::cancel::CancelToken;
use crate::candidate::apply_operations;
use crate::error::{Error, Result};
use crate::proposal::{Proposal, ProposalManager, ProposalState};

/// Actor recorded for transitions the deployer makes on its own.
pub const DEPLOYER_ACTOR: &str = "deployer";

pub struct Deployer {
    root: PathBuf,
    proposals: Arc<ProposalManager>,
    backups: BackupStore,
    locks: PathLockManager,
    smoke: Arc<dyn SmokeCheck>,
    budget: ExecutionBudget,
    grace: chrono::Duration,
}

impl Deployer {
    pub fn new(
        root: PathBuf,
        proposals: Arc<ProposalManager>,
        backups: BackupStore,
        smoke: Arc<dyn SmokeCheck>,
        budget: ExecutionBudget,
        grace: chrono::Duration,
    ) -> Self {
        Self {
            root,
            proposals,
            backups,
            locks: PathLockManager::new(),
            smoke,
            budget,
            grace,
        }
    }

    /// Shares a lock table with other deployers on the same tree.
    pub fn with_locks(mut self, locks: PathLockManager) -> Self {
        self.locks = locks;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    fn expect_state(proposal: &Proposal, expected: ProposalState, to: ProposalState) -> Result<()> {
        if proposal.state != expected {
            return Err(Error::InvalidTransition {
                proposal_id: proposal.id.clone(),
                from: proposal.state,
                to,
            });
        }
        Ok(())
    }

    /// Applies an Approved proposal.
    ///
    /// Waits for overlapping deployments to finish, up to the lock budget.
    /// On a failed write or smoke check the tree is restored and the
    /// proposal ends RolledBack; the error carries the failure output.
    pub async fn apply(&self, proposal_id: &str) -> Result<Proposal> {
        self.apply_cancellable(proposal_id, &CancelToken::new()).await
    }

    /// Applies an Approved proposal on behalf of a cancellable run.
    ///
    /// Cancellation is honoured until the smoke check passes: a cancel that
    /// lands before any write marks the proposal RolledBack untouched, and a
    /// cancel after the write restores the backup first. Once the smoke
    /// check passes the token is committed and the apply completes.
    pub async fn apply_cancellable(&self, proposal_id: &str, cancel: &CancelToken) -> Result<Proposal> {
        let proposal = self.proposals.get(proposal_id)?;
        Self::expect_state(&proposal, ProposalState::Approved, ProposalState::Applied)?;

        let paths = proposal.touched_paths();
        let _lease = tokio::select! {
            biased;
            reason = cancel.cancelled() => {
                return Err(self.withdraw(&proposal, &reason.to_string()));
            }
            lease = self.locks.acquire(&paths, self.budget.lock_wait, self.budget.lock_backoff()) => lease?,
        };

        // State may have moved while waiting for the lease
        let proposal = self.proposals.get(proposal_id)?;
        Self::expect_state(&proposal, ProposalState::Approved, ProposalState::Applied)?;
        if let Some(reason) = cancel.reason() {
            return Err(self.withdraw(&proposal, &reason.to_string()));
        }

        let backup = {
            let backups = self.backups.clone();
            let root = self.root.clone();
            let id = proposal.id.clone();
            let paths = paths.clone();
            tokio::task::spawn_blocking(move || backups.capture(&id, &root, &paths))
                .await
                .map_err(|e| Error::Store(format!("backup task failed: {}", e)))??
        };
        self.proposals.record_backup(proposal_id, &backup.id)?;

        tracing::info!(proposal_id = %proposal_id, backup_id = %backup.id, paths = paths.len(), "applying proposal");

        let written = {
            let root = self.root.clone();
            let operations = proposal.operations.clone();
            tokio::task::spawn_blocking(move || apply_operations(&root, &operations))
                .await
                .map_err(|e| Error::Store(format!("apply task failed: {}", e)))?
        };
        if let Err(reason) = written {
            return Err(self
                .roll_back(&proposal, &backup, DEPLOYER_ACTOR, &format!("apply failed: {}", reason))
                .await);
        }

        let smoke = tokio::select! {
            biased;
            reason = cancel.cancelled() => {
                self.roll_back(&proposal, &backup, DEPLOYER_ACTOR, &format!("cancelled during apply: {}", reason))
                    .await;
                return Err(Error::Cancelled(reason.to_string()));
            }
            smoke = tokio::time::timeout(
                self.budget.smoke_timeout,
                self.smoke.check(&self.root, &proposal.operations),
            ) => smoke.unwrap_or_else(|_| {
                SmokeResult::Failed(format!(
                    "smoke check timed out after {}s",
                    self.budget.smoke_timeout.as_secs()
                ))
            }),
        };

        if let SmokeResult::Failed(output) = smoke {
            return Err(self
                .roll_back(
                    &proposal,
                    &backup,
                    DEPLOYER_ACTOR,
                    &format!("smoke check failed: {}", output),
                )
                .await);
        }

        if let Err(reason) = cancel.commit(proposal_id) {
            self.roll_back(&proposal, &backup, DEPLOYER_ACTOR, &format!("cancelled during apply: {}", reason))
                .await;
            return Err(Error::Cancelled(reason.to_string()));
        }

        match self.proposals.mark_applied(
            proposal_id,
            DEPLOYER_ACTOR,
            &format!("applied; {} smoke check passed", self.smoke.name()),
        ) {
            Ok(applied) => {
                tracing::info!(proposal_id = %proposal_id, "proposal applied");
                Ok(applied)
            }
            Err(e) => Err(self
                .roll_back(&proposal, &backup, DEPLOYER_ACTOR, &format!("failed to record apply: {}", e))
                .await),
        }
    }

    /// Retires an Approved proposal whose run was cancelled before any write.
    fn withdraw(&self, proposal: &Proposal, reason: &str) -> Error {
        tracing::info!(proposal_id = %proposal.id, reason = %reason, "apply cancelled before writing");
        if let Err(e) = self.proposals.mark_rolled_back(
            &proposal.id,
            DEPLOYER_ACTOR,
            &format!("cancelled before apply: {}", reason),
        ) {
            tracing::error!(proposal_id = %proposal.id, error = %e, "failed to record cancelled apply");
        }
        Error::Cancelled(reason.to_string())
    }

    /// Restores `backup`, verifies the tree and marks the proposal
    /// RolledBack. Returns the error to surface to the caller.
    async fn roll_back(&self, proposal: &Proposal, backup: &Backup, actor: &str, reason: &str) -> Error {
        tracing::warn!(proposal_id = %proposal.id, reason = %reason, "rolling back proposal");

        let restored = {
            let backups = self.backups.clone();
            let root = self.root.clone();
            let backup = backup.clone();
            tokio::task::spawn_blocking(move || {
                backups.restore(&backup, &root)?;
                backups.verify(&backup, &root)
            })
            .await
            .map_err(|e| Error::Store(format!("restore task failed: {}", e)))
            .and_then(|r| r)
        };

        let mut audit_reason = reason.to_string();
        match restored {
            Ok(mismatched) if mismatched.is_empty() => {}
            Ok(mismatched) => {
                tracing::error!(proposal_id = %proposal.id, paths = ?mismatched, "tree differs from backup after restore");
                audit_reason.push_str(&format!("; restore left differences in {}", mismatched.join(", ")));
            }
            Err(e) => {
                tracing::error!(proposal_id = %proposal.id, error = %e, "restore failed");
                audit_reason.push_str(&format!("; restore failed: {}", e));
            }
        }

        if let Err(e) = self.proposals.mark_rolled_back(&proposal.id, actor, &audit_reason) {
            tracing::error!(proposal_id = %proposal.id, error = %e, "failed to record rollback");
        }
        Error::Deployment {
            proposal_id: proposal.id.clone(),
            reason: audit_reason,
        }
    }

    /// Manually rolls back an Applied proposal within the grace period.
    pub async fn rollback(&self, proposal_id: &str, actor: &str, reason: &str) -> Result<Proposal> {
        if actor.trim().is_empty() {
            return Err(Error::Config("rollback requires an actor".to_string()));
        }
        let proposal = self.proposals.get(proposal_id)?;
        Self::expect_state(&proposal, ProposalState::Applied, ProposalState::RolledBack)?;

        let applied_at = proposal.applied_at.unwrap_or(proposal.updated_at);
        if Utc::now() - applied_at > self.grace {
            return Err(Error::GracePeriodExpired(proposal_id.to_string()));
        }
        let backup_id = proposal
            .backup_id
            .clone()
            .ok_or_else(|| Error::not_found("backup for proposal", proposal_id))?;
        let backup = match self.backups.load(&backup_id) {
            Ok(backup) => backup,
            Err(Error::NotFound { .. }) => return Err(Error::GracePeriodExpired(proposal_id.to_string())),
            Err(e) => return Err(e),
        };

        let _lease = self
            .locks
            .acquire(&proposal.touched_paths(), self.budget.lock_wait, self.budget.lock_backoff())
            .await?;

        let root = self.root.clone();
        let backups = self.backups.clone();
        let restore_backup = backup.clone();
        let mismatched = tokio::task::spawn_blocking(move || {
            backups.restore(&restore_backup, &root)?;
            backups.verify(&restore_backup, &root)
        })
        .await
        .map_err(|e| Error::Store(format!("restore task failed: {}", e)))??;

        if !mismatched.is_empty() {
            return Err(Error::Deployment {
                proposal_id: proposal_id.to_string(),
                reason: format!("restore left differences in {}", mismatched.join(", ")),
            });
        }

        let rolled_back = self.proposals.mark_rolled_back(proposal_id, actor, reason)?;
        tracing::info!(proposal_id = %proposal_id, actor = %actor, "proposal rolled back");
        Ok(rolled_back)
    }

    /// Deletes backups that can no longer be used. Returns how many.
    ///
    /// A backup is kept while its proposal could still be applied or rolled
    /// back; otherwise it goes once it is older than the grace period.
    pub fn prune_backups(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for backup in self.backups.list()? {
            let expired_since = match self.proposals.get(&backup.proposal_id) {
                Ok(p) if p.state == ProposalState::Approved => None,
                Ok(p) if p.state == ProposalState::Applied => p.applied_at,
                Ok(_) => Some(backup.created_at),
                Err(Error::NotFound { .. }) => Some(backup.created_at),
                Err(e) => return Err(e),
            };
            if expired_since.is_some_and(|t| now - t > self.grace) {
                self.backups.remove(&backup.id)?;
                tracing::info!(backup_id = %backup.id, proposal_id = %backup.proposal_id, "pruned backup");
                removed += 1;
            }
        }
        Ok(removed)
    }
}
