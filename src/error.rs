//! Error types for the remediation pipeline.

use std::path::PathBuf;
use thiserror::Error;

use crate::proposal::ProposalState;

/// Failure of a single generation slot.
///
/// A slot that ends in one of these after its retry budget is spent is
/// dropped from the batch; it is never replaced by a placeholder candidate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The backend did not answer within the generation timeout, in ms.
    #[error("generation timed out after {0}ms")]
    Timeout(u64),

    /// Output did not match the candidate schema.
    #[error("malformed candidate output: {0}")]
    Malformed(String),

    /// The backend declined to produce a fix.
    #[error("generation refused: {0}")]
    Refusal(String),

    /// The backend itself failed (process error, transport error).
    #[error("generation backend failed: {0}")]
    Backend(String),
}

/// Top-level error type for remediation operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A generation slot failed.
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// A candidate failed preflight validation.
    #[error("candidate {candidate_id} failed validation: {reason}")]
    Validation { candidate_id: String, reason: String },

    /// Sandbox infrastructure failed (provisioning, applying, running).
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Failed to tear down a sandbox.
    #[error("failed to clean up sandbox at {path}: {reason}")]
    SandboxCleanup { path: PathBuf, reason: String },

    /// Applying a proposal to the live tree failed and was rolled back.
    #[error("deployment of proposal {proposal_id} failed: {reason}")]
    Deployment { proposal_id: String, reason: String },

    /// Another proposal holds a lock on an overlapping path set.
    #[error("paths are locked by another deployment: {}", .paths.join(", "))]
    LockConflict { paths: Vec<String> },

    /// A proposal state transition is not allowed.
    #[error("proposal {proposal_id} cannot move from {from} to {to}")]
    InvalidTransition {
        proposal_id: String,
        from: ProposalState,
        to: ProposalState,
    },

    /// Manual rollback requested after the backup grace period.
    #[error("rollback window for proposal {0} has expired")]
    GracePeriodExpired(String),

    /// An entity was not found.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The request was cancelled.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// An operation exceeded its time budget.
    #[error("{0} timed out")]
    Timeout(String),

    /// Proposal or backup persistence failed.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type alias for remediation operations.
pub type Result<T> = std::result::Result<T, Error>;
