//! Fire-and-forget lifecycle notifications.
//!
//! Sinks must never block or fail the pipeline; a sink that cannot accept an
//! event drops it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::proposal::ProposalState;
use crate::request::RequestStatus;

/// A pipeline lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RequestReceived {
        request_id: String,
    },
    CandidateGenerated {
        request_id: String,
        candidate_id: String,
        slot: usize,
    },
    GenerationFailed {
        request_id: String,
        slot: usize,
        reason: String,
    },
    ValidationCompleted {
        request_id: String,
        candidate_id: String,
        passed: bool,
        reason: Option<String>,
    },
    SandboxStarted {
        request_id: String,
        candidate_id: String,
        session_id: String,
    },
    SandboxFinished {
        request_id: String,
        candidate_id: String,
        session_id: String,
        outcome: String,
        passed: u32,
        total: u32,
    },
    ProposalStateChanged {
        proposal_id: String,
        from: Option<ProposalState>,
        to: ProposalState,
        actor: String,
    },
    /// Every candidate failed; another is being generated from the analysis.
    RefixStarted {
        request_id: String,
        attempt: u32,
        root_cause: String,
    },
    /// The auto-apply policy approved a proposal but could not apply it.
    /// A deferred proposal stays approved for a later `apply`.
    AutoApplyFailed {
        request_id: String,
        proposal_id: String,
        reason: String,
        deferred: bool,
    },
    RequestFinished {
        request_id: String,
        status: RequestStatus,
        outcome: String,
    },
}

/// Receives pipeline events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::GenerationFailed { request_id, slot, reason } => {
                tracing::warn!(request_id = %request_id, slot, reason = %reason, "generation slot failed");
            }
            PipelineEvent::ProposalStateChanged { proposal_id, from, to, actor } => {
                tracing::info!(
                    proposal_id = %proposal_id,
                    from = ?from,
                    to = %to,
                    actor = %actor,
                    "proposal state changed"
                );
            }
            PipelineEvent::AutoApplyFailed {
                request_id,
                proposal_id,
                reason,
                deferred,
            } => {
                tracing::warn!(
                    request_id = %request_id,
                    proposal_id = %proposal_id,
                    deferred,
                    reason = %reason,
                    "auto-apply failed"
                );
            }
            other => tracing::info!(event = ?other, "pipeline event"),
        }
    }
}

/// Forwards events to a bounded channel, dropping them when it is full or
/// closed.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }

    /// Creates a sink and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: PipelineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(error = %e, "dropping pipeline event");
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: PipelineEvent) {}
}
