//! Cancellation tokens for in-flight requests.
//!
//! A token is open until it is either cancelled or committed. Once a fix has
//! been written to the live tree and accepted, the run commits the token to
//! that proposal and later cancellations are refused.

use std::sync::Arc;

use tokio::sync::watch;

/// Why a request stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Someone asked for the request to stop.
    Requested(String),
    /// The overall request budget ran out.
    TimedOut,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Requested(reason) => write!(f, "{}", reason),
            CancelReason::TimedOut => write!(f, "request timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Open,
    Cancelled(CancelReason),
    /// The run applied this proposal and can no longer be cancelled.
    Committed(String),
}

/// Clonable cancellation flag. The first reason recorded wins.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Slot>>,
    rx: watch::Receiver<Slot>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(Slot::Open);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Cancels the token. Returns false if it was already cancelled or
    /// committed.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if *current != Slot::Open {
                return false;
            }
            *current = Slot::Cancelled(reason);
            true
        })
    }

    /// Marks the run as past the point of no return for `proposal_id`.
    ///
    /// Fails with the recorded reason when the token was cancelled first.
    pub fn commit(&self, proposal_id: &str) -> Result<(), CancelReason> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|current| match current {
            Slot::Open => {
                *current = Slot::Committed(proposal_id.to_string());
                true
            }
            Slot::Cancelled(reason) => {
                outcome = Err(reason.clone());
                false
            }
            Slot::Committed(_) => false,
        });
        outcome
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.rx.borrow(), Slot::Cancelled(_))
    }

    /// Returns the reason if the token has been cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        match &*self.rx.borrow() {
            Slot::Cancelled(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// The proposal this run committed to, if any.
    pub fn committed_to(&self) -> Option<String> {
        match &*self.rx.borrow() {
            Slot::Committed(id) => Some(id.clone()),
            _ => None,
        }
    }

    /// Resolves once the token is cancelled. Never resolves after a commit.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        loop {
            if let Slot::Cancelled(reason) = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                // Sender is owned by every clone, so this only happens at teardown.
                std::future::pending::<()>().await;
            }
        }
    }
}
