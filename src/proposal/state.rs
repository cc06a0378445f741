//! Proposal lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a proposal is in its lifecycle.
///
/// ```text
/// Draft -> SandboxValidated -> AwaitingApproval -> Approved -> Applied
///                                   |                 |          |
///                                   v                 v          v
///                                Rejected         RolledBack  RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Draft,
    SandboxValidated,
    AwaitingApproval,
    Approved,
    Applied,
    Rejected,
    RolledBack,
}

impl ProposalState {
    pub const ALL: [ProposalState; 7] = [
        ProposalState::Draft,
        ProposalState::SandboxValidated,
        ProposalState::AwaitingApproval,
        ProposalState::Approved,
        ProposalState::Applied,
        ProposalState::Rejected,
        ProposalState::RolledBack,
    ];

    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition(self, to: ProposalState) -> bool {
        use ProposalState::*;
        matches!(
            (self, to),
            (Draft, SandboxValidated)
                | (SandboxValidated, AwaitingApproval)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (Approved, Applied)
                | (Approved, RolledBack)
                | (Applied, RolledBack)
        )
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProposalState::Rejected | ProposalState::RolledBack)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProposalState::Draft => "draft",
            ProposalState::SandboxValidated => "sandbox_validated",
            ProposalState::AwaitingApproval => "awaiting_approval",
            ProposalState::Approved => "approved",
            ProposalState::Applied => "applied",
            ProposalState::Rejected => "rejected",
            ProposalState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ProposalState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("unknown proposal state: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_allowed() {
        use ProposalState::*;
        let path = [Draft, SandboxValidated, AwaitingApproval, Approved, Applied, RolledBack];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ProposalState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ProposalState::ALL {
                assert!(!from.can_transition(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn approval_cannot_be_skipped() {
        assert!(!ProposalState::SandboxValidated.can_transition(ProposalState::Approved));
        assert!(!ProposalState::AwaitingApproval.can_transition(ProposalState::Applied));
        assert!(!ProposalState::Draft.can_transition(ProposalState::AwaitingApproval));
    }

    #[test]
    fn parses_display_names() {
        for state in ProposalState::ALL {
            assert_eq!(state.to_string().parse::<ProposalState>().unwrap(), state);
        }
        assert_eq!("rolled-back".parse::<ProposalState>().unwrap(), ProposalState::RolledBack);
        assert!("merged".parse::<ProposalState>().is_err());
    }
}
