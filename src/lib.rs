//! Remediation Drive - sandboxed generate, validate, approve, deploy pipeline
//!
//! This library turns a free-text defect report into a tested, human-approved
//! change to a codebase. Several candidate fixes are generated in parallel,
//! statically checked, run against the test suite in isolated sandboxes and
//! scored; the best one becomes a proposal that a person approves before it
//! is applied to the live tree with a backup and a rollback path.

pub mod budget;
pub mod cancel;
pub mod candidate;
pub mod config;
pub mod context;
pub mod deploy;
pub mod diff;
pub mod error;
pub mod events;
pub mod failure;
pub mod generator;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod proposal;
pub mod request;
pub mod sandbox;
pub mod scorer;
pub mod snapshot;
pub mod syntax;
pub mod test_runner;

pub use budget::{Backoff, ExecutionBudget};
pub use cancel::{CancelReason, CancelToken};
pub use candidate::{CandidateFix, FileChange, FileOpKind, FileOperation, RiskTier};
pub use config::{ConfigReport, Isolation, PipelineConfig, Validate};
pub use context::{CodebaseSearch, ContextBuilder, Excerpt, GenerationContext, LocalSearch};
pub use deploy::{BackupStore, Deployer, PathLockManager, SmokeCheck, SmokeResult};
pub use error::{Error, GenerationError, Result};
pub use events::{EventSink, PipelineEvent};
pub use generator::{CandidateGenerator, CommandGenerator, GenerationReply, GenerationRequest, TextGenerator};
pub use manifest::DependencyManifest;
pub use pipeline::{PipelineOutcome, PipelineParts, PipelineReport, RemediationPipeline};
pub use preflight::{PreflightValidator, ValidationResult, Verdict};
pub use proposal::{
    AuditEntry, FileProposalStore, MemoryProposalStore, Proposal, ProposalManager, ProposalQuery,
    ProposalState, ProposalStore,
};
pub use request::{RemediationRequest, RequestStatus, Severity};
pub use sandbox::{CopySandbox, Sandbox, SandboxManager, SandboxOutcome, SandboxProvider, WorktreeSandbox};
pub use scorer::{CandidateScorer, Score};
pub use snapshot::CodebaseSnapshot;
pub use test_runner::{CommandTestRunner, TestResult, TestRunner};
