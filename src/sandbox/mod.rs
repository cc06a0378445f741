//! Isolated execution environments for candidate test runs.
//!
//! This module provides the [`SandboxProvider`] trait, two implementations
//! ([`CopySandbox`] and [`WorktreeSandbox`]) and the [`SandboxManager`] that
//! runs a request's candidates through them under a bounded worker pool.

mod copy;
mod manager;
mod provider;
mod worktree;

pub use copy::{CopySandbox, CopySandboxInstance};
pub use manager::{isolated_env, SandboxManager, SandboxOutcome, SandboxRun, SandboxSession};
pub use provider::{Sandbox, SandboxProvider};
pub use worktree::{WorktreeSandbox, WorktreeSandboxInstance};
