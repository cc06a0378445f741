//! Sandbox provider trait and types.

use std::path::PathBuf;

use crate::error::Result;

/// Represents an active sandbox environment.
pub trait Sandbox: Send + Sync {
    /// Unique sandbox identifier.
    fn id(&self) -> &str;

    /// Returns the working directory path of the sandbox.
    fn path(&self) -> &PathBuf;

    /// Cleans up the sandbox, removing all resources. Safe to call twice.
    fn cleanup(&mut self) -> Result<()>;
}

/// Provider for creating sandboxed environments.
pub trait SandboxProvider: Send + Sync {
    /// The type of sandbox this provider creates.
    type Sandbox: Sandbox + 'static;

    /// Creates a fresh sandbox holding a private copy of the repository.
    ///
    /// `label` ends up in the sandbox directory name for debugging.
    fn create(&self, label: &str) -> Result<Self::Sandbox>;

    /// Returns the path to the repository root.
    fn repo_path(&self) -> &PathBuf;

    /// Short provider name for logs.
    fn name(&self) -> &str;
}

/// Sanitises a label for use in a directory name.
pub(crate) fn dir_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(40)
        .collect();
    if cleaned.is_empty() {
        "sandbox".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_label_replaces_unsafe_characters() {
        assert_eq!(dir_label("cand/1 x"), "cand-1-x");
        assert_eq!(dir_label(""), "sandbox");
        assert_eq!(dir_label(&"a".repeat(100)).len(), 40);
    }
}
