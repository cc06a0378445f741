//! Post-apply smoke checks against the live tree.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;

use crate::candidate::{FileOpKind, FileOperation};
use crate::process;
use crate::syntax::{check_syntax, SyntaxCheck};

const MAX_SMOKE_OUTPUT: usize = 1800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeResult {
    Passed,
    /// Failure with the output shown to the approver.
    Failed(String),
}

/// A fast verification that the live tree still builds/imports.
#[async_trait]
pub trait SmokeCheck: Send + Sync {
    async fn check(&self, root: &Path, operations: &[FileOperation]) -> SmokeResult;

    fn name(&self) -> &str;
}

fn truncate_output(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        let snippet: String = trimmed.chars().take(max).collect();
        format!("{}\n… (truncated)", snippet)
    }
}

/// Runs a configured command in the repository root.
#[derive(Debug, Clone)]
pub struct CommandSmokeCheck {
    program: String,
    args: Vec<String>,
}

impl CommandSmokeCheck {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `None` for an empty argv.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl SmokeCheck for CommandSmokeCheck {
    async fn check(&self, root: &Path, _operations: &[FileOperation]) -> SmokeResult {
        let mut cmd = process::command(&self.program);
        cmd.args(&self.args)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = match process::spawn(&mut cmd) {
            Ok(child) => child.wait_with_output().await,
            Err(e) => Err(e),
        };

        match output {
            Ok(out) => {
                if out.status.success() {
                    return SmokeResult::Passed;
                }
                let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
                if !out.stderr.is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str(&String::from_utf8_lossy(&out.stderr));
                }
                SmokeResult::Failed(format!(
                    "{} exited with {:?}: {}",
                    self.program,
                    out.status.code(),
                    truncate_output(&combined, MAX_SMOKE_OUTPUT)
                ))
            }
            Err(e) => SmokeResult::Failed(format!("failed to run {}: {}", self.program, e)),
        }
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Re-parses every touched file and confirms deletions took effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntaxSmokeCheck;

#[async_trait]
impl SmokeCheck for SyntaxSmokeCheck {
    async fn check(&self, root: &Path, operations: &[FileOperation]) -> SmokeResult {
        let root: PathBuf = root.to_path_buf();
        let operations = operations.to_vec();
        let checked = tokio::task::spawn_blocking(move || {
            let mut problems = Vec::new();
            for op in &operations {
                let target = root.join(&op.path);
                if op.kind == FileOpKind::Delete {
                    // A later create on the same path wins
                    let recreated = operations
                        .iter()
                        .any(|o| o.path == op.path && o.kind != FileOpKind::Delete);
                    if !recreated && target.exists() {
                        problems.push(format!("{}: still exists after delete", op.path));
                    }
                    continue;
                }
                match std::fs::read_to_string(&target) {
                    Ok(content) => {
                        if let SyntaxCheck::Invalid(reason) = check_syntax(&op.path, &content) {
                            problems.push(format!("{}: {}", op.path, reason));
                        }
                    }
                    Err(e) => problems.push(format!("{}: {}", op.path, e)),
                }
            }
            problems
        })
        .await;

        match checked {
            Ok(problems) if problems.is_empty() => SmokeResult::Passed,
            Ok(problems) => SmokeResult::Failed(truncate_output(&problems.join("\n"), MAX_SMOKE_OUTPUT)),
            Err(e) => SmokeResult::Failed(format!("syntax check task failed: {}", e)),
        }
    }

    fn name(&self) -> &str {
        "syntax"
    }
}
