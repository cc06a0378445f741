//! Static, execution-free validation of candidate change-sets.
//!
//! Checks run in a fixed order and stop at the first check that fails:
//!
//! 1. path validity
//! 2. syntactic validity
//! 3. reference resolvability
//! 4. forbidden-pattern scan
//!
//! Validation only reads the [`CodebaseSnapshot`]; it never touches the live
//! tree or a sandbox, so validating the same candidate against the same
//! snapshot always yields the same result.

mod async_patterns;
mod patterns;
mod references;

pub use async_patterns::async_warnings;
pub use patterns::{default_forbidden_patterns, ForbiddenPattern};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::candidate::{unsafe_path_reason, CandidateFix, FileOpKind};
use crate::config::PreflightConfig;
use crate::error::Result;
use crate::snapshot::CodebaseSnapshot;
use crate::syntax::{check_syntax, Grammar, SyntaxCheck};

use patterns::PatternSet;
use references::Resolver;

/// The individual preflight checks, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    PathValidity,
    Syntax,
    References,
    ForbiddenPattern,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckKind::PathValidity => "path validity",
            CheckKind::Syntax => "syntax",
            CheckKind::References => "reference resolution",
            CheckKind::ForbiddenPattern => "forbidden pattern",
        };
        write!(f, "{}", s)
    }
}

/// A specific problem found by a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub check: CheckKind,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail { check: CheckKind, reason: String },
}

/// Outcome of validating one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub candidate_id: String,
    pub verdict: Verdict,
    /// Findings of the failing check; empty on pass.
    pub findings: Vec<Finding>,
    /// Non-fatal notes, such as files no grammar covers.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_pass(&self) -> bool {
        matches!(self.verdict, Verdict::Pass)
    }

    /// Reason text for a failed result.
    pub fn failure_reason(&self) -> Option<String> {
        match &self.verdict {
            Verdict::Pass => None,
            Verdict::Fail { check, reason } => Some(format!("{} check failed: {}", check, reason)),
        }
    }
}

/// Runs the preflight checks.
#[derive(Debug, Clone)]
pub struct PreflightValidator {
    patterns: PatternSet,
    max_new_directory_depth: usize,
}

impl PreflightValidator {
    /// Builds a validator, compiling the configured deny-list.
    pub fn new(config: &PreflightConfig) -> Result<Self> {
        Ok(Self {
            patterns: PatternSet::compile(&config.forbidden_patterns)?,
            max_new_directory_depth: config.max_new_directory_depth,
        })
    }

    /// Validates `candidate` against `snapshot`.
    pub fn validate(&self, candidate: &CandidateFix, snapshot: &CodebaseSnapshot) -> ValidationResult {
        let mut warnings = Vec::new();

        let outcome = self
            .check_paths(candidate, snapshot)
            .and_then(|()| self.resolve_contents(candidate, snapshot, &mut warnings))
            .and_then(|contents| {
                self.check_references(candidate, snapshot, &contents)?;
                self.check_patterns(&contents)?;
                Ok(contents)
            });

        let (verdict, findings) = match outcome {
            Ok(contents) => {
                for (path, text) in &contents {
                    if let Some(text) = text {
                        warnings.extend(async_warnings(path, text));
                    }
                }
                (Verdict::Pass, Vec::new())
            }
            Err(findings) => {
                let check = findings
                    .first()
                    .map(|f| f.check)
                    .unwrap_or(CheckKind::PathValidity);
                let reason = findings
                    .iter()
                    .map(|f| format!("{}: {}", f.path, f.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                (Verdict::Fail { check, reason }, findings)
            }
        };

        match &verdict {
            Verdict::Pass => tracing::debug!(
                candidate_id = %candidate.id,
                warnings = warnings.len(),
                "candidate passed preflight"
            ),
            Verdict::Fail { check, reason } => tracing::info!(
                candidate_id = %candidate.id,
                check = %check,
                reason = %reason,
                "candidate failed preflight"
            ),
        }

        ValidationResult {
            candidate_id: candidate.id.clone(),
            verdict,
            findings,
            warnings,
        }
    }

    fn check_paths(
        &self,
        candidate: &CandidateFix,
        snapshot: &CodebaseSnapshot,
    ) -> std::result::Result<(), Vec<Finding>> {
        let mut findings = Vec::new();
        let mut fail = |path: &str, message: String| {
            findings.push(Finding {
                check: CheckKind::PathValidity,
                path: path.to_string(),
                message,
            })
        };

        // Tracks each path's last operation and whether it exists afterwards.
        let mut touched: HashMap<&str, FileOpKind> = HashMap::new();
        let mut created_dirs: BTreeSet<String> = BTreeSet::new();

        for op in &candidate.operations {
            let path = op.path.as_str();

            if let Some(reason) = unsafe_path_reason(path) {
                fail(path, reason);
                continue;
            }

            let exists = match touched.get(path) {
                Some(FileOpKind::Delete) if op.kind == FileOpKind::Create => false,
                Some(_) => {
                    fail(path, "path appears in more than one operation".to_string());
                    continue;
                }
                None => snapshot.has_file(path),
            };
            touched.insert(path, op.kind);

            match op.kind {
                FileOpKind::Modify | FileOpKind::Delete if !exists => {
                    fail(path, format!("cannot {} a file that does not exist", op.kind));
                }
                FileOpKind::Create if exists => {
                    fail(path, "cannot create a file that already exists".to_string());
                }
                FileOpKind::Create => {
                    if snapshot.has_dir(path) {
                        fail(path, "a directory exists at this path".to_string());
                        continue;
                    }
                    let missing = missing_ancestors(path, snapshot, &created_dirs);
                    if missing.len() > self.max_new_directory_depth {
                        let parent = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
                        fail(path, format!("parent directory '{}' does not exist", parent));
                    } else {
                        created_dirs.extend(missing);
                    }
                }
                _ => {}
            }
        }

        if findings.is_empty() {
            Ok(())
        } else {
            Err(findings)
        }
    }

    /// Resolves final contents and checks their syntax.
    ///
    /// Returns the post-change content of every created or modified path.
    fn resolve_contents(
        &self,
        candidate: &CandidateFix,
        snapshot: &CodebaseSnapshot,
        warnings: &mut Vec<String>,
    ) -> std::result::Result<BTreeMap<String, Option<String>>, Vec<Finding>> {
        let mut findings = Vec::new();
        let mut contents: BTreeMap<String, Option<String>> = BTreeMap::new();

        for op in &candidate.operations {
            let current = match contents.get(&op.path) {
                Some(state) => state.clone(),
                None => snapshot.read(&op.path).map(|s| s.to_string()),
            };

            let resolved = match op.resolve(current.as_deref()) {
                Ok(resolved) => resolved,
                Err(message) => {
                    findings.push(Finding {
                        check: CheckKind::Syntax,
                        path: op.path.clone(),
                        message,
                    });
                    continue;
                }
            };

            if let Some(text) = &resolved {
                match check_syntax(&op.path, text) {
                    SyntaxCheck::Valid => {}
                    SyntaxCheck::Invalid(message) => findings.push(Finding {
                        check: CheckKind::Syntax,
                        path: op.path.clone(),
                        message,
                    }),
                    SyntaxCheck::Unchecked => {
                        warnings.push(format!("{}: no grammar for this file type, syntax not checked", op.path));
                    }
                }
            }
            contents.insert(op.path.clone(), resolved);
        }

        if findings.is_empty() {
            Ok(contents)
        } else {
            Err(findings)
        }
    }

    fn check_references(
        &self,
        candidate: &CandidateFix,
        snapshot: &CodebaseSnapshot,
        contents: &BTreeMap<String, Option<String>>,
    ) -> std::result::Result<(), Vec<Finding>> {
        let mut paths: BTreeSet<String> = snapshot.files().map(str::to_string).collect();
        for (path, state) in contents {
            match state {
                Some(_) => paths.insert(path.clone()),
                None => paths.remove(path),
            };
        }

        let resolver = Resolver::new(snapshot.manifest(), &paths);
        let mut findings = Vec::new();

        for op in &candidate.operations {
            let Some(Some(text)) = contents.get(&op.path) else {
                continue;
            };
            let Some(grammar) = Grammar::for_path(&op.path).filter(|g| g.is_source()) else {
                continue;
            };
            for missing in resolver.unresolved(&op.path, grammar, text) {
                findings.push(Finding {
                    check: CheckKind::References,
                    path: op.path.clone(),
                    message: format!(
                        "unresolved reference '{}' at line {}",
                        missing.name, missing.line
                    ),
                });
            }
        }

        if findings.is_empty() {
            Ok(())
        } else {
            Err(findings)
        }
    }

    fn check_patterns(
        &self,
        contents: &BTreeMap<String, Option<String>>,
    ) -> std::result::Result<(), Vec<Finding>> {
        let findings: Vec<Finding> = contents
            .iter()
            .filter_map(|(path, state)| state.as_ref().map(|text| (path, text)))
            .flat_map(|(path, text)| {
                self.patterns.scan(text).into_iter().map(move |hit| Finding {
                    check: CheckKind::ForbiddenPattern,
                    path: path.clone(),
                    message: format!("matches forbidden pattern '{}' at line {}", hit.name, hit.line),
                })
            })
            .collect();

        if findings.is_empty() {
            Ok(())
        } else {
            Err(findings)
        }
    }
}

/// Ancestor directories of `path` that exist neither in the snapshot nor
/// among directories introduced earlier in the operation list.
fn missing_ancestors(
    path: &str,
    snapshot: &CodebaseSnapshot,
    created: &BTreeSet<String>,
) -> Vec<String> {
    let mut missing = Vec::new();
    let mut current = path;
    while let Some((parent, _)) = current.rsplit_once('/') {
        if snapshot.has_dir(parent) || created.contains(parent) {
            break;
        }
        missing.push(parent.to_string());
        current = parent;
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{FileOperation, RiskTier};
    use crate::manifest::DependencyManifest;

    fn snapshot() -> CodebaseSnapshot {
        let mut manifest = DependencyManifest::default();
        manifest.extend("requirements.txt", ["requests".to_string()]);
        CodebaseSnapshot::from_files(
            [
                (
                    "shop/pricing.py",
                    "def discount(total, pct):\n    return total - total * pct / 100\n",
                ),
                ("shop/__init__.py", ""),
                ("README.md", "# shop\n"),
            ],
            manifest,
        )
    }

    fn validator() -> PreflightValidator {
        PreflightValidator::new(&PreflightConfig::default()).unwrap()
    }

    fn candidate(operations: Vec<FileOperation>) -> CandidateFix {
        CandidateFix::new("req-1", "fix", "fix it", RiskTier::Low, operations)
    }

    fn failed_check(result: &ValidationResult) -> Option<CheckKind> {
        match &result.verdict {
            Verdict::Fail { check, .. } => Some(*check),
            Verdict::Pass => None,
        }
    }

    #[test]
    fn valid_modification_passes() {
        let fix = candidate(vec![FileOperation::modify(
            "shop/pricing.py",
            "import math\n\ndef discount(total, pct):\n    return total - math.floor(total * pct) / 100\n",
        )]);
        let result = validator().validate(&fix, &snapshot());
        assert!(result.is_pass(), "{:?}", result);
        assert!(result.findings.is_empty());
    }

    #[test]
    fn missing_parent_directory_fails_path_check() {
        let fix = candidate(vec![FileOperation::create("shop/billing/tax.py", "x = 1\n")]);
        let result = validator().validate(&fix, &snapshot());
        assert_eq!(failed_check(&result), Some(CheckKind::PathValidity));
        assert!(result.findings[0].message.contains("shop/billing"));
    }

    #[test]
    fn new_directory_allowed_within_configured_depth() {
        let config = PreflightConfig {
            max_new_directory_depth: 1,
            ..PreflightConfig::default()
        };
        let validator = PreflightValidator::new(&config).unwrap();
        let fix = candidate(vec![
            FileOperation::create("shop/billing/__init__.py", ""),
            FileOperation::create("shop/billing/tax.py", "RATE = 0.2\n"),
        ]);
        assert!(validator.validate(&fix, &snapshot()).is_pass());

        let deep = candidate(vec![FileOperation::create("shop/a/b/c.py", "")]);
        assert!(!validator.validate(&deep, &snapshot()).is_pass());
    }

    #[test]
    fn path_rules_reject_unsafe_and_inconsistent_operations() {
        let cases = vec![
            FileOperation::modify("/etc/hosts", "x"),
            FileOperation::modify("../other/file.py", "x"),
            FileOperation::modify("shop/missing.py", "x = 1\n"),
            FileOperation::delete("shop/missing.py"),
            FileOperation::create("shop/pricing.py", "x = 1\n"),
        ];
        for op in cases {
            let result = validator().validate(&candidate(vec![op.clone()]), &snapshot());
            assert_eq!(failed_check(&result), Some(CheckKind::PathValidity), "{:?}", op);
        }

        let duplicate = candidate(vec![
            FileOperation::modify("shop/pricing.py", "a = 1\n"),
            FileOperation::modify("shop/pricing.py", "a = 2\n"),
        ]);
        assert_eq!(
            failed_check(&validator().validate(&duplicate, &snapshot())),
            Some(CheckKind::PathValidity)
        );
    }

    #[test]
    fn delete_then_create_same_path_is_allowed() {
        let fix = candidate(vec![
            FileOperation::delete("shop/pricing.py"),
            FileOperation::create("shop/pricing.py", "RATE = 1\n"),
        ]);
        assert!(validator().validate(&fix, &snapshot()).is_pass());
    }

    #[test]
    fn unparsable_content_fails_syntax_check() {
        let fix = candidate(vec![FileOperation::modify(
            "shop/pricing.py",
            "def discount(total pct):\n    return\n",
        )]);
        let result = validator().validate(&fix, &snapshot());
        assert_eq!(failed_check(&result), Some(CheckKind::Syntax));
    }

    #[test]
    fn non_applying_diff_fails_syntax_check() {
        let fix = candidate(vec![FileOperation::modify_with_diff(
            "shop/pricing.py",
            "@@ -1,1 +1,1 @@\n-def nothing_like_this():\n+def x():\n",
        )]);
        let result = validator().validate(&fix, &snapshot());
        assert_eq!(failed_check(&result), Some(CheckKind::Syntax));
        assert!(result.failure_reason().unwrap().contains("does not apply"));
    }

    #[test]
    fn unresolved_import_fails_reference_check() {
        let fix = candidate(vec![FileOperation::modify(
            "shop/pricing.py",
            "import requests\nimport flask\n\ndef discount(t, p):\n    return t\n",
        )]);
        let result = validator().validate(&fix, &snapshot());
        assert_eq!(failed_check(&result), Some(CheckKind::References));
        assert!(result.findings[0].message.contains("flask"));
    }

    #[test]
    fn forbidden_pattern_fails_last_check() {
        let fix = candidate(vec![FileOperation::modify(
            "shop/pricing.py",
            "import os\n\ndef discount(t, p):\n    os.system('rm -rf /')\n    return t\n",
        )]);
        let result = validator().validate(&fix, &snapshot());
        assert_eq!(failed_check(&result), Some(CheckKind::ForbiddenPattern));
    }

    #[test]
    fn checks_short_circuit_in_order() {
        // Both a path problem and a syntax problem; only the path check reports.
        let fix = candidate(vec![
            FileOperation::create("nowhere/x.py", "def (:\n"),
            FileOperation::modify("shop/pricing.py", "def (:\n"),
        ]);
        let result = validator().validate(&fix, &snapshot());
        assert_eq!(failed_check(&result), Some(CheckKind::PathValidity));
        assert!(result.findings.iter().all(|f| f.check == CheckKind::PathValidity));
    }

    #[test]
    fn files_without_grammar_produce_warnings() {
        let fix = candidate(vec![FileOperation::modify("README.md", "# shop\n\nFixed.\n")]);
        let result = validator().validate(&fix, &snapshot());
        assert!(result.is_pass());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn async_misuse_is_a_warning_not_a_failure() {
        let fix = candidate(vec![FileOperation::modify(
            "shop/pricing.py",
            "async def discount(total, pct):\n    return total - total * pct / 100\n",
        )]);
        let result = validator().validate(&fix, &snapshot());
        assert!(result.is_pass(), "{:?}", result);
        assert_eq!(
            result.warnings,
            vec!["shop/pricing.py:1: async function 'discount' never awaits; consider making it synchronous"]
        );
    }

    #[test]
    fn validation_is_idempotent() {
        let snap = snapshot();
        let v = validator();
        let fix = candidate(vec![
            FileOperation::modify("shop/pricing.py", "import flask\n"),
            FileOperation::create("shop/new.py", "x = 1\n"),
        ]);
        let first = v.validate(&fix, &snap);
        for _ in 0..3 {
            assert_eq!(v.validate(&fix, &snap), first);
        }
    }
}
