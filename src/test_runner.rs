//! Test suite execution inside a sandbox.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};
use crate::process;

static CARGO_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed")
        .expect("CARGO_SUMMARY_RE regex should compile")
});

static PYTEST_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^=+ (.*\b(?:passed|failed|error|errors)\b.*) in [\d.]+s.*=+\s*$")
        .expect("PYTEST_SUMMARY_RE regex should compile")
});

static PYTEST_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (passed|failed|errors?)").expect("PYTEST_COUNT_RE regex should compile")
});

static JEST_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Tests:\s+(.*\d+ total)").expect("JEST_SUMMARY_RE regex should compile")
});

/// Passing and total test counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub total: u32,
}

impl TestCounts {
    pub fn new(passed: u32, total: u32) -> Self {
        Self { passed, total }
    }
}

/// Structured result of one sandbox test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub session_id: String,
    pub passed: u32,
    pub total: u32,
    pub duration: Duration,
    /// Raw test output, if any was captured.
    pub log_path: Option<PathBuf>,
}

impl TestResult {
    /// Result for a run that never produced counts (timeout, infra error).
    pub fn zero(session_id: impl Into<String>, duration: Duration, log_path: Option<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            passed: 0,
            total: 0,
            duration,
            log_path,
        }
    }

    pub fn pass_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.passed) / f64::from(self.total)
        }
    }
}

/// One invocation of the test suite.
#[derive(Debug, Clone)]
pub struct TestInvocation {
    pub session_id: String,
    /// Sandbox working directory.
    pub dir: PathBuf,
    /// Environment for the test process.
    pub env: HashMap<String, String>,
    /// Where to write raw output.
    pub log_path: PathBuf,
}

/// Runs a project's test suite.
///
/// A failing suite is not an error; `Err` means the suite could not be run.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, invocation: &TestInvocation) -> Result<TestCounts>;

    fn name(&self) -> &str;
}

/// Runs a configured command and parses its summary.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    program: String,
    args: Vec<String>,
}

impl CommandTestRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds a runner from an argv list.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("test command is empty".to_string()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, invocation: &TestInvocation) -> Result<TestCounts> {
        tracing::info!(
            session_id = %invocation.session_id,
            program = %self.program,
            dir = ?invocation.dir,
            "running test suite"
        );

        let mut cmd = process::command(&self.program);
        cmd.args(&self.args)
            .current_dir(&invocation.dir)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = process::spawn(&mut cmd)
            .map_err(|e| Error::Sandbox(format!("failed to spawn {}: {}", self.program, e)))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Sandbox(format!("failed to wait for {}: {}", self.program, e)))?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if let Some(parent) = invocation.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&invocation.log_path, &log).await?;

        let counts = parse_test_counts(&log).unwrap_or_else(|| {
            if output.status.success() {
                TestCounts::new(1, 1)
            } else {
                TestCounts::new(0, 1)
            }
        });

        tracing::info!(
            session_id = %invocation.session_id,
            passed = counts.passed,
            total = counts.total,
            exit = ?output.status.code(),
            "test suite finished"
        );

        Ok(counts)
    }

    fn name(&self) -> &str {
        &self.program
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LintStatus {
    Passed,
    Failed,
    /// The linter could not run or did not finish in time.
    Skipped,
}

/// Outcome of the optional lint step run after a completed test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintResult {
    pub status: LintStatus,
    /// Non-empty output lines of a failing lint run.
    pub findings: u32,
    pub log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LintResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: LintStatus::Skipped,
            findings: 0,
            log_path: None,
            reason: Some(reason.into()),
        }
    }
}

/// Runs a configured linter in the sandbox. Exit status decides pass or
/// fail; each non-empty output line of a failing run counts as a finding.
#[derive(Debug, Clone)]
pub struct CommandLinter {
    program: String,
    args: Vec<String>,
}

impl CommandLinter {
    /// `None` for an empty argv, which disables linting.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn name(&self) -> &str {
        &self.program
    }

    /// Lints `invocation.dir`, writing output next to the test log.
    pub async fn run(&self, invocation: &TestInvocation) -> LintResult {
        let mut cmd = process::command(&self.program);
        cmd.args(&self.args)
            .current_dir(&invocation.dir)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = match process::spawn(&mut cmd) {
            Ok(child) => child,
            Err(e) => return LintResult::skipped(format!("failed to spawn {}: {}", self.program, e)),
        };
        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => return LintResult::skipped(format!("failed to wait for {}: {}", self.program, e)),
        };

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        let log_path = invocation.log_path.with_extension("lint.log");
        let written = async {
            if let Some(parent) = log_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&log_path, &log).await
        }
        .await;
        if let Err(e) = &written {
            tracing::warn!(session_id = %invocation.session_id, error = %e, "failed to write lint log");
        }

        let (status, findings) = if output.status.success() {
            (LintStatus::Passed, 0)
        } else {
            let lines = log.lines().filter(|l| !l.trim().is_empty()).count();
            (LintStatus::Failed, u32::try_from(lines).unwrap_or(u32::MAX).max(1))
        };
        tracing::info!(
            session_id = %invocation.session_id,
            linter = %self.program,
            status = ?status,
            findings,
            "lint finished"
        );
        LintResult {
            status,
            findings,
            log_path: written.is_ok().then_some(log_path),
            reason: None,
        }
    }
}

fn capture_u32(caps: &regex::Captures<'_>, idx: usize) -> u32 {
    caps.get(idx)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Parses cargo, jest or pytest summary lines.
pub fn parse_test_counts(output: &str) -> Option<TestCounts> {
    // cargo prints one summary per test binary
    let mut cargo = None::<TestCounts>;
    for caps in CARGO_SUMMARY_RE.captures_iter(output) {
        let passed = capture_u32(&caps, 1);
        let failed = capture_u32(&caps, 2);
        let acc = cargo.get_or_insert_with(TestCounts::default);
        acc.passed += passed;
        acc.total += passed + failed;
    }
    if cargo.is_some() {
        return cargo;
    }

    if let Some(caps) = JEST_SUMMARY_RE.captures_iter(output).last() {
        let line = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let mut counts = TestCounts::default();
        for part in line.split(',') {
            let mut words = part.split_whitespace();
            let n: u32 = match words.next().and_then(|n| n.parse().ok()) {
                Some(n) => n,
                None => continue,
            };
            match words.next() {
                Some("passed") => counts.passed = n,
                Some("total") => counts.total = n,
                _ => {}
            }
        }
        return Some(counts);
    }

    if let Some(caps) = PYTEST_SUMMARY_RE.captures_iter(output).last() {
        let line = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let mut counts = TestCounts::default();
        for c in PYTEST_COUNT_RE.captures_iter(line) {
            let n = capture_u32(&c, 1);
            if c.get(2).map(|m| m.as_str()) == Some("passed") {
                counts.passed += n;
            }
            counts.total += n;
        }
        return Some(counts);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_cargo_summaries_across_binaries() {
        let output = "running 3 tests\ntest result: ok. 3 passed; 0 failed; 0 ignored; 0 measured; 0 filtered out\n\nrunning 2 tests\ntest result: FAILED. 1 passed; 1 failed; 0 ignored; 0 measured\n";
        assert_eq!(parse_test_counts(output), Some(TestCounts::new(4, 5)));
    }

    #[test]
    fn parses_pytest_summary() {
        let output = "....F\n========== 2 failed, 38 passed, 1 skipped in 0.42s ==========\n";
        assert_eq!(parse_test_counts(output), Some(TestCounts::new(38, 40)));

        let clean = "============================== 40 passed in 1.01s ==============================\n";
        assert_eq!(parse_test_counts(clean), Some(TestCounts::new(40, 40)));
    }

    #[test]
    fn parses_jest_summary() {
        let output = "Test Suites: 1 failed, 3 passed, 4 total\nTests:       2 failed, 1 skipped, 37 passed, 40 total\nTime: 2.1 s\n";
        assert_eq!(parse_test_counts(output), Some(TestCounts::new(37, 40)));
    }

    #[test]
    fn unrecognised_output_yields_none() {
        assert_eq!(parse_test_counts("all good\n"), None);
    }

    #[test]
    fn zero_result_has_zero_ratio() {
        let result = TestResult::zero("s1", Duration::from_secs(1), None);
        assert_eq!(result.pass_ratio(), 0.0);
        assert_eq!(result.passed, 0);
    }

    #[test]
    fn from_argv_rejects_empty_command() {
        assert!(CommandTestRunner::from_argv(&[]).is_err());
        let runner = CommandTestRunner::from_argv(&["pytest".to_string(), "-q".to_string()]).unwrap();
        assert_eq!(runner.name(), "pytest");
    }

    #[tokio::test]
    async fn command_runner_falls_back_to_exit_status() {
        let dir = TempDir::new().unwrap();
        let invocation = TestInvocation {
            session_id: "s1".to_string(),
            dir: dir.path().to_path_buf(),
            env: HashMap::new(),
            log_path: dir.path().join("logs/s1.log"),
        };

        let ok = CommandTestRunner::new("sh", vec!["-c".into(), "echo fine".into()]);
        assert_eq!(ok.run(&invocation).await.unwrap(), TestCounts::new(1, 1));
        assert!(std::fs::read_to_string(&invocation.log_path).unwrap().contains("fine"));

        let failing = CommandTestRunner::new("sh", vec!["-c".into(), "exit 3".into()]);
        assert_eq!(failing.run(&invocation).await.unwrap(), TestCounts::new(0, 1));
    }

    #[tokio::test]
    async fn command_runner_parses_counts_and_env() {
        let dir = TempDir::new().unwrap();
        let invocation = TestInvocation {
            session_id: "s2".to_string(),
            dir: dir.path().to_path_buf(),
            env: HashMap::from([("PASSED".to_string(), "7".to_string())]),
            log_path: dir.path().join("s2.log"),
        };
        let runner = CommandTestRunner::new(
            "sh",
            vec![
                "-c".into(),
                "echo \"test result: ok. $PASSED passed; 1 failed; 0 ignored\"".into(),
            ],
        );
        assert_eq!(runner.run(&invocation).await.unwrap(), TestCounts::new(7, 8));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_suite_leaves_no_background_work() {
        let dir = TempDir::new().unwrap();
        let invocation = TestInvocation {
            session_id: "s4".to_string(),
            dir: dir.path().to_path_buf(),
            env: HashMap::new(),
            log_path: dir.path().join("s4.log"),
        };
        let runner = CommandTestRunner::new("sh", vec!["-c".into(), "(sleep 1; touch marker) & wait".into()]);

        let ran = tokio::time::timeout(Duration::from_millis(200), runner.run(&invocation)).await;
        assert!(ran.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn linter_counts_findings_on_failure() {
        let dir = TempDir::new().unwrap();
        let invocation = TestInvocation {
            session_id: "s5".to_string(),
            dir: dir.path().to_path_buf(),
            env: HashMap::new(),
            log_path: dir.path().join("s5.log"),
        };

        assert!(CommandLinter::from_argv(&[]).is_none());
        let clean = CommandLinter::from_argv(&["sh".into(), "-c".into(), "true".into()]).unwrap();
        let result = clean.run(&invocation).await;
        assert_eq!(result.status, LintStatus::Passed);
        assert_eq!(result.findings, 0);

        let noisy = CommandLinter::from_argv(&[
            "sh".into(),
            "-c".into(),
            "echo 'a.py:1: unused import'; echo; echo 'a.py:4: line too long'; exit 1".into(),
        ])
        .unwrap();
        let result = noisy.run(&invocation).await;
        assert_eq!(result.status, LintStatus::Failed);
        assert_eq!(result.findings, 2);
        let log = std::fs::read_to_string(result.log_path.unwrap()).unwrap();
        assert!(log.contains("line too long"));
    }

    #[tokio::test]
    async fn missing_linter_is_skipped() {
        let dir = TempDir::new().unwrap();
        let invocation = TestInvocation {
            session_id: "s6".to_string(),
            dir: dir.path().to_path_buf(),
            env: HashMap::new(),
            log_path: dir.path().join("s6.log"),
        };
        let linter = CommandLinter::from_argv(&["definitely-not-a-real-linter-xyz".to_string()]).unwrap();
        let result = linter.run(&invocation).await;
        assert_eq!(result.status, LintStatus::Skipped);
        assert!(result.reason.is_some());
    }

    #[tokio::test]
    async fn missing_program_is_infra_error() {
        let dir = TempDir::new().unwrap();
        let invocation = TestInvocation {
            session_id: "s3".to_string(),
            dir: dir.path().to_path_buf(),
            env: HashMap::new(),
            log_path: dir.path().join("s3.log"),
        };
        let runner = CommandTestRunner::new("definitely-not-a-real-binary-xyz", vec![]);
        assert!(matches!(runner.run(&invocation).await, Err(Error::Sandbox(_))));
    }
}
