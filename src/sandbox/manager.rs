//! Bounded, timeout-guarded test runs of candidates in sandboxes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::budget::ExecutionBudget;
use crate::cancel::CancelToken;
use crate::candidate::{apply_operations, CandidateFix};
use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, NullSink, PipelineEvent};
use crate::test_runner::{CommandLinter, LintResult, TestInvocation, TestResult, TestRunner};

use super::provider::{Sandbox, SandboxProvider};

/// How a sandbox session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum SandboxOutcome {
    Completed,
    TimedOut,
    InfraError(String),
    Cancelled,
}

impl std::fmt::Display for SandboxOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxOutcome::Completed => write!(f, "completed"),
            SandboxOutcome::TimedOut => write!(f, "timed-out"),
            SandboxOutcome::InfraError(reason) => write!(f, "infra-error: {}", reason),
            SandboxOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Record of one sandbox's life. The workspace is gone by the time this
/// is returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSession {
    pub id: String,
    pub candidate_id: String,
    /// Where the workspace lived.
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: SandboxOutcome,
}

/// Final session and test result for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRun {
    pub session: SandboxSession,
    pub result: TestResult,
    /// Sessions used, including infra-error retries.
    pub attempts: u32,
    /// Lint step, when a linter is configured and the suite completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint: Option<LintResult>,
}

impl SandboxRun {
    /// Lint findings to count against the candidate.
    pub fn lint_findings(&self) -> usize {
        self.lint.as_ref().map_or(0, |l| l.findings as usize)
    }
}

/// Environment that keeps build caches and installs inside the sandbox.
pub fn isolated_env(sandbox_path: &Path) -> HashMap<String, String> {
    let env_root = sandbox_path.join(".sandbox-env");
    let path = |sub: &str| env_root.join(sub).to_string_lossy().into_owned();
    HashMap::from([
        ("CARGO_TARGET_DIR".to_string(), path("target")),
        ("npm_config_cache".to_string(), path("npm-cache")),
        ("PYTHONUSERBASE".to_string(), path("python-user")),
        ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
        ("REMEDIATION_SANDBOX".to_string(), "1".to_string()),
    ])
}

/// Provisions sandboxes, runs tests in them and tears them down.
#[derive(Clone)]
pub struct SandboxManager<P> {
    provider: P,
    runner: Arc<dyn TestRunner>,
    linter: Option<CommandLinter>,
    budget: ExecutionBudget,
    max_concurrent: usize,
    logs_dir: PathBuf,
    extra_env: HashMap<String, String>,
    events: Arc<dyn EventSink>,
}

impl<P> SandboxManager<P>
where
    P: SandboxProvider + Clone + 'static,
{
    pub fn new(
        provider: P,
        runner: Arc<dyn TestRunner>,
        budget: ExecutionBudget,
        config: &SandboxConfig,
        logs_dir: PathBuf,
    ) -> Self {
        Self {
            provider,
            runner,
            linter: CommandLinter::from_argv(&config.lint_command),
            budget,
            max_concurrent: config.max_concurrent.max(1),
            logs_dir,
            extra_env: config.env.clone(),
            events: Arc::new(NullSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Runs every candidate, at most `max_concurrent` at a time.
    ///
    /// Returns one run per candidate, in input order. Failures of one
    /// candidate never affect its siblings.
    pub async fn evaluate_all(
        &self,
        request_id: &str,
        candidates: Vec<CandidateFix>,
        cancel: &CancelToken,
    ) -> Vec<SandboxRun> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for (index, candidate) in candidates.into_iter().enumerate() {
            let manager = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let request_id = request_id.to_string();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                let run = match permit {
                    Some(_permit) => manager.run_candidate(&request_id, &candidate, &cancel).await,
                    None => manager.never_started(&request_id, &candidate),
                };
                (index, run)
            });
        }

        let mut runs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(item) => runs.push(item),
                Err(e) => tracing::error!(request_id = %request_id, error = %e, "sandbox task failed"),
            }
        }
        runs.sort_by_key(|(index, _)| *index);
        runs.into_iter().map(|(_, run)| run).collect()
    }

    /// Runs one candidate, retrying after infrastructure errors.
    pub async fn run_candidate(
        &self,
        request_id: &str,
        candidate: &CandidateFix,
        cancel: &CancelToken,
    ) -> SandboxRun {
        let attempts = self.budget.sandbox_attempts();
        let mut attempt = 1;
        loop {
            let mut run = self.run_once(request_id, candidate, cancel).await;
            run.attempts = attempt;

            let retry = matches!(run.session.outcome, SandboxOutcome::InfraError(_))
                && attempt < attempts
                && !cancel.is_cancelled();
            if !retry {
                return run;
            }
            tracing::warn!(
                request_id = %request_id,
                candidate_id = %candidate.id,
                attempt,
                outcome = %run.session.outcome,
                "sandbox infrastructure error, retrying"
            );
            attempt += 1;
        }
    }

    async fn run_once(
        &self,
        request_id: &str,
        candidate: &CandidateFix,
        cancel: &CancelToken,
    ) -> SandboxRun {
        let session_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        self.events.emit(PipelineEvent::SandboxStarted {
            request_id: request_id.to_string(),
            candidate_id: candidate.id.clone(),
            session_id: session_id.clone(),
        });

        let provider = self.provider.clone();
        let operations = candidate.operations.clone();
        let label = format!("cand-{}", &session_id[..8]);
        let provisioned = tokio::task::spawn_blocking(move || -> Result<P::Sandbox> {
            let sandbox = provider.create(&label)?;
            // On error the sandbox is dropped here, which removes it
            apply_operations(sandbox.path(), &operations)
                .map_err(|e| Error::Sandbox(format!("failed to apply candidate: {}", e)))?;
            Ok(sandbox)
        })
        .await;

        let mut sandbox = match provisioned {
            Ok(Ok(sandbox)) => sandbox,
            Ok(Err(e)) => {
                return self.finish(
                    request_id,
                    candidate,
                    session_id,
                    PathBuf::new(),
                    started_at,
                    clock,
                    SandboxOutcome::InfraError(e.to_string()),
                    None,
                )
            }
            Err(e) => {
                return self.finish(
                    request_id,
                    candidate,
                    session_id,
                    PathBuf::new(),
                    started_at,
                    clock,
                    SandboxOutcome::InfraError(format!("provisioning task failed: {}", e)),
                    None,
                )
            }
        };
        let path = sandbox.path().clone();

        let log_path = self
            .logs_dir
            .join(request_id)
            .join(format!("{}.log", session_id));
        let mut env = isolated_env(&path);
        env.extend(self.extra_env.clone());
        let invocation = TestInvocation {
            session_id: session_id.clone(),
            dir: path.clone(),
            env,
            log_path: log_path.clone(),
        };

        // Dropping the runner future kills the test process group.
        let (outcome, counts) = tokio::select! {
            biased;
            _ = cancel.cancelled() => (SandboxOutcome::Cancelled, None),
            result = tokio::time::timeout(self.budget.sandbox_timeout, self.runner.run(&invocation)) => {
                match result {
                    Err(_) => (SandboxOutcome::TimedOut, None),
                    Ok(Err(e)) => (SandboxOutcome::InfraError(e.to_string()), None),
                    Ok(Ok(counts)) => (SandboxOutcome::Completed, Some(counts)),
                }
            }
        };

        let lint = match (&self.linter, &outcome) {
            (Some(linter), SandboxOutcome::Completed) => Some(self.lint(linter, &invocation, cancel).await),
            _ => None,
        };

        match tokio::task::spawn_blocking(move || sandbox.cleanup()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(session_id = %session_id, error = %e, "sandbox teardown failed"),
            Err(e) => tracing::error!(session_id = %session_id, error = %e, "sandbox teardown task failed"),
        }

        let log = log_path.exists().then_some(log_path);
        let mut run = self.finish(
            request_id,
            candidate,
            session_id,
            path,
            started_at,
            clock,
            outcome,
            counts.map(|c| (c, log)),
        );
        run.lint = lint;
        run
    }

    async fn lint(&self, linter: &CommandLinter, invocation: &TestInvocation, cancel: &CancelToken) -> LintResult {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => LintResult::skipped("request cancelled"),
            result = tokio::time::timeout(self.budget.lint_timeout, linter.run(invocation)) => {
                result.unwrap_or_else(|_| {
                    tracing::warn!(session_id = %invocation.session_id, linter = %linter.name(), "lint timed out");
                    LintResult::skipped(format!(
                        "{} timed out after {}s",
                        linter.name(),
                        self.budget.lint_timeout.as_secs()
                    ))
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        request_id: &str,
        candidate: &CandidateFix,
        session_id: String,
        path: PathBuf,
        started_at: DateTime<Utc>,
        clock: Instant,
        outcome: SandboxOutcome,
        counts: Option<(crate::test_runner::TestCounts, Option<PathBuf>)>,
    ) -> SandboxRun {
        let duration = clock.elapsed();
        let result = match counts {
            Some((counts, log_path)) => TestResult {
                session_id: session_id.clone(),
                passed: counts.passed,
                total: counts.total,
                duration,
                log_path,
            },
            None => TestResult::zero(session_id.clone(), duration, None),
        };

        tracing::info!(
            request_id = %request_id,
            candidate_id = %candidate.id,
            session_id = %session_id,
            outcome = %outcome,
            passed = result.passed,
            total = result.total,
            duration_ms = duration.as_millis() as u64,
            "sandbox session finished"
        );
        self.events.emit(PipelineEvent::SandboxFinished {
            request_id: request_id.to_string(),
            candidate_id: candidate.id.clone(),
            session_id: session_id.clone(),
            outcome: outcome.to_string(),
            passed: result.passed,
            total: result.total,
        });

        SandboxRun {
            session: SandboxSession {
                id: session_id,
                candidate_id: candidate.id.clone(),
                path,
                started_at,
                ended_at: Utc::now(),
                outcome,
            },
            result,
            attempts: 1,
            lint: None,
        }
    }

    /// Run record for a candidate cancelled while waiting for a slot.
    fn never_started(&self, request_id: &str, candidate: &CandidateFix) -> SandboxRun {
        let now = Utc::now();
        tracing::debug!(request_id = %request_id, candidate_id = %candidate.id, "cancelled before sandbox start");
        let session_id = uuid::Uuid::new_v4().to_string();
        SandboxRun {
            result: TestResult::zero(session_id.clone(), std::time::Duration::ZERO, None),
            session: SandboxSession {
                id: session_id,
                candidate_id: candidate.id.clone(),
                path: PathBuf::new(),
                started_at: now,
                ended_at: now,
                outcome: SandboxOutcome::Cancelled,
            },
            attempts: 0,
            lint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use crate::candidate::{FileOperation, RiskTier};
    use crate::sandbox::CopySandbox;
    use crate::test_runner::{LintStatus, TestCounts};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Passes as many tests as the number in `score.txt` out of 10.
    struct ScoreFileRunner {
        delay: Duration,
        fail_first: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScoreFileRunner {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail_first: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TestRunner for ScoreFileRunner {
        async fn run(&self, invocation: &TestInvocation) -> Result<TestCounts> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Sandbox("runner crashed".to_string()));
            }
            assert_eq!(invocation.env.get("REMEDIATION_SANDBOX").map(String::as_str), Some("1"));
            let score = std::fs::read_to_string(invocation.dir.join("score.txt"))?;
            Ok(TestCounts::new(score.trim().parse().unwrap_or(0), 10))
        }

        fn name(&self) -> &str {
            "score-file"
        }
    }

    struct Fixture {
        repo: TempDir,
        base: TempDir,
        logs: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = TempDir::new().unwrap();
            std::fs::write(repo.path().join("score.txt"), "0\n").unwrap();
            Self {
                repo,
                base: TempDir::new().unwrap(),
                logs: TempDir::new().unwrap(),
            }
        }

        fn manager(&self, runner: Arc<dyn TestRunner>, budget: ExecutionBudget, max: usize) -> SandboxManager<CopySandbox> {
            let config = SandboxConfig {
                max_concurrent: max,
                ..SandboxConfig::default()
            };
            self.manager_with(runner, budget, &config)
        }

        fn manager_with(
            &self,
            runner: Arc<dyn TestRunner>,
            budget: ExecutionBudget,
            config: &SandboxConfig,
        ) -> SandboxManager<CopySandbox> {
            let provider = CopySandbox::new(
                self.repo.path().to_path_buf(),
                Some(self.base.path().to_path_buf()),
                vec![".git".to_string()],
            );
            SandboxManager::new(provider, runner, budget, config, self.logs.path().to_path_buf())
        }

        fn sandboxes_left(&self) -> usize {
            std::fs::read_dir(self.base.path()).unwrap().count()
        }
    }

    fn candidate(score: u32) -> CandidateFix {
        CandidateFix::new(
            "req",
            format!("score {}", score),
            "",
            RiskTier::Low,
            vec![FileOperation::modify("score.txt", format!("{}\n", score))],
        )
    }

    #[tokio::test]
    async fn runs_candidates_in_isolation_and_tears_down() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::from_millis(10)));
        let manager = fx.manager(runner, ExecutionBudget::default(), 2);

        let runs = manager
            .evaluate_all("req", vec![candidate(10), candidate(7)], &CancelToken::new())
            .await;

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].result.passed, 10);
        assert_eq!(runs[1].result.passed, 7);
        assert!(runs.iter().all(|r| r.session.outcome == SandboxOutcome::Completed));
        assert_eq!(
            std::fs::read_to_string(fx.repo.path().join("score.txt")).unwrap(),
            "0\n"
        );
        assert_eq!(fx.sandboxes_left(), 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::from_millis(50)));
        let manager = fx.manager(runner.clone(), ExecutionBudget::default(), 2);

        let candidates = (0..5).map(candidate).collect();
        let runs = manager.evaluate_all("req", candidates, &CancelToken::new()).await;

        assert_eq!(runs.len(), 5);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn timeout_yields_zero_result() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::from_secs(5)));
        let budget = ExecutionBudget {
            sandbox_timeout: Duration::from_millis(50),
            ..ExecutionBudget::default()
        };
        let manager = fx.manager(runner, budget, 1);

        let run = manager.run_candidate("req", &candidate(10), &CancelToken::new()).await;

        assert_eq!(run.session.outcome, SandboxOutcome::TimedOut);
        assert_eq!(run.result.passed, 0);
        assert_eq!(run.attempts, 1);
        assert_eq!(fx.sandboxes_left(), 0);
    }

    #[tokio::test]
    async fn infra_error_is_retried_once() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::ZERO));
        runner.fail_first.store(1, Ordering::SeqCst);
        let manager = fx.manager(runner, ExecutionBudget::default(), 1);

        let run = manager.run_candidate("req", &candidate(9), &CancelToken::new()).await;
        assert_eq!(run.session.outcome, SandboxOutcome::Completed);
        assert_eq!(run.result.passed, 9);
        assert_eq!(run.attempts, 2);
    }

    #[tokio::test]
    async fn persistent_infra_error_gives_up() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::ZERO));
        runner.fail_first.store(5, Ordering::SeqCst);
        let manager = fx.manager(runner, ExecutionBudget::default(), 1);

        let run = manager.run_candidate("req", &candidate(9), &CancelToken::new()).await;
        assert!(matches!(run.session.outcome, SandboxOutcome::InfraError(_)));
        assert_eq!(run.result.passed, 0);
        assert_eq!(run.attempts, 2);
        assert_eq!(fx.sandboxes_left(), 0);
    }

    #[tokio::test]
    async fn unappliable_candidate_is_infra_error() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::ZERO));
        let manager = fx.manager(runner, ExecutionBudget::default(), 1);
        let bad = CandidateFix::new(
            "req",
            "bad diff",
            "",
            RiskTier::Low,
            vec![FileOperation::modify_with_diff("score.txt", "@@ -1,1 +1,1 @@\n-nope\n+x\n")],
        );

        let run = manager.run_candidate("req", &bad, &CancelToken::new()).await;
        assert!(matches!(run.session.outcome, SandboxOutcome::InfraError(_)));
        assert_eq!(fx.sandboxes_left(), 0);
    }

    #[tokio::test]
    async fn cancellation_tears_down_running_sandboxes() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::from_secs(30)));
        let manager = fx.manager(runner, ExecutionBudget::default(), 1);
        let cancel = CancelToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel(CancelReason::Requested("operator".to_string()));
        });

        let runs = manager
            .evaluate_all("req", vec![candidate(1), candidate(2)], &cancel)
            .await;

        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.session.outcome == SandboxOutcome::Cancelled));
        assert_eq!(fx.sandboxes_left(), 0);
    }

    fn lint_config(script: &str) -> SandboxConfig {
        SandboxConfig {
            max_concurrent: 1,
            lint_command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..SandboxConfig::default()
        }
    }

    #[tokio::test]
    async fn linter_runs_inside_the_sandbox_after_tests() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::ZERO));
        let config = lint_config("grep -q '^7$' score.txt && echo 'score.txt:1: magic number' && exit 1");
        let manager = fx.manager_with(runner, ExecutionBudget::default(), &config);

        let run = manager.run_candidate("req", &candidate(7), &CancelToken::new()).await;

        assert_eq!(run.result.passed, 7);
        let lint = run.lint.as_ref().expect("lint result");
        assert_eq!(lint.status, LintStatus::Failed);
        assert_eq!(run.lint_findings(), 1);
        assert_eq!(fx.sandboxes_left(), 0);
    }

    #[tokio::test]
    async fn slow_linter_is_skipped() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::ZERO));
        let budget = ExecutionBudget {
            lint_timeout: Duration::from_millis(50),
            ..ExecutionBudget::default()
        };
        let manager = fx.manager_with(runner, budget, &lint_config("sleep 5"));

        let run = manager.run_candidate("req", &candidate(3), &CancelToken::new()).await;

        assert_eq!(run.session.outcome, SandboxOutcome::Completed);
        assert_eq!(run.lint.as_ref().map(|l| l.status), Some(LintStatus::Skipped));
        assert_eq!(run.lint_findings(), 0);
    }

    #[tokio::test]
    async fn failed_suites_are_not_linted() {
        let fx = Fixture::new();
        let runner = Arc::new(ScoreFileRunner::new(Duration::ZERO));
        runner.fail_first.store(5, Ordering::SeqCst);
        let manager = fx.manager_with(runner, ExecutionBudget::default(), &lint_config("exit 1"));

        let run = manager.run_candidate("req", &candidate(3), &CancelToken::new()).await;
        assert!(run.lint.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_suite_leaves_no_background_processes() {
        let fx = Fixture::new();
        let outside = TempDir::new().unwrap();
        let marker = outside.path().join("marker");
        let script = format!("(sleep 1; touch '{}') & wait", marker.display());
        let runner = Arc::new(
            crate::test_runner::CommandTestRunner::from_argv(&["sh".to_string(), "-c".to_string(), script]).unwrap(),
        );
        let budget = ExecutionBudget {
            sandbox_timeout: Duration::from_millis(200),
            ..ExecutionBudget::default()
        };
        let manager = fx.manager(runner, budget, 1);

        let run = manager.run_candidate("req", &candidate(3), &CancelToken::new()).await;
        assert_eq!(run.session.outcome, SandboxOutcome::TimedOut);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
        assert_eq!(fx.sandboxes_left(), 0);
    }

    #[test]
    fn isolated_env_points_inside_sandbox() {
        let env = isolated_env(Path::new("/tmp/sb"));
        assert!(env["CARGO_TARGET_DIR"].starts_with("/tmp/sb/"));
        assert_eq!(env["PYTHONDONTWRITEBYTECODE"], "1");
    }
}
