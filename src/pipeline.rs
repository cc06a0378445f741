//! End-to-end remediation runs.
//!
//! A [`RemediationPipeline`] owns one instance of every stage, built from
//! injected collaborators, and carries no global state: independent
//! requests can be submitted concurrently on the same pipeline.
//!
//! Request -> context -> N candidates -> preflight -> sandboxed tests ->
//! scoring -> [bounded re-fix] -> proposal (AwaitingApproval) -> optional
//! auto-apply.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::budget::ExecutionBudget;
use crate::cancel::{CancelReason, CancelToken};
use crate::candidate::CandidateFix;
use crate::config::{PipelineConfig, Validate};
use crate::context::{CodebaseSearch, ContextBuilder, GenerationContext};
use crate::deploy::{BackupStore, Deployer, PathLockManager, SmokeCheck};
use crate::error::{Error, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::failure::FailureAnalysis;
use crate::generator::{CandidateGenerator, SlotFailure, TextGenerator};
use crate::preflight::{PreflightValidator, ValidationResult};
use crate::proposal::{Proposal, ProposalManager, ProposalQuery, ProposalState, ProposalStore};
use crate::request::{RemediationRequest, RequestStatus};
use crate::sandbox::{SandboxManager, SandboxOutcome, SandboxProvider, SandboxRun};
use crate::scorer::{CandidateScorer, Score};
use crate::snapshot::CodebaseSnapshot;
use crate::test_runner::TestRunner;

/// Actor recorded when the auto-apply policy approves a proposal.
pub const AUTO_APPLY_ACTOR: &str = "auto-apply-policy";

/// Actor recorded when the pipeline itself withdraws a proposal.
pub const PIPELINE_ACTOR: &str = "pipeline";

/// Collaborators a pipeline is built from.
pub struct PipelineParts<P> {
    pub generator: Arc<dyn TextGenerator>,
    pub search: Arc<dyn CodebaseSearch>,
    pub provider: P,
    pub test_runner: Arc<dyn TestRunner>,
    pub store: Arc<dyn ProposalStore>,
    pub smoke: Arc<dyn SmokeCheck>,
    pub events: Arc<dyn EventSink>,
    /// Shared with every other deployer on the same tree. Use
    /// [`PathLockManager::persistent`] when several processes deploy.
    pub locks: PathLockManager,
}

/// Terminal outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    ProposalCreated {
        proposal_id: String,
        state: ProposalState,
        /// Why the auto-apply policy could not apply the proposal.
        #[serde(skip_serializing_if = "Option::is_none")]
        apply_error: Option<String>,
    },
    NoViableFix {
        reason: String,
    },
    Cancelled {
        reason: String,
    },
}

/// Everything one run produced, for callers and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub request: RemediationRequest,
    pub outcome: PipelineOutcome,
    pub candidates: Vec<CandidateFix>,
    #[serde(skip)]
    pub generation_failures: Vec<SlotFailure>,
    pub validations: Vec<ValidationResult>,
    pub runs: Vec<SandboxRun>,
    /// Best first.
    pub scores: Vec<Score>,
    pub proposal: Option<Proposal>,
}

impl PipelineReport {
    fn new(request: RemediationRequest) -> Self {
        Self {
            request,
            outcome: PipelineOutcome::NoViableFix {
                reason: String::new(),
            },
            candidates: Vec::new(),
            generation_failures: Vec::new(),
            validations: Vec::new(),
            runs: Vec::new(),
            scores: Vec::new(),
            proposal: None,
        }
    }
}

/// Deregisters a run and stops its timeout timer however `submit` exits.
struct ActiveRun<'a> {
    active: &'a Mutex<HashMap<String, CancelToken>>,
    request_id: String,
    timer: JoinHandle<()>,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.timer.abort();
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.request_id);
    }
}

pub struct RemediationPipeline<P> {
    repo: PathBuf,
    config: PipelineConfig,
    budget: ExecutionBudget,
    context: ContextBuilder,
    generator: CandidateGenerator,
    validator: PreflightValidator,
    sandboxes: SandboxManager<P>,
    scorer: CandidateScorer,
    proposals: Arc<ProposalManager>,
    deployer: Arc<Deployer>,
    events: Arc<dyn EventSink>,
    active: Mutex<HashMap<String, CancelToken>>,
    requests: Mutex<HashMap<String, RemediationRequest>>,
}

impl<P> RemediationPipeline<P>
where
    P: SandboxProvider + Clone + 'static,
{
    /// Builds a pipeline for the repository at `repo`.
    ///
    /// Fails if the configuration has errors; warnings are logged.
    pub fn new(repo: PathBuf, config: PipelineConfig, parts: PipelineParts<P>) -> Result<Self> {
        for warning in config.validate().into_result()? {
            tracing::warn!(warning = %warning, "configuration warning");
        }
        let budget = config.budget();

        let proposals = Arc::new(ProposalManager::new(Arc::clone(&parts.store)).with_events(Arc::clone(&parts.events)));
        let deployer = Arc::new(
            Deployer::new(
                repo.clone(),
                Arc::clone(&proposals),
                BackupStore::new(config.backups_dir(&repo)),
                parts.smoke,
                budget.clone(),
                config.deploy.grace_period(),
            )
            .with_locks(parts.locks),
        );

        let context = ContextBuilder::new(parts.search, config.context.clone(), budget.clone())
            .with_history(Arc::clone(&parts.store));
        let generator = CandidateGenerator::new(parts.generator, config.generation.clone(), budget.clone())
            .with_events(Arc::clone(&parts.events));
        let validator = PreflightValidator::new(&config.preflight)?;
        let sandboxes = SandboxManager::new(
            parts.provider,
            parts.test_runner,
            budget.clone(),
            &config.sandbox,
            config.logs_dir(&repo),
        )
        .with_events(Arc::clone(&parts.events));
        let scorer = CandidateScorer::new(config.scoring.clone());

        Ok(Self {
            repo,
            config,
            budget,
            context,
            generator,
            validator,
            sandboxes,
            scorer,
            proposals,
            deployer,
            events: parts.events,
            active: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
        })
    }

    pub fn proposals(&self) -> &Arc<ProposalManager> {
        &self.proposals
    }

    pub fn deployer(&self) -> &Arc<Deployer> {
        &self.deployer
    }

    /// Last known state of a request submitted to this pipeline.
    pub fn request(&self, request_id: &str) -> Option<RemediationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(request_id)
            .cloned()
    }

    fn remember(&self, request: &RemediationRequest) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.id.clone(), request.clone());
    }

    fn register(&self, request_id: &str) -> (CancelToken, ActiveRun<'_>) {
        let token = CancelToken::new();
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.to_string(), token.clone());

        let timer = {
            let token = token.clone();
            let timeout = self.budget.request_timeout;
            let request_id = request_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if token.cancel(CancelReason::TimedOut) {
                    tracing::warn!(request_id = %request_id, timeout_secs = timeout.as_secs(), "request timed out");
                }
            })
        };
        (
            token,
            ActiveRun {
                active: &self.active,
                request_id: request_id.to_string(),
                timer,
            },
        )
    }

    /// Runs `request` through the whole pipeline.
    ///
    /// "No viable fix" and cancellation are outcomes, not errors. An error
    /// means the pipeline itself failed (store, filesystem, configuration).
    pub async fn submit(&self, mut request: RemediationRequest) -> Result<PipelineReport> {
        tracing::info!(request_id = %request.id, description = %request.description, "remediation request received");
        self.events.emit(PipelineEvent::RequestReceived {
            request_id: request.id.clone(),
        });
        self.remember(&request);

        let (token, active) = self.register(&request.id);
        let mut report = PipelineReport::new(request.clone());
        let result = self.run(&request, &token, &mut report).await;
        drop(active);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(Error::Cancelled(reason)) => PipelineOutcome::Cancelled { reason },
            Err(e) => {
                request.complete(format!("pipeline failed: {}", e));
                self.remember(&request);
                tracing::error!(request_id = %request.id, error = %e, "remediation run failed");
                return Err(e);
            }
        };

        let summary = match &outcome {
            PipelineOutcome::ProposalCreated {
                proposal_id,
                state,
                apply_error,
            } => {
                let mut summary = format!("proposal {} is {}", proposal_id, state);
                if let Some(error) = apply_error {
                    summary.push_str(&format!("; auto-apply failed: {}", error));
                }
                request.complete(summary.clone());
                summary
            }
            PipelineOutcome::NoViableFix { reason } => {
                let summary = format!("no viable fix: {}", reason);
                request.complete(summary.clone());
                summary
            }
            PipelineOutcome::Cancelled { reason } => {
                request.cancel(reason.clone());
                format!("cancelled: {}", reason)
            }
        };
        self.remember(&request);

        tracing::info!(request_id = %request.id, status = ?request.status, outcome = %summary, "remediation request finished");
        self.events.emit(PipelineEvent::RequestFinished {
            request_id: request.id.clone(),
            status: request.status,
            outcome: summary,
        });

        report.request = request;
        report.outcome = outcome;
        Ok(report)
    }

    fn check_cancelled(token: &CancelToken) -> Result<()> {
        match token.reason() {
            Some(reason) => Err(Error::Cancelled(reason.to_string())),
            None => Ok(()),
        }
    }

    async fn run(
        &self,
        request: &RemediationRequest,
        token: &CancelToken,
        report: &mut PipelineReport,
    ) -> Result<PipelineOutcome> {
        let snapshot = {
            let repo = self.repo.clone();
            let ignored = self.config.preflight.ignored_dirs.clone();
            tokio::task::spawn_blocking(move || CodebaseSnapshot::capture(&repo, &ignored))
                .await
                .map_err(|e| Error::Store(format!("snapshot task failed: {}", e)))??
        };

        let context = tokio::select! {
            biased;
            reason = token.cancelled() => return Err(Error::Cancelled(reason.to_string())),
            context = self.context.build(request, snapshot.manifest()) => context,
        };

        let batch = self.generator.generate(request, &context, token).await;
        report.candidates = batch.candidates.clone();
        report.generation_failures = batch.failures.clone();
        Self::check_cancelled(token)?;
        if batch.candidates.is_empty() {
            return Ok(PipelineOutcome::NoViableFix {
                reason: format!("all {} generation slots failed", batch.failures.len()),
            });
        }

        let mut survivors = self.preflight(request, &batch.candidates, &snapshot, report);
        if survivors.is_empty() {
            return Ok(PipelineOutcome::NoViableFix {
                reason: format!("all {} candidates failed preflight", batch.candidates.len()),
            });
        }

        report.runs = self
            .sandboxes
            .evaluate_all(
                &request.id,
                survivors.iter().map(|(c, _)| c.clone()).collect(),
                token,
            )
            .await;
        Self::check_cancelled(token)?;

        let mut scores = self.score_runs(&survivors, &report.runs);
        report.scores = self.scorer.rank(scores.clone());
        let mut best = self.scorer.select(scores.clone());
        if best.is_none() && self.config.generation.refix_attempts > 0 {
            best = self
                .refix(request, &context, &snapshot, token, &mut survivors, &mut scores, report)
                .await?;
            report.scores = self.scorer.rank(scores);
        }

        let Some(best) = best else {
            return Ok(PipelineOutcome::NoViableFix {
                reason: format!(
                    "none of {} tested candidates passed the test suite",
                    report.runs.len()
                ),
            });
        };
        let selected = survivors
            .iter()
            .find(|(c, _)| c.id == best.candidate_id)
            .map(|(c, _)| c.clone())
            .ok_or_else(|| Error::not_found("candidate", best.candidate_id.clone()))?;
        let run = report
            .runs
            .iter()
            .find(|r| r.session.candidate_id == best.candidate_id)
            .cloned()
            .ok_or_else(|| Error::not_found("sandbox run", best.candidate_id.clone()))?;

        tracing::info!(
            request_id = %request.id,
            candidate_id = %best.candidate_id,
            passed = best.passed,
            total = best.total,
            value = best.value,
            "selected candidate"
        );

        Self::check_cancelled(token)?;
        let proposal = self.proposals.create(&selected, &snapshot, &run.result)?;
        report.proposal = Some(proposal.clone());
        self.proposals.mark_validated(
            &proposal.id,
            &format!("{}/{} tests passed in sandbox", best.passed, best.total),
        )?;
        let mut proposal = self.proposals.publish(&proposal.id)?;
        report.proposal = Some(proposal.clone());

        // A cancel that raced proposal creation withdraws the proposal
        if let Some(reason) = token.reason() {
            let rejected = self.proposals.reject(
                &proposal.id,
                PIPELINE_ACTOR,
                &format!("request cancelled: {}", reason),
            )?;
            report.proposal = Some(rejected);
            return Err(Error::Cancelled(reason.to_string()));
        }

        let mut apply_error = None;
        if self.config.auto_apply.permits(best.risk, best.test_ratio) {
            match self.auto_apply(request, &proposal, &best, token).await {
                Ok((applied, error)) => {
                    proposal = applied;
                    apply_error = error;
                }
                Err(e) => {
                    report.proposal = self.proposals.get(&proposal.id).ok();
                    return Err(e);
                }
            }
        }

        let outcome = PipelineOutcome::ProposalCreated {
            proposal_id: proposal.id.clone(),
            state: proposal.state,
            apply_error,
        };
        report.proposal = Some(proposal);
        Ok(outcome)
    }

    /// Validates `candidates` and returns the survivors with their warning
    /// counts.
    fn preflight(
        &self,
        request: &RemediationRequest,
        candidates: &[CandidateFix],
        snapshot: &CodebaseSnapshot,
        report: &mut PipelineReport,
    ) -> Vec<(CandidateFix, usize)> {
        let mut survivors = Vec::new();
        for candidate in candidates {
            let validation = self.validator.validate(candidate, snapshot);
            self.events.emit(PipelineEvent::ValidationCompleted {
                request_id: request.id.clone(),
                candidate_id: candidate.id.clone(),
                passed: validation.is_pass(),
                reason: validation.failure_reason(),
            });
            if validation.is_pass() {
                survivors.push((candidate.clone(), validation.warnings.len()));
            }
            report.validations.push(validation);
        }
        survivors
    }

    fn score_runs(&self, survivors: &[(CandidateFix, usize)], runs: &[SandboxRun]) -> Vec<Score> {
        runs.iter()
            .filter_map(|run| {
                let (candidate, warnings) = survivors
                    .iter()
                    .find(|(c, _)| c.id == run.session.candidate_id)?;
                Some(self.scorer.score(candidate, warnings + run.lint_findings(), &run.result))
            })
            .collect()
    }

    /// Reads the test log of a failed run back into a failure analysis.
    async fn analyse(&self, run: &SandboxRun) -> FailureAnalysis {
        let log = match &run.result.log_path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    tracing::debug!(path = ?path, error = %e, "failed to read test log");
                    String::new()
                }
            },
            None => String::new(),
        };
        let analysis = FailureAnalysis::from_log(&log);
        match &run.session.outcome {
            SandboxOutcome::Completed => analysis,
            other => analysis.with_note(format!("sandbox outcome: {}", other)),
        }
    }

    /// Bounded re-fix loop, entered when no tested candidate was viable.
    ///
    /// Each attempt generates one more candidate from the analysis of the
    /// latest failure and evaluates it like the others. Stops at the first
    /// viable candidate.
    #[allow(clippy::too_many_arguments)]
    async fn refix(
        &self,
        request: &RemediationRequest,
        context: &GenerationContext,
        snapshot: &CodebaseSnapshot,
        token: &CancelToken,
        survivors: &mut Vec<(CandidateFix, usize)>,
        scores: &mut Vec<Score>,
        report: &mut PipelineReport,
    ) -> Result<Option<Score>> {
        let ranked = self.scorer.rank(scores.clone());
        let Some(top) = ranked.first() else {
            return Ok(None);
        };
        let Some((candidate, _)) = survivors.iter().find(|(c, _)| c.id == top.candidate_id) else {
            return Ok(None);
        };
        let Some(run) = report.runs.iter().find(|r| r.session.candidate_id == top.candidate_id) else {
            return Ok(None);
        };
        let mut focus = (candidate.clone(), self.analyse(run).await);
        let mut earlier: Vec<(CandidateFix, FailureAnalysis)> = Vec::new();

        for attempt in 1..=self.config.generation.refix_attempts {
            Self::check_cancelled(token)?;
            tracing::info!(
                request_id = %request.id,
                attempt,
                root_cause = %focus.1.root_cause,
                "no viable candidate, generating a re-fix"
            );
            self.events.emit(PipelineEvent::RefixStarted {
                request_id: request.id.clone(),
                attempt,
                root_cause: focus.1.root_cause.clone(),
            });

            let refined = tokio::select! {
                biased;
                reason = token.cancelled() => return Err(Error::Cancelled(reason.to_string())),
                refined = self.generator.refine(request, context, &focus.0, &focus.1, &earlier, attempt) => refined,
            };
            let candidate = match refined {
                Ok(candidate) => candidate,
                Err(failure) => {
                    report.generation_failures.push(failure);
                    continue;
                }
            };
            report.candidates.push(candidate.clone());

            let Some((tested, warnings)) = self
                .preflight(request, std::slice::from_ref(&candidate), snapshot, report)
                .pop()
            else {
                let reason = report
                    .validations
                    .last()
                    .and_then(|v| v.failure_reason())
                    .unwrap_or_else(|| "failed preflight".to_string());
                earlier.push(std::mem::replace(&mut focus, (candidate, FailureAnalysis::from_message(reason))));
                continue;
            };

            let run = self.sandboxes.run_candidate(&request.id, &tested, token).await;
            report.runs.push(run.clone());
            Self::check_cancelled(token)?;

            let score = self.scorer.score(&tested, warnings + run.lint_findings(), &run.result);
            scores.push(score.clone());
            survivors.push((tested.clone(), warnings));
            if self.scorer.is_viable(&score) {
                return Ok(Some(score));
            }
            let analysis = self.analyse(&run).await;
            earlier.push(std::mem::replace(&mut focus, (tested, analysis)));
        }
        Ok(None)
    }

    /// Approves on behalf of the policy and applies.
    ///
    /// Lock conflicts are retried with backoff up to `lock_retries` times;
    /// after that the proposal stays Approved and the conflict is returned
    /// as the apply error. Other deployment failures leave it RolledBack.
    async fn auto_apply(
        &self,
        request: &RemediationRequest,
        proposal: &Proposal,
        best: &Score,
        token: &CancelToken,
    ) -> Result<(Proposal, Option<String>)> {
        let reason = format!(
            "auto-apply policy: risk {} <= {}, pass ratio {:.2} >= {:.2}",
            best.risk, self.config.auto_apply.max_risk, best.test_ratio, self.config.auto_apply.min_pass_ratio
        );
        self.proposals.approve(&proposal.id, AUTO_APPLY_ACTOR, &reason)?;

        let retries = self.config.auto_apply.lock_retries;
        let mut backoff = self.budget.lock_backoff();
        let mut attempt = 0;
        loop {
            let error = match self.deployer.apply_cancellable(&proposal.id, token).await {
                Ok(applied) => return Ok((applied, None)),
                Err(Error::Cancelled(reason)) => return Err(Error::Cancelled(reason)),
                Err(Error::LockConflict { paths }) if attempt < retries => {
                    attempt += 1;
                    let delay = backoff.next_delay();
                    tracing::info!(
                        proposal_id = %proposal.id,
                        attempt,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        paths = ?paths,
                        "auto-apply waiting on locked paths"
                    );
                    tokio::select! {
                        biased;
                        reason = token.cancelled() => {
                            if let Err(e) = self.proposals.mark_rolled_back(
                                &proposal.id,
                                PIPELINE_ACTOR,
                                &format!("cancelled before apply: {}", reason),
                            ) {
                                tracing::error!(proposal_id = %proposal.id, error = %e, "failed to record cancelled apply");
                            }
                            return Err(Error::Cancelled(reason.to_string()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(e) => e,
            };

            let deferred = matches!(error, Error::LockConflict { .. });
            let reason = error.to_string();
            tracing::warn!(
                request_id = %request.id,
                proposal_id = %proposal.id,
                deferred,
                error = %reason,
                "auto-apply failed"
            );
            self.events.emit(PipelineEvent::AutoApplyFailed {
                request_id: request.id.clone(),
                proposal_id: proposal.id.clone(),
                reason: reason.clone(),
                deferred,
            });
            return Ok((self.proposals.get(&proposal.id)?, Some(reason)));
        }
    }

    /// Cancels a request.
    ///
    /// A running request is stopped and its sandboxes torn down. A finished
    /// request whose proposal still awaits approval is cancelled by
    /// rejecting that proposal. Approved or applied proposals cannot be
    /// cancelled this way, nor can a run that has already applied its fix.
    pub fn cancel(&self, request_id: &str, actor: &str, reason: &str) -> Result<RequestStatus> {
        let running = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(request_id)
            .cloned();
        if let Some(token) = running {
            let cancelled = token.cancel(CancelReason::Requested(format!("cancelled by {}: {}", actor, reason)));
            if !cancelled {
                if let Some(proposal_id) = token.committed_to() {
                    return Err(Error::InvalidTransition {
                        proposal_id,
                        from: ProposalState::Applied,
                        to: ProposalState::Rejected,
                    });
                }
            }
            tracing::info!(request_id = %request_id, actor = %actor, "cancelling running request");
            return Ok(RequestStatus::Cancelled);
        }

        let known = self.request(request_id).is_some();
        if !known && self.proposals.query(&ProposalQuery::for_request(request_id))?.is_empty() {
            return Err(Error::not_found("request", request_id));
        }
        let rejected = self.proposals.withdraw_request(request_id, actor, reason)?;
        tracing::info!(request_id = %request_id, actor = %actor, rejected = rejected.len(), "cancelled finished request");

        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(request) = requests.get_mut(request_id) {
            request.cancel(format!("cancelled by {}: {}", actor, reason));
        }
        Ok(RequestStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{FileOperation, RiskTier};
    use crate::context::LocalSearch;
    use crate::deploy::{SmokeResult, SyntaxSmokeCheck};
    use crate::events::{ChannelSink, NullSink};
    use crate::generator::tests::{candidate_json, ScriptedGenerator};
    use crate::generator::GenerationReply;
    use crate::proposal::MemoryProposalStore;
    use crate::sandbox::CopySandbox;
    use crate::test_runner::{TestCounts, TestInvocation};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Passes as many of 10 tests as `score.txt` says.
    #[derive(Default)]
    struct ScoreRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TestRunner for ScoreRunner {
        async fn run(&self, invocation: &TestInvocation) -> Result<TestCounts> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let score = std::fs::read_to_string(invocation.dir.join("score.txt"))?;
            Ok(TestCounts::new(score.trim().parse().unwrap_or(0), 10))
        }

        fn name(&self) -> &str {
            "score"
        }
    }

    /// Signals when the check starts, then never finishes in time.
    struct SlowSmoke {
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl SmokeCheck for SlowSmoke {
        async fn check(&self, _root: &Path, _operations: &[FileOperation]) -> SmokeResult {
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_secs(30)).await;
            SmokeResult::Passed
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    type Hook = Box<dyn Fn() + Send + Sync>;

    /// Runs a hook on the first event matching `trigger`.
    struct HookSink {
        trigger: fn(&PipelineEvent) -> bool,
        hook: Mutex<Option<Hook>>,
    }

    impl HookSink {
        fn new(trigger: fn(&PipelineEvent) -> bool) -> Self {
            Self {
                trigger,
                hook: Mutex::new(None),
            }
        }

        fn set(&self, hook: Hook) {
            *self.hook.lock().unwrap() = Some(hook);
        }
    }

    impl EventSink for HookSink {
        fn emit(&self, event: PipelineEvent) {
            if !(self.trigger)(&event) {
                return;
            }
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    struct Fixture {
        repo: TempDir,
        state: TempDir,
        runner: Arc<ScoreRunner>,
        store: Arc<MemoryProposalStore>,
        locks: PathLockManager,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = TempDir::new().unwrap();
            std::fs::write(repo.path().join("score.txt"), "0\n").unwrap();
            std::fs::write(repo.path().join("app.py"), "def total(xs):\n    return sum(xs)\n").unwrap();
            Self {
                repo,
                state: TempDir::new().unwrap(),
                runner: Arc::new(ScoreRunner::default()),
                store: Arc::new(MemoryProposalStore::new()),
                locks: PathLockManager::new(),
            }
        }

        fn config(&self) -> PipelineConfig {
            let mut config = PipelineConfig::default();
            config.sandbox.base_dir = Some(self.state.path().join("sandboxes"));
            config.sandbox.logs_dir = Some(self.state.path().join("logs"));
            config.deploy.backups_dir = Some(self.state.path().join("backups"));
            config
        }

        fn parts(&self, config: &PipelineConfig, generator: ScriptedGenerator) -> PipelineParts<CopySandbox> {
            let snapshot = Arc::new(CodebaseSnapshot::capture(self.repo.path(), &[]).unwrap());
            let provider = CopySandbox::new(
                self.repo.path().to_path_buf(),
                config.sandbox.base_dir.clone(),
                Vec::new(),
            );
            PipelineParts {
                generator: Arc::new(generator),
                search: Arc::new(LocalSearch::new(snapshot)),
                provider,
                test_runner: self.runner.clone(),
                store: self.store.clone(),
                smoke: Arc::new(SyntaxSmokeCheck),
                events: Arc::new(NullSink),
                locks: self.locks.clone(),
            }
        }

        fn pipeline(
            &self,
            config: PipelineConfig,
            generator: ScriptedGenerator,
        ) -> RemediationPipeline<CopySandbox> {
            let parts = self.parts(&config, generator);
            self.build(config, parts)
        }

        fn build(&self, config: PipelineConfig, parts: PipelineParts<CopySandbox>) -> RemediationPipeline<CopySandbox> {
            RemediationPipeline::new(self.repo.path().to_path_buf(), config, parts).unwrap()
        }

        fn auto_apply_config(&self) -> PipelineConfig {
            let mut config = self.config();
            config.auto_apply.enabled = true;
            config.auto_apply.max_risk = RiskTier::Low;
            config.auto_apply.min_pass_ratio = 0.8;
            config.generation.candidates = 1;
            config
        }

        fn live_score(&self) -> String {
            std::fs::read_to_string(self.repo.path().join("score.txt")).unwrap()
        }
    }

    fn scored(title: &str, score: &str) -> Vec<Result<GenerationReply>> {
        vec![Ok(GenerationReply::Text(candidate_json(title, "score.txt", score)))]
    }

    #[tokio::test]
    async fn best_candidate_awaits_approval() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(
            fx.config(),
            ScriptedGenerator::new(vec![scored("four", "4\n"), scored("nine", "9\n"), scored("seven", "7\n")]),
        );

        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();

        let proposal = report.proposal.expect("proposal");
        assert_eq!(proposal.title, "nine");
        assert_eq!(proposal.state, ProposalState::AwaitingApproval);
        assert_eq!(report.runs.len(), 3);
        assert_eq!(report.scores[0].passed, 9);
        assert_eq!(report.request.status, RequestStatus::Completed);
        assert_eq!(fx.live_score(), "0\n");
        assert_eq!(pipeline.proposals().pending().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn preflight_failures_never_reach_a_sandbox() {
        let fx = Fixture::new();
        let escape = || vec![Ok(GenerationReply::Text(candidate_json("escape", "../score.txt", "9\n")))];
        let pipeline = fx.pipeline(fx.config(), ScriptedGenerator::new(vec![escape(), escape(), escape()]));

        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();

        match report.outcome {
            PipelineOutcome::NoViableFix { reason } => assert!(reason.contains("preflight"), "{}", reason),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(report.validations.len(), 3);
        assert_eq!(fx.runner.calls.load(Ordering::SeqCst), 0);
        assert!(report.proposal.is_none());
    }

    #[tokio::test]
    async fn no_passing_tests_means_no_proposal() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(
            fx.config(),
            ScriptedGenerator::new(vec![scored("a", "0\n"), scored("b", "0\n"), scored("c", "0\n")]),
        );

        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();

        assert!(matches!(report.outcome, PipelineOutcome::NoViableFix { .. }));
        assert_eq!(report.runs.len(), 3);
        assert!(pipeline.proposals().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_apply_policy_deploys_low_risk_fixes() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.auto_apply.enabled = true;
        config.auto_apply.max_risk = RiskTier::Low;
        config.auto_apply.min_pass_ratio = 0.8;
        config.generation.candidates = 1;
        let pipeline = fx.pipeline(config, ScriptedGenerator::new(vec![scored("nine", "9\n")]));

        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();

        let proposal = report.proposal.expect("proposal");
        assert_eq!(proposal.state, ProposalState::Applied);
        assert_eq!(
            proposal.last_entry_for(ProposalState::Approved).map(|e| e.actor.as_str()),
            Some(AUTO_APPLY_ACTOR)
        );
        assert_eq!(fx.live_score(), "9\n");
        assert!(proposal.backup_id.is_some());
    }

    #[tokio::test]
    async fn cancelling_a_running_request_stops_it() {
        let fx = Fixture::new();
        let pipeline = Arc::new(fx.pipeline(fx.config(), ScriptedGenerator::new(Vec::new())));
        let request = RemediationRequest::new("raise the score");
        let request_id = request.id.clone();

        let run = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.submit(request).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.cancel(&request_id, "alice", "wrong ticket").unwrap();

        let report = run.await.unwrap().unwrap();
        match report.outcome {
            PipelineOutcome::Cancelled { reason } => assert!(reason.contains("alice"), "{}", reason),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(report.request.status, RequestStatus::Cancelled);
        assert_eq!(fx.runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.live_score(), "0\n");
    }

    #[tokio::test]
    async fn cancelling_after_generation_rejects_the_proposal() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(
            fx.config(),
            ScriptedGenerator::new(vec![scored("a", "8\n"), scored("b", "6\n"), scored("c", "5\n")]),
        );
        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();
        let proposal_id = report.proposal.as_ref().map(|p| p.id.clone()).unwrap();

        pipeline.cancel(&report.request.id, "alice", "not needed").unwrap();

        assert_eq!(pipeline.proposals().get(&proposal_id).unwrap().state, ProposalState::Rejected);
        assert_eq!(pipeline.request(&report.request.id).unwrap().status, RequestStatus::Cancelled);
        assert!(matches!(
            pipeline.cancel("missing", "alice", "x"),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn approved_proposals_cannot_be_cancelled() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(
            fx.config(),
            ScriptedGenerator::new(vec![scored("a", "8\n"), scored("b", "6\n"), scored("c", "5\n")]),
        );
        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();
        let proposal_id = report.proposal.as_ref().map(|p| p.id.clone()).unwrap();
        pipeline.proposals().approve(&proposal_id, "bob", "ship it").unwrap();

        let err = pipeline.cancel(&report.request.id, "alice", "changed my mind").unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let applied = pipeline.deployer().apply(&proposal_id).await.unwrap();
        assert_eq!(applied.state, ProposalState::Applied);
        assert_eq!(fx.live_score(), "8\n");
    }

    #[tokio::test]
    async fn at_most_n_candidates_reach_the_test_suite() {
        for n in 1..=3 {
            let fx = Fixture::new();
            let mut config = fx.config();
            config.generation.candidates = n;
            let escape = vec![Ok(GenerationReply::Text(candidate_json("escape", "../score.txt", "9\n")))];
            let pipeline = fx.pipeline(
                config,
                ScriptedGenerator::new(vec![scored("a", "5\n"), escape, scored("c", "7\n"), scored("d", "8\n")]),
            );

            let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();

            assert!(report.runs.len() <= n, "{} runs for {} candidates", report.runs.len(), n);
            assert_eq!(fx.runner.calls.load(Ordering::SeqCst), report.runs.len());
            assert_eq!(report.candidates.len(), n);
        }
    }

    #[tokio::test]
    async fn cancel_after_tests_creates_no_proposal() {
        let fx = Fixture::new();
        let config = fx.config();
        let sink = Arc::new(HookSink::new(|e| matches!(e, PipelineEvent::SandboxFinished { .. })));
        let mut parts = fx.parts(
            &config,
            ScriptedGenerator::new(vec![scored("a", "8\n"), scored("b", "6\n"), scored("c", "5\n")]),
        );
        parts.events = sink.clone();
        let pipeline = Arc::new(fx.build(config, parts));
        let request = RemediationRequest::new("raise the score");
        {
            let pipeline = Arc::downgrade(&pipeline);
            let request_id = request.id.clone();
            sink.set(Box::new(move || {
                if let Some(pipeline) = pipeline.upgrade() {
                    pipeline.cancel(&request_id, "alice", "fixed by hand").unwrap();
                }
            }));
        }

        let report = pipeline.submit(request).await.unwrap();

        assert!(matches!(report.outcome, PipelineOutcome::Cancelled { .. }));
        assert_eq!(report.request.status, RequestStatus::Cancelled);
        assert!(report.proposal.is_none());
        assert!(fx.store.query(&ProposalQuery::default()).unwrap().is_empty());
        assert_eq!(fx.live_score(), "0\n");
    }

    #[tokio::test]
    async fn cancel_racing_publication_rejects_the_proposal() {
        let fx = Fixture::new();
        let config = fx.config();
        let sink = Arc::new(HookSink::new(|e| {
            matches!(
                e,
                PipelineEvent::ProposalStateChanged {
                    to: ProposalState::AwaitingApproval,
                    ..
                }
            )
        }));
        let mut parts = fx.parts(
            &config,
            ScriptedGenerator::new(vec![scored("a", "8\n"), scored("b", "6\n"), scored("c", "5\n")]),
        );
        parts.events = sink.clone();
        let pipeline = Arc::new(fx.build(config, parts));
        let request = RemediationRequest::new("raise the score");
        {
            let pipeline = Arc::downgrade(&pipeline);
            let request_id = request.id.clone();
            sink.set(Box::new(move || {
                if let Some(pipeline) = pipeline.upgrade() {
                    pipeline.cancel(&request_id, "alice", "duplicate").unwrap();
                }
            }));
        }

        let report = pipeline.submit(request).await.unwrap();

        assert!(matches!(report.outcome, PipelineOutcome::Cancelled { .. }));
        let proposal = report.proposal.expect("proposal");
        assert_eq!(proposal.state, ProposalState::Rejected);
        let entry = proposal.last_entry_for(ProposalState::Rejected).unwrap();
        assert_eq!(entry.actor, PIPELINE_ACTOR);
        assert!(entry.reason.contains("alice"), "{}", entry.reason);
        assert!(pipeline.proposals().pending().unwrap().is_empty());
        assert_eq!(fx.live_score(), "0\n");
    }

    #[tokio::test]
    async fn cancel_during_auto_apply_restores_the_tree() {
        let fx = Fixture::new();
        let config = fx.auto_apply_config();
        let entered = Arc::new(Notify::new());
        let mut parts = fx.parts(&config, ScriptedGenerator::new(vec![scored("nine", "9\n")]));
        parts.smoke = Arc::new(SlowSmoke {
            entered: Arc::clone(&entered),
        });
        let pipeline = Arc::new(fx.build(config, parts));
        let request = RemediationRequest::new("raise the score");
        let request_id = request.id.clone();

        let run = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.submit(request).await })
        };
        entered.notified().await;
        assert_eq!(fx.live_score(), "9\n");
        assert_eq!(
            pipeline.cancel(&request_id, "alice", "wrong ticket").unwrap(),
            RequestStatus::Cancelled
        );

        let report = run.await.unwrap().unwrap();
        assert!(matches!(report.outcome, PipelineOutcome::Cancelled { .. }));
        assert_eq!(report.request.status, RequestStatus::Cancelled);
        assert_eq!(report.proposal.map(|p| p.state), Some(ProposalState::RolledBack));
        assert_eq!(fx.live_score(), "0\n");
    }

    #[tokio::test]
    async fn applied_runs_refuse_cancellation() {
        let fx = Fixture::new();
        let config = fx.auto_apply_config();
        let sink = Arc::new(HookSink::new(|e| {
            matches!(
                e,
                PipelineEvent::ProposalStateChanged {
                    to: ProposalState::Applied,
                    ..
                }
            )
        }));
        let mut parts = fx.parts(&config, ScriptedGenerator::new(vec![scored("nine", "9\n")]));
        parts.events = sink.clone();
        let pipeline = Arc::new(fx.build(config, parts));
        let request = RemediationRequest::new("raise the score");
        let refused = Arc::new(Mutex::new(None));
        {
            let pipeline = Arc::downgrade(&pipeline);
            let request_id = request.id.clone();
            let refused = Arc::clone(&refused);
            sink.set(Box::new(move || {
                if let Some(pipeline) = pipeline.upgrade() {
                    let result = pipeline.cancel(&request_id, "alice", "too late");
                    *refused.lock().unwrap() = Some(result.is_err());
                }
            }));
        }

        let report = pipeline.submit(request).await.unwrap();

        assert_eq!(*refused.lock().unwrap(), Some(true));
        assert_eq!(report.request.status, RequestStatus::Completed);
        assert_eq!(report.proposal.map(|p| p.state), Some(ProposalState::Applied));
        assert_eq!(fx.live_score(), "9\n");
    }

    #[tokio::test]
    async fn held_locks_defer_auto_apply() {
        let fx = Fixture::new();
        let mut config = fx.auto_apply_config();
        config.budget.lock_wait_secs = 0;
        config.auto_apply.lock_retries = 2;
        let (sink, mut events) = ChannelSink::channel(64);
        let mut parts = fx.parts(&config, ScriptedGenerator::new(vec![scored("nine", "9\n")]));
        parts.events = Arc::new(sink);
        let pipeline = fx.build(config, parts);
        let _held = fx.locks.try_acquire(&["score.txt".to_string()]).expect("lease");

        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();

        match &report.outcome {
            PipelineOutcome::ProposalCreated {
                state, apply_error, ..
            } => {
                assert_eq!(*state, ProposalState::Approved);
                assert!(apply_error.as_deref().unwrap_or("").contains("score.txt"), "{:?}", apply_error);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(report.request.status, RequestStatus::Completed);
        assert_eq!(fx.live_score(), "0\n");

        let mut deferred = None;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::AutoApplyFailed { deferred: d, .. } = event {
                deferred = Some(d);
            }
        }
        assert_eq!(deferred, Some(true));
    }

    #[tokio::test]
    async fn released_locks_let_auto_apply_retry() {
        let fx = Fixture::new();
        let mut config = fx.auto_apply_config();
        config.budget.lock_wait_secs = 0;
        config.budget.lock_backoff_initial_ms = 100;
        config.auto_apply.lock_retries = 4;
        let pipeline = fx.pipeline(config, ScriptedGenerator::new(vec![scored("nine", "9\n")]));
        let held = fx.locks.try_acquire(&["score.txt".to_string()]).expect("lease");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(held);
        });

        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();

        assert_eq!(report.proposal.map(|p| p.state), Some(ProposalState::Applied));
        assert_eq!(fx.live_score(), "9\n");
    }

    #[tokio::test]
    async fn refix_loop_recovers_from_failing_candidates() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.generation.candidates = 1;
        config.generation.refix_attempts = 2;
        let pipeline = fx.pipeline(
            config,
            ScriptedGenerator::new(vec![scored("zero", "0\n"), scored("still zero", "0\n"), scored("eight", "8\n")]),
        );

        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();

        let proposal = report.proposal.expect("proposal");
        assert_eq!(proposal.title, "eight");
        assert_eq!(proposal.state, ProposalState::AwaitingApproval);
        assert_eq!(report.candidates.len(), 3);
        assert_eq!(report.runs.len(), 3);
        assert_eq!(report.scores[0].passed, 8);
    }

    #[tokio::test]
    async fn refix_attempts_are_bounded() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.generation.candidates = 1;
        config.generation.refix_attempts = 1;
        let pipeline = fx.pipeline(
            config,
            ScriptedGenerator::new(vec![scored("zero", "0\n"), scored("still zero", "0\n"), scored("eight", "8\n")]),
        );

        let report = pipeline.submit(RemediationRequest::new("raise the score")).await.unwrap();

        assert!(matches!(report.outcome, PipelineOutcome::NoViableFix { .. }));
        assert_eq!(report.runs.len(), 2);
        assert_eq!(fx.runner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.auto_apply.min_pass_ratio = 2.0;
        let snapshot = Arc::new(CodebaseSnapshot::capture(fx.repo.path(), &[]).unwrap());
        let parts = PipelineParts {
            generator: Arc::new(ScriptedGenerator::new(Vec::new())),
            search: Arc::new(LocalSearch::new(snapshot)),
            provider: CopySandbox::new(fx.repo.path().to_path_buf(), None, Vec::new()),
            test_runner: fx.runner.clone(),
            store: fx.store.clone(),
            smoke: Arc::new(SyntaxSmokeCheck),
            events: Arc::new(NullSink),
            locks: PathLockManager::new(),
        };
        assert!(matches!(
            RemediationPipeline::new(fx.repo.path().to_path_buf(), config, parts),
            Err(Error::Config(_))
        ));
    }
}
