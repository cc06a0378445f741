//! Pipeline configuration: loading, defaults and validation.
//!
//! Every field has a serde default, so a partial TOML or YAML file only needs
//! to name what it changes. Validate before building a pipeline to catch
//! errors early.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::ExecutionBudget;
use crate::candidate::RiskTier;
use crate::error::{Error, Result};
use crate::preflight::{default_forbidden_patterns, ForbiddenPattern, PreflightValidator};
use crate::scorer::ScoringWeights;
use crate::snapshot::DEFAULT_IGNORED_DIRS;

/// Directory under the repository root holding proposals, backups and logs.
pub const STATE_DIR: &str = ".remediation";

/// Validation report containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ConfigReport {
    /// Fatal problems.
    pub errors: Vec<String>,
    /// Non-fatal problems.
    pub warnings: Vec<String>,
}

impl ConfigReport {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another report into this one.
    pub fn merge(&mut self, other: ConfigReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ConfigReport;
}

fn default_candidates() -> usize {
    3
}

fn default_generation_capacity() -> usize {
    3
}

fn default_temperature() -> f32 {
    0.8
}

fn default_temperature_spread() -> f32 {
    0.15
}

fn default_refix_temperature() -> f32 {
    0.2
}

/// Upper bound for `generation.refix_attempts`.
pub const MAX_REFIX_ATTEMPTS: u32 = 5;

/// Candidate generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Candidates requested per remediation request.
    #[serde(default = "default_candidates")]
    pub candidates: usize,
    /// Generation calls in flight at once for one request.
    #[serde(default = "default_generation_capacity")]
    pub capacity: usize,
    /// Base sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Temperature offset between consecutive slots.
    #[serde(default = "default_temperature_spread")]
    pub temperature_spread: f32,
    /// External generator command (program followed by arguments).
    #[serde(default)]
    pub command: Vec<String>,
    /// Corrective re-generations after every tested candidate failed.
    /// 0 disables the re-fix loop.
    #[serde(default)]
    pub refix_attempts: u32,
    /// Sampling temperature for corrective re-generations.
    #[serde(default = "default_refix_temperature")]
    pub refix_temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
            capacity: default_generation_capacity(),
            temperature: default_temperature(),
            temperature_spread: default_temperature_spread(),
            command: Vec::new(),
            refix_attempts: 0,
            refix_temperature: default_refix_temperature(),
        }
    }
}

impl Validate for GenerationConfig {
    fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();

        if self.candidates == 0 {
            report.add_error("generation.candidates must be at least 1");
        }
        if self.candidates > 10 {
            report.add_warning("generation.candidates > 10 multiplies sandbox cost");
        }
        if self.capacity == 0 {
            report.add_error("generation.capacity must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            report.add_error("generation.temperature must be between 0.0 and 2.0");
        }
        if self.temperature_spread < 0.0 {
            report.add_error("generation.temperature_spread cannot be negative");
        }
        if self.refix_attempts > MAX_REFIX_ATTEMPTS {
            report.add_error(format!(
                "generation.refix_attempts must be at most {}",
                MAX_REFIX_ATTEMPTS
            ));
        }
        if !(0.0..=2.0).contains(&self.refix_temperature) {
            report.add_error("generation.refix_temperature must be between 0.0 and 2.0");
        }
        if self.candidates > 1 && self.temperature_spread == 0.0 && self.temperature == 0.0 {
            report.add_warning(
                "generation.temperature and temperature_spread are both 0; candidates will be near-duplicates",
            );
        }

        report
    }
}

fn default_max_excerpts() -> usize {
    8
}

fn default_max_excerpt_chars() -> usize {
    4000
}

fn default_max_examples() -> usize {
    3
}

/// Context assembly settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_excerpts")]
    pub max_excerpts: usize,
    /// Excerpts longer than this are truncated.
    #[serde(default = "default_max_excerpt_chars")]
    pub max_excerpt_chars: usize,
    /// Previously applied proposals offered as working examples.
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_excerpts: default_max_excerpts(),
            max_excerpt_chars: default_max_excerpt_chars(),
            max_examples: default_max_examples(),
        }
    }
}

impl Validate for ContextConfig {
    fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        if self.max_excerpts == 0 {
            report.add_warning("context.max_excerpts = 0 sends no code to the generator");
        }
        if self.max_excerpt_chars < 200 {
            report.add_warning("context.max_excerpt_chars < 200 truncates excerpts heavily");
        }
        report
    }
}

fn default_ignored_dirs() -> Vec<String> {
    DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect()
}

/// Preflight validation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightConfig {
    #[serde(default = "default_forbidden_patterns")]
    pub forbidden_patterns: Vec<ForbiddenPattern>,
    /// Missing directory levels a single create may introduce.
    #[serde(default)]
    pub max_new_directory_depth: usize,
    /// Directory names excluded from snapshots, search and sandbox copies.
    #[serde(default = "default_ignored_dirs")]
    pub ignored_dirs: Vec<String>,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            forbidden_patterns: default_forbidden_patterns(),
            max_new_directory_depth: 0,
            ignored_dirs: default_ignored_dirs(),
        }
    }
}

impl Validate for PreflightConfig {
    fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        if let Err(e) = PreflightValidator::new(self) {
            report.add_error(e.to_string());
        }
        if self.forbidden_patterns.is_empty() {
            report.add_warning("preflight.forbidden_patterns is empty; no content is denied");
        }
        if !self.ignored_dirs.iter().any(|d| d == ".git") {
            report.add_warning("preflight.ignored_dirs does not include .git");
        }
        report
    }
}

/// How sandboxes isolate the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Private file copy.
    #[default]
    Copy,
    /// Detached git worktree.
    Worktree,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_test_command() -> Vec<String> {
    vec!["cargo".to_string(), "test".to_string()]
}

/// Sandbox and test execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub isolation: Isolation,
    /// Sandboxes running at once for one request.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Test suite command (program followed by arguments).
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,
    /// Where sandboxes are created. Defaults to the system temp directory.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Where raw test logs go. Defaults to `<repo>/.remediation/logs`.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    /// Extra environment variables for test runs.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Linter run in the sandbox after the tests. Empty disables linting.
    #[serde(default)]
    pub lint_command: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: Isolation::default(),
            max_concurrent: default_max_concurrent(),
            test_command: default_test_command(),
            base_dir: None,
            logs_dir: None,
            env: HashMap::new(),
            lint_command: Vec::new(),
        }
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        if self.max_concurrent == 0 {
            report.add_error("sandbox.max_concurrent must be at least 1");
        }
        if self.test_command.first().map_or(true, |p| p.trim().is_empty()) {
            report.add_error("sandbox.test_command cannot be empty");
        }
        if self.lint_command.first().is_some_and(|p| p.trim().is_empty()) {
            report.add_error("sandbox.lint_command has an empty program");
        }
        if self.max_concurrent > 16 {
            report.add_warning("sandbox.max_concurrent > 16 may exhaust disk or memory");
        }
        report
    }
}

/// Candidate ranking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: ScoringWeights,
    /// Minimum pass ratio for a candidate to be viable (in addition to at
    /// least one passing test).
    #[serde(default)]
    pub min_pass_ratio: f64,
}

impl Validate for ScoringConfig {
    fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        let w = &self.weights;
        for (name, value) in [
            ("test_ratio", w.test_ratio),
            ("risk", w.risk),
            ("cleanliness", w.cleanliness),
            ("files_touched", w.files_touched),
        ] {
            if value < 0.0 {
                report.add_error(format!("scoring.weights.{} cannot be negative", name));
            }
        }
        if w.test_ratio == 0.0 {
            report.add_warning("scoring.weights.test_ratio = 0 ignores test results when ranking");
        }
        if !(0.0..=1.0).contains(&self.min_pass_ratio) {
            report.add_error("scoring.min_pass_ratio must be between 0.0 and 1.0");
        }
        report
    }
}

fn default_backup_grace_hours() -> u64 {
    72
}

/// Deployment settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Smoke check command. Empty means re-parse touched files.
    #[serde(default)]
    pub smoke_command: Vec<String>,
    /// How long backups of applied proposals are kept for manual rollback.
    #[serde(default = "default_backup_grace_hours")]
    pub backup_grace_hours: u64,
    /// Defaults to `<repo>/.remediation/backups`.
    #[serde(default)]
    pub backups_dir: Option<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            smoke_command: Vec::new(),
            backup_grace_hours: default_backup_grace_hours(),
            backups_dir: None,
        }
    }
}

impl DeployConfig {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.backup_grace_hours).unwrap_or(i64::MAX / 3600))
    }
}

impl Validate for DeployConfig {
    fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        if self.backup_grace_hours == 0 {
            report.add_warning("deploy.backup_grace_hours = 0 disables manual rollback");
        }
        if self
            .smoke_command
            .first()
            .is_some_and(|p| p.trim().is_empty())
        {
            report.add_error("deploy.smoke_command has an empty program");
        }
        report
    }
}

fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_retries() -> u32 {
    1
}

fn default_search_timeout_secs() -> u64 {
    10
}

fn default_sandbox_timeout_secs() -> u64 {
    600
}

fn default_smoke_timeout_secs() -> u64 {
    120
}

fn default_request_timeout_secs() -> u64 {
    3600
}

fn default_lint_timeout_secs() -> u64 {
    30
}

fn default_lock_wait_secs() -> u64 {
    300
}

fn default_lock_backoff_initial_ms() -> u64 {
    50
}

fn default_lock_backoff_max_ms() -> u64 {
    5000
}

/// Timeouts and retry counts, as written in config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub generation_retries: u32,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_sandbox_timeout_secs")]
    pub sandbox_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub sandbox_retries: u32,
    #[serde(default = "default_smoke_timeout_secs")]
    pub smoke_timeout_secs: u64,
    #[serde(default = "default_lint_timeout_secs")]
    pub lint_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
    #[serde(default = "default_lock_backoff_initial_ms")]
    pub lock_backoff_initial_ms: u64,
    #[serde(default = "default_lock_backoff_max_ms")]
    pub lock_backoff_max_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: default_generation_timeout_secs(),
            generation_retries: default_retries(),
            search_timeout_secs: default_search_timeout_secs(),
            sandbox_timeout_secs: default_sandbox_timeout_secs(),
            sandbox_retries: default_retries(),
            smoke_timeout_secs: default_smoke_timeout_secs(),
            lint_timeout_secs: default_lint_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            lock_wait_secs: default_lock_wait_secs(),
            lock_backoff_initial_ms: default_lock_backoff_initial_ms(),
            lock_backoff_max_ms: default_lock_backoff_max_ms(),
        }
    }
}

impl BudgetConfig {
    /// Builds the runtime budget.
    pub fn to_budget(&self) -> ExecutionBudget {
        ExecutionBudget {
            generation_timeout: Duration::from_secs(self.generation_timeout_secs),
            generation_retries: self.generation_retries,
            search_timeout: Duration::from_secs(self.search_timeout_secs),
            sandbox_timeout: Duration::from_secs(self.sandbox_timeout_secs),
            sandbox_retries: self.sandbox_retries,
            smoke_timeout: Duration::from_secs(self.smoke_timeout_secs),
            lint_timeout: Duration::from_secs(self.lint_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            lock_wait: Duration::from_secs(self.lock_wait_secs),
            lock_backoff_initial: Duration::from_millis(self.lock_backoff_initial_ms),
            lock_backoff_max: Duration::from_millis(self.lock_backoff_max_ms),
        }
    }
}

impl Validate for BudgetConfig {
    fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();

        for (name, value) in [
            ("generation_timeout_secs", self.generation_timeout_secs),
            ("search_timeout_secs", self.search_timeout_secs),
            ("sandbox_timeout_secs", self.sandbox_timeout_secs),
            ("smoke_timeout_secs", self.smoke_timeout_secs),
            ("lint_timeout_secs", self.lint_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("lock_backoff_initial_ms", self.lock_backoff_initial_ms),
        ] {
            if value == 0 {
                report.add_error(format!("budget.{} must be greater than 0", name));
            }
        }
        if self.lock_backoff_initial_ms > self.lock_backoff_max_ms {
            report.add_error("budget.lock_backoff_initial_ms must not exceed lock_backoff_max_ms");
        }
        if self.request_timeout_secs < self.sandbox_timeout_secs {
            report.add_warning("budget.request_timeout_secs is shorter than one sandbox run");
        }
        if self.generation_retries > 3 {
            report.add_warning("budget.generation_retries > 3 may waste generation calls");
        }

        report
    }
}

fn default_auto_apply_risk() -> RiskTier {
    RiskTier::Low
}

fn default_auto_apply_ratio() -> f64 {
    0.95
}

fn default_lock_retries() -> u32 {
    3
}

/// Optional policy that approves low-risk, well-tested proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoApplyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Highest risk tier that may be auto-approved.
    #[serde(default = "default_auto_apply_risk")]
    pub max_risk: RiskTier,
    #[serde(default = "default_auto_apply_ratio")]
    pub min_pass_ratio: f64,
    /// Extra lock waits before an auto-apply is deferred to a human.
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
}

impl Default for AutoApplyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_risk: default_auto_apply_risk(),
            min_pass_ratio: default_auto_apply_ratio(),
            lock_retries: default_lock_retries(),
        }
    }
}

impl AutoApplyConfig {
    /// True if a candidate with this risk and pass ratio may skip review.
    pub fn permits(&self, risk: RiskTier, pass_ratio: f64) -> bool {
        self.enabled && risk <= self.max_risk && pass_ratio >= self.min_pass_ratio
    }
}

impl Validate for AutoApplyConfig {
    fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        if !(0.0..=1.0).contains(&self.min_pass_ratio) {
            report.add_error("auto_apply.min_pass_ratio must be between 0.0 and 1.0");
        }
        if self.lock_retries > 10 {
            report.add_warning("auto_apply.lock_retries > 10 can hold a request for a long time");
        }
        if self.enabled {
            report.add_warning("auto_apply is enabled; matching proposals are applied without human review");
            if self.max_risk == RiskTier::High {
                report.add_warning("auto_apply.max_risk = high allows any candidate to be auto-approved");
            }
        }
        report
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub preflight: PreflightConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub auto_apply: AutoApplyConfig,
}

impl PipelineConfig {
    /// Loads a TOML or YAML file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "toml" => toml::from_str(&text)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            "yaml" | "yml" => serde_yaml::from_str(&text)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            other => Err(Error::Config(format!(
                "unsupported config format '{}' (expected .toml, .yaml or .yml)",
                other
            ))),
        }
    }

    /// Loads `path` if given, otherwise returns defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn budget(&self) -> ExecutionBudget {
        self.budget.to_budget()
    }

    pub fn state_dir(repo: &Path) -> PathBuf {
        repo.join(STATE_DIR)
    }

    pub fn proposals_dir(&self, repo: &Path) -> PathBuf {
        Self::state_dir(repo).join("proposals")
    }

    pub fn backups_dir(&self, repo: &Path) -> PathBuf {
        self.deploy
            .backups_dir
            .clone()
            .unwrap_or_else(|| Self::state_dir(repo).join("backups"))
    }

    /// Lease files shared by every process deploying to `repo`.
    pub fn locks_dir(&self, repo: &Path) -> PathBuf {
        Self::state_dir(repo).join("locks")
    }

    pub fn logs_dir(&self, repo: &Path) -> PathBuf {
        self.sandbox
            .logs_dir
            .clone()
            .unwrap_or_else(|| Self::state_dir(repo).join("logs"))
    }

    pub fn sandbox_base_dir(&self) -> PathBuf {
        self.sandbox
            .base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("remediation-sandboxes"))
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        report.merge(self.generation.validate());
        report.merge(self.context.validate());
        report.merge(self.preflight.validate());
        report.merge(self.sandbox.validate());
        report.merge(self.scoring.validate());
        report.merge(self.deploy.validate());
        report.merge(self.budget.validate());
        report.merge(self.auto_apply.validate());

        if self.generation.capacity > self.generation.candidates {
            report.add_warning("generation.capacity exceeds generation.candidates");
        }
        if self.auto_apply.enabled && self.auto_apply.min_pass_ratio < self.scoring.min_pass_ratio {
            report.add_warning(
                "auto_apply.min_pass_ratio is below scoring.min_pass_ratio and has no effect",
            );
        }

        report
    }
}
