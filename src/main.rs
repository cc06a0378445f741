//! Remediation Drive CLI
//!
//! Submits defect reports to the pipeline and drives proposals through
//! review, deployment and rollback.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use remediation::config::Isolation;
use remediation::deploy::{CommandSmokeCheck, SyntaxSmokeCheck};
use remediation::events::TracingSink;
use remediation::pipeline::{PipelineOutcome, PipelineParts, RemediationPipeline};
use remediation::{
    BackupStore, CodebaseSnapshot, CommandGenerator, CommandTestRunner, CopySandbox, Deployer,
    FileProposalStore, LocalSearch, PathLockManager, PipelineConfig, Proposal, ProposalManager,
    ProposalQuery, ProposalState, RemediationRequest, Result, SandboxProvider, Severity,
    SmokeCheck, WorktreeSandbox,
};

#[derive(Parser, Debug)]
#[command(
    name = "remediate",
    about = "Generate, test and apply fixes for reported defects under human approval"
)]
struct Cli {
    /// Repository to operate on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    /// Pipeline configuration (.toml, .yaml or .yml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a defect report through the pipeline.
    Run(RunArgs),
    /// List proposals awaiting approval.
    Pending,
    /// List proposals, optionally filtered.
    List(ListArgs),
    /// Show one proposal.
    Show(ShowArgs),
    /// Approve a proposal and apply it.
    Approve(ApproveArgs),
    /// Reject a proposal.
    Reject(DecisionArgs),
    /// Apply an already approved proposal.
    Apply(IdArgs),
    /// Restore the files an applied proposal changed.
    Rollback(DecisionArgs),
    /// Withdraw a request whose proposals are still awaiting approval.
    Cancel(DecisionArgs),
    /// Delete backups that can no longer be restored.
    PruneBackups,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Free-text description of the problem.
    description: String,
    #[arg(long)]
    severity: Option<Severity>,
    #[arg(long)]
    category: Option<String>,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long)]
    request: Option<String>,
    #[arg(long)]
    state: Option<ProposalState>,
}

#[derive(Args, Debug)]
struct ShowArgs {
    id: String,
    /// Print the full diff.
    #[arg(long)]
    diff: bool,
}

#[derive(Args, Debug)]
struct IdArgs {
    id: String,
}

#[derive(Args, Debug)]
struct DecisionArgs {
    id: String,
    #[arg(long)]
    actor: String,
    #[arg(long, default_value = "")]
    reason: String,
}

#[derive(Args, Debug)]
struct ApproveArgs {
    #[command(flatten)]
    decision: DecisionArgs,
    /// Record the approval without applying.
    #[arg(long)]
    no_apply: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let repo = std::fs::canonicalize(&cli.repo)?;
    let config = PipelineConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            let mut request = RemediationRequest::new(args.description);
            if let Some(severity) = args.severity {
                request = request.with_severity(severity);
            }
            if let Some(category) = args.category {
                request = request.with_category(category);
            }
            let sandbox_base = Some(config.sandbox_base_dir());
            match config.sandbox.isolation {
                Isolation::Copy => {
                    let provider = CopySandbox::new(repo.clone(), sandbox_base, config.preflight.ignored_dirs.clone());
                    submit(repo, config, provider, request, cli.json).await
                }
                Isolation::Worktree => {
                    let provider = WorktreeSandbox::new(repo.clone(), sandbox_base);
                    submit(repo, config, provider, request, cli.json).await
                }
            }
        }
        Commands::Pending => {
            let manager = proposal_manager(&repo, &config)?;
            print_list(&manager.pending()?, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::List(args) => {
            let manager = proposal_manager(&repo, &config)?;
            let query = ProposalQuery {
                request_id: args.request,
                state: args.state,
                ..ProposalQuery::default()
            };
            print_list(&manager.query(&query)?, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Show(args) => {
            let manager = proposal_manager(&repo, &config)?;
            let proposal = manager.get(&args.id)?;
            if cli.json {
                print_json(&proposal)?;
            } else {
                print_proposal(&proposal, args.diff);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Approve(args) => {
            let manager = Arc::new(proposal_manager(&repo, &config)?);
            let d = args.decision;
            let approved = manager.approve(&d.id, &d.actor, &d.reason)?;
            if args.no_apply {
                print_outcome(&approved, cli.json)?;
                return Ok(ExitCode::SUCCESS);
            }
            let deployer = deployer(&repo, &config, manager);
            deploy(&deployer, &d.id, cli.json).await
        }
        Commands::Reject(d) => {
            let manager = proposal_manager(&repo, &config)?;
            print_outcome(&manager.reject(&d.id, &d.actor, &d.reason)?, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Apply(args) => {
            let deployer = deployer(&repo, &config, Arc::new(proposal_manager(&repo, &config)?));
            deploy(&deployer, &args.id, cli.json).await
        }
        Commands::Rollback(d) => {
            let deployer = deployer(&repo, &config, Arc::new(proposal_manager(&repo, &config)?));
            let rolled_back = deployer.rollback(&d.id, &d.actor, &d.reason).await?;
            print_outcome(&rolled_back, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cancel(d) => {
            let manager = proposal_manager(&repo, &config)?;
            let rejected = manager.withdraw_request(&d.id, &d.actor, &d.reason)?;
            if rejected.is_empty() && manager.query(&ProposalQuery::for_request(&d.id))?.is_empty() {
                eprintln!("no proposals for request {}", d.id);
                return Ok(ExitCode::FAILURE);
            }
            print_list(&rejected, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::PruneBackups => {
            let deployer = deployer(&repo, &config, Arc::new(proposal_manager(&repo, &config)?));
            let removed = deployer.prune_backups()?;
            if cli.json {
                print_json(&serde_json::json!({ "removed": removed }))?;
            } else {
                println!("Removed {} backup(s)", removed);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn proposal_manager(repo: &Path, config: &PipelineConfig) -> Result<ProposalManager> {
    let store = FileProposalStore::open(config.proposals_dir(repo))?;
    Ok(ProposalManager::new(Arc::new(store)).with_events(Arc::new(TracingSink)))
}

fn smoke_check(config: &PipelineConfig) -> Arc<dyn SmokeCheck> {
    match CommandSmokeCheck::from_argv(&config.deploy.smoke_command) {
        Some(check) => Arc::new(check),
        None => Arc::new(SyntaxSmokeCheck),
    }
}

fn deployer(repo: &Path, config: &PipelineConfig, manager: Arc<ProposalManager>) -> Deployer {
    Deployer::new(
        repo.to_path_buf(),
        manager,
        BackupStore::new(config.backups_dir(repo)),
        smoke_check(config),
        config.budget(),
        config.deploy.grace_period(),
    )
    .with_locks(PathLockManager::persistent(config.locks_dir(repo)))
}

async fn submit<P>(
    repo: PathBuf,
    config: PipelineConfig,
    provider: P,
    request: RemediationRequest,
    json: bool,
) -> Result<ExitCode>
where
    P: SandboxProvider + Clone + 'static,
{
    let snapshot = Arc::new(CodebaseSnapshot::capture(&repo, &config.preflight.ignored_dirs)?);
    let parts = PipelineParts {
        generator: Arc::new(CommandGenerator::from_argv(&config.generation.command)?),
        search: Arc::new(LocalSearch::new(snapshot)),
        provider,
        test_runner: Arc::new(CommandTestRunner::from_argv(&config.sandbox.test_command)?),
        store: Arc::new(FileProposalStore::open(config.proposals_dir(&repo))?),
        smoke: smoke_check(&config),
        events: Arc::new(TracingSink),
        locks: PathLockManager::persistent(config.locks_dir(&repo)),
    };
    let pipeline = RemediationPipeline::new(repo, config, parts)?;

    let report = pipeline.submit(request).await?;
    if json {
        print_json(&report)?;
    } else {
        println!("Request {}: {:?}", report.request.id, report.request.status);
        println!(
            "  candidates: {} generated, {} failed",
            report.candidates.len(),
            report.generation_failures.len()
        );
        for failure in &report.generation_failures {
            println!("    slot {}: {} ({} attempts)", failure.slot, failure.error, failure.attempts);
        }
        for validation in &report.validations {
            match validation.failure_reason() {
                Some(reason) => println!("    {} rejected: {}", validation.candidate_id, reason),
                None => println!("    {} passed preflight", validation.candidate_id),
            }
        }
        for score in &report.scores {
            println!(
                "    {} {}/{} tests, risk {}, score {:.2}",
                score.candidate_id, score.passed, score.total, score.risk, score.value
            );
        }
        if let Some(proposal) = &report.proposal {
            println!();
            print_proposal(proposal, true);
        }
        if let PipelineOutcome::ProposalCreated {
            apply_error: Some(error),
            ..
        } = &report.outcome
        {
            eprintln!("auto-apply failed: {}", error);
        }
    }

    Ok(match report.outcome {
        PipelineOutcome::ProposalCreated { .. } => ExitCode::SUCCESS,
        PipelineOutcome::NoViableFix { reason } => {
            eprintln!("no viable fix: {}", reason);
            ExitCode::from(2)
        }
        PipelineOutcome::Cancelled { reason } => {
            eprintln!("cancelled: {}", reason);
            ExitCode::from(3)
        }
    })
}

async fn deploy(deployer: &Deployer, id: &str, json: bool) -> Result<ExitCode> {
    let applied = deployer.apply(id).await?;
    print_outcome(&applied, json)?;
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| remediation::Error::Store(format!("failed to serialize output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn print_outcome(proposal: &Proposal, json: bool) -> Result<()> {
    if json {
        return print_json(proposal);
    }
    println!("{} is now {}", proposal.id, proposal.state);
    Ok(())
}

fn print_list(proposals: &[Proposal], json: bool) -> Result<()> {
    if json {
        return print_json(&proposals);
    }
    if proposals.is_empty() {
        println!("No proposals.");
    }
    for p in proposals {
        println!(
            "{}  {:<18} {:<6} {}/{}  {}",
            p.id,
            p.state,
            p.risk,
            p.test_summary.passed,
            p.test_summary.total,
            p.title
        );
    }
    Ok(())
}

fn print_proposal(p: &Proposal, with_diff: bool) {
    println!("Proposal {}", p.id);
    println!("  title:    {}", p.title);
    println!("  state:    {}", p.state);
    println!("  risk:     {}", p.risk);
    println!("  request:  {}", p.request_id);
    println!("  tests:    {}/{}", p.test_summary.passed, p.test_summary.total);
    println!("  files:    {}", p.touched_paths().join(", "));
    if let Some(backup) = &p.backup_id {
        println!("  backup:   {}", backup);
    }
    if !p.narrative.is_empty() {
        println!();
        println!("{}", p.narrative);
    }
    println!();
    println!("History:");
    for entry in &p.audit {
        let from = entry.from.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        println!("  {}  {} -> {}  by {}: {}", entry.at.to_rfc3339(), from, entry.to, entry.actor, entry.reason);
    }
    if with_diff {
        println!();
        println!("{}", p.diff);
    }
}
