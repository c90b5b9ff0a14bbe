//! Jobline - single-job CI runner CLI
//!
//! The `jobline` command runs the test job for a repository event.
//!
//! ## Commands
//!
//! - `run`: Evaluate the trigger and, if it matches, run the whole job
//! - `plan`: Show the services and the step order of a workflow
//! - `trigger`: Evaluate the trigger only
//! - `runs`: List or inspect recorded runs
//! - `gate`: Re-evaluate the verdict of a recorded run

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jobline_ci::{
    BuiltinWorkflow, FsDependencyCache, JobGate, JobOptions, JobPipeline, JobReport, StepOutcome,
    UploadOutcome,
};
use jobline_core::{
    current_branch, load_workflow, EventType, TriggerDecision, TriggerEvent, Workflow,
};
use jobline_state::{FsRunLedger, RunId, RunLedger};
use serde_json::Value;
use tracing::{info, Level};

/// Lines of stderr printed for each failed step.
const FAILURE_TAIL_LINES: usize = 30;

#[derive(Parser)]
#[command(name = "jobline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Single-job CI runner: services, tests, coverage", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job for a repository event
    Run {
        #[command(flatten)]
        source: WorkflowArgs,

        #[command(flatten)]
        event: EventArgs,

        /// Container name prefix for service containers
        #[arg(long, default_value = "jobline")]
        container_prefix: String,

        /// Disable the dependency cache
        #[arg(long)]
        no_cache: bool,

        /// Override the workflow's global timeout (seconds)
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Print the final report as JSON on stdout
        #[arg(long)]
        report_json: bool,
    },

    /// Show services, step order and parallelizable levels
    Plan {
        #[command(flatten)]
        source: WorkflowArgs,
    },

    /// Evaluate the trigger for an event without running anything
    Trigger {
        #[command(flatten)]
        source: WorkflowArgs,

        #[command(flatten)]
        event: EventArgs,
    },

    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Evaluate the gate over a recorded run
    Gate {
        /// Run ID
        run_id: String,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recorded runs (newest first)
    List {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show a run and its events
    Show {
        /// Run ID
        run_id: String,
    },
}

#[derive(Args)]
struct WorkflowArgs {
    /// Workflow YAML file (default: built-in Django test workflow)
    #[arg(short = 'f', long)]
    workflow: Option<PathBuf>,

    /// Workspace path (default: the workflow's workspace)
    #[arg(short, long)]
    workspace: Option<PathBuf>,
}

#[derive(Args)]
struct EventArgs {
    /// Event type: push or pull_request
    #[arg(long, default_value = "push")]
    event: String,

    /// Pushed branch, or the pull request's base branch (default: current git branch)
    #[arg(long)]
    branch: Option<String>,

    /// Pull request action
    #[arg(long, default_value = "synchronize")]
    pr_action: String,

    /// Commit SHA (default: workspace HEAD)
    #[arg(long)]
    sha: Option<String>,

    /// Webhook payload file; overrides --event/--branch/--pr-action/--sha
    #[arg(long)]
    event_file: Option<PathBuf>,

    /// Webhook event name for --event-file
    #[arg(long, env = "JOBLINE_EVENT_NAME")]
    event_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    jobline_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            source,
            event,
            container_prefix,
            no_cache,
            timeout_secs,
            report_json,
        } => {
            cmd_run(
                &source,
                &event,
                &container_prefix,
                no_cache,
                timeout_secs,
                report_json,
            )
            .await
        }
        Commands::Plan { source } => cmd_plan(&source).map(|_| ExitCode::SUCCESS),
        Commands::Trigger { source, event } => cmd_trigger(&source, &event),
        Commands::Runs { action } => {
            let ledger = open_ledger()?;
            match action {
                RunsAction::List { limit } => cmd_runs_list(&ledger, limit).await?,
                RunsAction::Show { run_id } => cmd_runs_show(&ledger, &run_id).await?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Gate { run_id } => {
            let ledger = open_ledger()?;
            cmd_gate(&ledger, &run_id).await
        }
    }
}

fn open_ledger() -> Result<FsRunLedger> {
    FsRunLedger::from_env().context("Failed to open run ledger")
}

/// Workflow from `--workflow`, or the built-in one, with `--workspace` applied.
fn resolve_workflow(source: &WorkflowArgs) -> Result<Workflow> {
    let mut workflow = match &source.workflow {
        Some(path) => load_workflow(path)
            .with_context(|| format!("Failed to load workflow {}", path.display()))?,
        None => Workflow::builtin(),
    };
    if let Some(workspace) = &source.workspace {
        workflow.workspace = workspace.clone();
    }
    Ok(workflow)
}

fn resolve_event(args: &EventArgs, workspace: &Path) -> Result<TriggerEvent> {
    if let Some(path) = &args.event_file {
        let name = args
            .event_name
            .as_deref()
            .context("--event-name (or JOBLINE_EVENT_NAME) is required with --event-file")?;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file {}", path.display()))?;
        let payload: Value = serde_json::from_str(&raw).context("Event file is not valid JSON")?;
        return Ok(TriggerEvent::from_webhook(name, &payload)?);
    }

    let event_type: EventType = args.event.parse()?;
    let branch = match &args.branch {
        Some(branch) => branch.clone(),
        None => current_branch(workspace)
            .context("Cannot detect the current branch; pass --branch")?,
    };
    let mut event = match event_type {
        EventType::Push => TriggerEvent::push(branch),
        EventType::PullRequest => TriggerEvent::pull_request(branch, args.pr_action.as_str()),
    };
    if let Some(sha) = &args.sha {
        event = event.with_sha(sha);
    }
    Ok(event)
}

/// Run the job and record its execution
async fn cmd_run(
    source: &WorkflowArgs,
    event_args: &EventArgs,
    container_prefix: &str,
    no_cache: bool,
    timeout_secs: Option<u64>,
    report_json: bool,
) -> Result<ExitCode> {
    let workflow = resolve_workflow(source)?;
    let event = resolve_event(event_args, &workflow.workspace)?;
    let ledger = Arc::new(open_ledger()?);

    let mut options = JobOptions::docker(container_prefix).in_workspace(&workflow.workspace);
    if !no_cache {
        options = options.with_cache(Arc::new(FsDependencyCache::from_env()));
    }
    if let Some(secs) = timeout_secs {
        options = options.with_timeout(Duration::from_secs(secs));
    }

    info!(workflow = %workflow.name, event = %event, "starting job");
    println!("Workflow: {}", workflow.name);
    println!("Event: {}", event);
    println!("Workspace: {}", workflow.workspace.display());
    println!();

    let report = JobPipeline::run(ledger.clone(), &workflow, &event, options)
        .await
        .context("Job failed to run")?;

    if report_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report(&report));
    }

    if let Some(run_id) = &report.run_id {
        let events = ledger.get_events(&RunId(run_id.clone())).await?;
        let verdict = JobGate::evaluate(&events);
        jobline_core::obs::emit_gate_evaluated(run_id, verdict.passed, verdict.violations.len());
        if !report_json {
            println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
        }
    }

    Ok(ExitCode::from(exit_status(report.exit_code())))
}

/// Job exit codes fit in a byte; anything else reports as a plain failure.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn render_report(report: &JobReport) -> String {
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    if let Some(reason) = &report.skip_reason {
        line(format!("Skipped: {reason}"));
        return out;
    }

    if let Some(run_id) = &report.run_id {
        line(format!("Run ID: {run_id}"));
    }
    let mark = if report.status.is_success() { "✓" } else { "✗" };
    line(format!(
        "Status: {mark} {} (exit code {})",
        report.status.as_str().to_uppercase(),
        report.exit_code()
    ));
    line(format!("Duration: {}ms", report.duration_ms));
    line(String::new());

    if !report.services.is_empty() {
        line("Services:".to_string());
        for svc in &report.services {
            let mark = if svc.healthy { "✓" } else { "✗" };
            let detail = svc.error.as_deref().unwrap_or("ready");
            line(format!(
                "  {mark} {} ({} attempt(s), {}ms): {detail}",
                svc.service, svc.attempts, svc.waited_ms
            ));
        }
        line(String::new());
    }

    for step in &report.steps {
        let mark = match step.outcome {
            StepOutcome::Passed => "✓",
            StepOutcome::Cached => "≡",
            StepOutcome::Skipped => "-",
            _ => "✗",
        };
        line(format!(
            "  {mark} {} [{}] ({}ms, exit code: {}, {})",
            step.step_id,
            step.phase,
            step.duration_ms,
            step.exit_code,
            step.outcome.as_str()
        ));
        if step.outcome.is_failure() {
            for l in step.stderr_tail(FAILURE_TAIL_LINES).lines() {
                line(format!("      | {l}"));
            }
        }
    }

    if let Some(tests) = &report.tests {
        line(String::new());
        line(format!("Tests: {tests}"));
    }

    line(String::new());
    line(format!(
        "Summary: {}/{} steps passed",
        report.passed_count(),
        report.steps.len()
    ));
    line(match &report.upload {
        UploadOutcome::Succeeded => "Coverage upload: ✓ uploaded".to_string(),
        UploadOutcome::Failed { error } => format!("Coverage upload: ✗ failed ({error})"),
        UploadOutcome::Skipped { reason } => format!("Coverage upload: skipped ({reason})"),
        UploadOutcome::NotReached => "Coverage upload: not reached".to_string(),
    });
    out
}

/// Print services and step order
fn cmd_plan(source: &WorkflowArgs) -> Result<()> {
    let workflow = resolve_workflow(source)?;
    let plan = workflow.plan()?;
    let graph = workflow.graph()?;

    println!("Workflow: {} (timeout {}m)", workflow.name, workflow.timeout_minutes);
    println!("Digest: {}", workflow.digest()?.short());
    println!();

    println!("Services:");
    for svc in &workflow.services {
        let policy = svc.readiness();
        println!(
            "  {} {} on {} (probe: {}, {}x every {}s, {}s timeout)",
            svc.name,
            svc.image,
            svc.port,
            policy.probe.describe(),
            policy.retries,
            policy.interval_secs,
            policy.timeout_secs
        );
    }
    println!();

    println!("Steps:");
    for (i, step) in plan.iter().enumerate() {
        let deps = graph.dependencies(&step.id);
        let deps = if deps.is_empty() {
            String::new()
        } else {
            format!(" after {}", deps.join(", "))
        };
        let flags = match (step.enabled, step.cache_key_file.as_ref()) {
            (false, _) => " [disabled]".to_string(),
            (true, Some(lock)) => format!(" [cached by {}]", lock.display()),
            (true, None) => String::new(),
        };
        println!(
            "  {:>2}. {} [{}] {}{deps}{flags}",
            i + 1,
            step.id,
            step.phase,
            step.action.describe()
        );
    }
    println!();

    println!("Levels:");
    for (i, level) in graph.levels()?.iter().enumerate() {
        println!("  {}: {}", i + 1, level.join(", "));
    }
    Ok(())
}

/// Evaluate the trigger only
fn cmd_trigger(source: &WorkflowArgs, event_args: &EventArgs) -> Result<ExitCode> {
    let workflow = resolve_workflow(source)?;
    let event = resolve_event(event_args, &workflow.workspace)?;
    match workflow.on.evaluate(&event) {
        TriggerDecision::Run => println!("✓ {event}: job runs"),
        TriggerDecision::Skip { reason } => println!("- {event}: skipped ({reason})"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_runs_list(ledger: &dyn RunLedger, limit: usize) -> Result<()> {
    let runs = ledger.list_runs(None).await?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in runs.iter().take(limit) {
        let outcome = run
            .summary
            .as_ref()
            .map(|s| format!("{} (exit {})", s.outcome, s.exit_code))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<10} {:<20} {}  {}",
            run.run_id,
            format!("{:?}", run.status),
            run.metadata.job_name,
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            outcome
        );
    }
    Ok(())
}

async fn cmd_runs_show(ledger: &dyn RunLedger, run_id: &str) -> Result<()> {
    let id = RunId(run_id.to_string());
    let run = ledger
        .get_run(&id)
        .await
        .with_context(|| format!("Run not found: {run_id}"))?;
    let events = ledger.get_events(&id).await?;

    println!("Run ID: {}", run.run_id);
    println!("Job: {}", run.metadata.job_name);
    println!("Status: {:?}", run.status);
    if let Some(sha) = &run.metadata.git_sha {
        println!("Git SHA: {sha}");
    }
    println!("Workflow digest: {}", run.workflow_digest.short());
    println!();
    for event in &events {
        println!(
            "  [{:>3}] {} {} {}",
            event.seq,
            event.timestamp.format("%H:%M:%S%.3f"),
            event.kind,
            event.payload
        );
    }
    Ok(())
}

/// Re-evaluate the gate; exits non-zero on failure
async fn cmd_gate(ledger: &dyn RunLedger, run_id: &str) -> Result<ExitCode> {
    let events = ledger
        .get_events(&RunId(run_id.to_string()))
        .await
        .with_context(|| format!("Run not found: {run_id}"))?;
    let verdict = JobGate::evaluate(&events);
    jobline_core::obs::emit_gate_evaluated(run_id, verdict.passed, verdict.violations.len());

    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    if let Some(class) = verdict.failure_class {
        println!("Failure class: {}", class.as_str());
    }
    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {violation}");
        }
    }
    Ok(if verdict.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
