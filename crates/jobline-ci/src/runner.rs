//! Step execution: processes under a timeout, and config overlays.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use jobline_core::domain::step::{StepAction, StepConfig, StepPhase};
use jobline_core::Workflow;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::summary::TestSummary;

/// Exit code reported for a step killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Everything a step needs from the job, passed explicitly.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Directory steps run in (and resolve relative paths against).
    pub workspace: PathBuf,

    /// Job-level environment layered over the inherited process environment.
    pub env: BTreeMap<String, String>,

    /// Variables removed from every step's environment.
    pub withheld: Vec<String>,
}

impl JobContext {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            env: BTreeMap::new(),
            withheld: Vec::new(),
        }
    }

    /// Context for `workflow`, withholding the upload token variable.
    pub fn for_workflow(workflow: &Workflow, workspace: &Path) -> Self {
        let mut ctx = Self::new(workspace);
        ctx.env = workflow.env.clone();
        if let Some(upload) = &workflow.upload {
            ctx.withheld.push(upload.token_env.clone());
        }
        ctx
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn withhold(mut self, var: impl Into<String>) -> Self {
        self.withheld.push(var.into());
        self
    }

    fn dir_for(&self, step: &StepConfig) -> PathBuf {
        match &step.working_dir {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        }
    }
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Passed,
    Failed,
    TimedOut,
    /// The process could not be started, or the overlay could not be applied.
    Errored,
    /// Satisfied by the dependency cache without running.
    Cached,
    Skipped,
}

impl StepOutcome {
    /// The step actually ran to an observable end (whatever the result).
    pub fn executed(&self) -> bool {
        matches!(
            self,
            StepOutcome::Passed | StepOutcome::Failed | StepOutcome::TimedOut | StepOutcome::Errored
        )
    }

    /// Dependents gated on success may run.
    pub fn satisfied(&self) -> bool {
        matches!(self, StepOutcome::Passed | StepOutcome::Cached)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StepOutcome::Failed | StepOutcome::TimedOut | StepOutcome::Errored
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Passed => "passed",
            StepOutcome::Failed => "failed",
            StepOutcome::TimedOut => "timed_out",
            StepOutcome::Errored => "errored",
            StepOutcome::Cached => "cached",
            StepOutcome::Skipped => "skipped",
        }
    }
}

/// Result of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub phase: StepPhase,
    /// Exit code (0 = success; -1 when the step never produced one).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
    pub outcome: StepOutcome,
    /// Parsed counts, for test-phase steps whose output carries a summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestSummary>,
}

impl StepResult {
    /// Whether this step passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    pub fn skipped(step: &StepConfig, reason: impl Into<String>) -> Self {
        Self::without_process(step, StepOutcome::Skipped, reason.into())
    }

    pub fn cached(step: &StepConfig, signature: &str) -> Self {
        let mut result = Self::without_process(step, StepOutcome::Cached, String::new());
        result.stdout = format!("dependency cache hit ({signature})");
        result.exit_code = 0;
        result.success = true;
        result
    }

    pub fn errored(step: &StepConfig, error: &anyhow::Error, duration_ms: u64) -> Self {
        let mut result = Self::without_process(step, StepOutcome::Errored, format!("{error:#}"));
        result.duration_ms = duration_ms;
        result
    }

    fn without_process(step: &StepConfig, outcome: StepOutcome, stderr: String) -> Self {
        Self {
            step_id: step.id.clone(),
            phase: step.phase,
            exit_code: -1,
            stdout: String::new(),
            stderr,
            duration_ms: 0,
            success: false,
            outcome,
            tests: None,
        }
    }

    /// Last `lines` lines of stderr, for event payloads.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Executes a single step.
pub struct StepRunner;

impl StepRunner {
    /// Run `step` to completion in `ctx`.
    ///
    /// A non-zero exit or an expired timeout is a normal result; `Err` means
    /// the step could not be carried out at all (spawn failure, overlay I/O).
    pub async fn execute(step: &StepConfig, ctx: &JobContext) -> anyhow::Result<StepResult> {
        match &step.action {
            StepAction::Exec { command } => Self::run_process(step, command, ctx).await,
            StepAction::Overlay {
                source,
                destination,
            } => Self::apply_overlay(step, &ctx.workspace.join(source), &ctx.workspace.join(destination)).await,
        }
    }

    async fn run_process(
        step: &StepConfig,
        command: &[String],
        ctx: &JobContext,
    ) -> anyhow::Result<StepResult> {
        let start = Instant::now();

        let Some((exe, args)) = command.split_first() else {
            anyhow::bail!("step {} has an empty command", step.id);
        };

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .current_dir(ctx.dir_for(step))
            .envs(&ctx.env)
            .envs(&step.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in &ctx.withheld {
            cmd.env_remove(var);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to start `{exe}` for step {}", step.id))?;

        let output = if step.timeout_secs > 0 {
            match tokio::time::timeout(
                Duration::from_secs(step.timeout_secs),
                child.wait_with_output(),
            )
            .await
            {
                Ok(output) => output?,
                Err(_) => {
                    return Ok(StepResult {
                        step_id: step.id.clone(),
                        phase: step.phase,
                        exit_code: TIMEOUT_EXIT_CODE,
                        stdout: String::new(),
                        stderr: format!(
                            "step {} timed out after {} seconds",
                            step.id, step.timeout_secs
                        ),
                        duration_ms: start.elapsed().as_millis() as u64,
                        success: false,
                        outcome: StepOutcome::TimedOut,
                        tests: None,
                    });
                }
            }
        } else {
            child.wait_with_output().await?
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let success = output.status.success();
        let tests = match step.phase {
            StepPhase::Test => TestSummary::parse(&stdout, &stderr),
            _ => None,
        };

        Ok(StepResult {
            step_id: step.id.clone(),
            phase: step.phase,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            success,
            outcome: if success {
                StepOutcome::Passed
            } else {
                StepOutcome::Failed
            },
            tests,
        })
    }

    async fn apply_overlay(
        step: &StepConfig,
        source: &Path,
        destination: &Path,
    ) -> anyhow::Result<StepResult> {
        let start = Instant::now();
        let (src, dst) = (source.to_path_buf(), destination.to_path_buf());
        let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .context("overlay task panicked")?
            .with_context(|| {
                format!(
                    "overlay {} -> {} failed",
                    source.display(),
                    destination.display()
                )
            })?;

        Ok(StepResult {
            step_id: step.id.clone(),
            phase: step.phase,
            exit_code: 0,
            stdout: format!("copied {copied} file(s) into {}", destination.display()),
            stderr: String::new(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: true,
            outcome: StepOutcome::Passed,
            tests: None,
        })
    }
}

/// Copy every file under `src` into `dst`, replacing existing files.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<usize> {
    if !src.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("overlay source {} is not a directory", src.display()),
        ));
    }
    std::fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
