//! Job orchestration and run recording.
//!
//! One job: evaluate the trigger, provision services, run the steps in
//! dependency order, upload coverage, tear the services down. Everything
//! after the trigger check is recorded into the run ledger.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use jobline_core::domain::run::EventKind;
use jobline_core::domain::step::{RunCondition, StepConfig, StepPhase};
use jobline_core::{obs, JobRunRecorder, TriggerDecision, TriggerEvent, Workflow, METRICS};
use jobline_state::{RunLedger, RunMetadata, RunSummary};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::coverage::CoverageArtifact;
use crate::provision::{
    DefaultProbeRunner, DockerRuntime, ProbeRunner, ProvisionFailure, Provisioner,
    ServiceReadiness, ServiceRuntime, StartedServices,
};
use crate::runner::{JobContext, StepOutcome, StepResult, StepRunner};
use crate::summary::TestSummary;
use crate::toolchain::{DependencyCache, LockSignature};
use crate::upload::{
    spawn_upload, CoverageUploader, HttpUploader, Secret, UploadContext, UploadError,
    UploadOutcome,
};

/// Lines of step output kept in event payloads.
const OUTPUT_TAIL_LINES: usize = 40;

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The trigger did not match; nothing ran.
    Skipped,
    Passed,
    ProvisioningFailed,
    ToolchainFailed,
    PreparationFailed,
    TestsFailed,
    TimedOut,
}

impl JobStatus {
    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobStatus::Skipped | JobStatus::Passed => 0,
            JobStatus::TestsFailed => 1,
            JobStatus::PreparationFailed => 2,
            JobStatus::ProvisioningFailed => 3,
            JobStatus::ToolchainFailed => 4,
            JobStatus::TimedOut => 124,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    /// Status for a job whose first failing step belongs to `phase`.
    pub fn for_phase(phase: StepPhase) -> Self {
        match phase {
            StepPhase::Toolchain => JobStatus::ToolchainFailed,
            StepPhase::Preparation => JobStatus::PreparationFailed,
            StepPhase::Test | StepPhase::Report => JobStatus::TestsFailed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Skipped => "skipped",
            JobStatus::Passed => "passed",
            JobStatus::ProvisioningFailed => "provisioning_failed",
            JobStatus::ToolchainFailed => "toolchain_failed",
            JobStatus::PreparationFailed => "preparation_failed",
            JobStatus::TestsFailed => "tests_failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a complete job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// Ledger run id; `None` when the trigger skipped the job.
    pub run_id: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub services: Vec<ServiceReadiness>,
    pub steps: Vec<StepResult>,
    pub upload: UploadOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestSummary>,
    pub duration_ms: u64,
    pub workflow_digest: String,
}

impl JobReport {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn passed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.satisfied()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.is_failure()).count()
    }

    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == id)
    }
}

/// Collaborators and overrides for one job.
pub struct JobOptions {
    pub runtime: Arc<dyn ServiceRuntime>,
    pub prober: Arc<dyn ProbeRunner>,
    /// Defaults to an HTTP uploader for the workflow's endpoint.
    pub uploader: Option<Arc<dyn CoverageUploader>>,
    pub cache: Option<Arc<dyn DependencyCache>>,
    /// Defaults to the variable named by the workflow's `token_env`.
    pub token: Option<Secret>,
    /// Defaults to the workflow's workspace.
    pub workspace: Option<PathBuf>,
    /// Defaults to the workflow's `timeout_minutes`.
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn new(runtime: Arc<dyn ServiceRuntime>, prober: Arc<dyn ProbeRunner>) -> Self {
        Self {
            runtime,
            prober,
            uploader: None,
            cache: None,
            token: None,
            workspace: None,
            timeout: None,
        }
    }

    /// Docker-backed services with the default probes.
    pub fn docker(container_prefix: impl Into<String>) -> Self {
        let runtime: Arc<dyn ServiceRuntime> = Arc::new(DockerRuntime::new(container_prefix));
        let prober = Arc::new(DefaultProbeRunner::new(runtime.clone()));
        Self::new(runtime, prober)
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn CoverageUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn DependencyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_token(mut self, token: Secret) -> Self {
        self.token = Some(token);
        self
    }

    pub fn in_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Job orchestrator.
pub struct JobPipeline;

impl JobPipeline {
    /// Run `workflow` for `event`, recording every lifecycle event into `ledger`.
    ///
    /// A trigger mismatch returns a `Skipped` report without touching the
    /// ledger. Job failures are reported through [`JobReport::status`];
    /// `Err` is reserved for an invalid workflow or a ledger failure.
    pub async fn run(
        ledger: Arc<dyn RunLedger>,
        workflow: &Workflow,
        event: &TriggerEvent,
        options: JobOptions,
    ) -> anyhow::Result<JobReport> {
        let start = Instant::now();
        let digest = workflow.digest()?;

        if let TriggerDecision::Skip { reason } = workflow.on.evaluate(event) {
            obs::emit_job_skipped(&workflow.name, &event.to_string(), &reason);
            return Ok(JobReport {
                run_id: None,
                status: JobStatus::Skipped,
                skip_reason: Some(reason),
                services: Vec::new(),
                steps: Vec::new(),
                upload: UploadOutcome::NotReached,
                tests: None,
                duration_ms: start.elapsed().as_millis() as u64,
                workflow_digest: digest.to_string(),
            });
        }

        let plan = workflow
            .plan()
            .with_context(|| format!("workflow `{}` cannot be planned", workflow.name))?;
        let workspace = options
            .workspace
            .clone()
            .unwrap_or_else(|| workflow.workspace.clone());
        let git_sha = event
            .sha
            .clone()
            .or_else(|| jobline_core::capture_head_sha(&workspace).ok());

        let metadata = RunMetadata {
            git_sha: git_sha.clone(),
            job_name: workflow.name.clone(),
            tags: json!({
                "trigger": event.event_type.as_str(),
                "branch": &event.branch,
                "steps": plan.iter().map(|s| &s.id).collect::<Vec<_>>(),
                "services": workflow.services.iter().map(|s| &s.name).collect::<Vec<_>>(),
            }),
        };
        let recorder = JobRunRecorder::start(ledger, &digest, metadata).await?;
        let run_id = recorder.run_id().to_string();
        let span = obs::job_span(&run_id, &workflow.name);

        let job = JobExecution {
            workflow,
            event,
            plan,
            recorder,
            options,
            workspace,
            git_sha,
            run_id,
            digest: digest.to_string(),
            start,
        };
        job.execute().instrument(span).await
    }
}

/// Mutable job state that survives the global timeout.
#[derive(Default)]
struct Progress {
    /// Set before provisioning starts; filled as each container starts.
    services: Option<StartedServices>,
    readiness: Vec<ServiceReadiness>,
    steps: Vec<StepResult>,
    upload: Option<UploadOutcome>,
    upload_task: Option<JoinHandle<Result<(), UploadError>>>,
}

impl Progress {
    /// Cancel an upload still in flight.
    fn abort_upload(&mut self) {
        if let Some(task) = self.upload_task.take() {
            task.abort();
        }
    }
}

struct JobExecution<'a> {
    workflow: &'a Workflow,
    event: &'a TriggerEvent,
    plan: Vec<&'a StepConfig>,
    recorder: JobRunRecorder,
    options: JobOptions,
    workspace: PathBuf,
    git_sha: Option<String>,
    run_id: String,
    digest: String,
    start: Instant,
}

impl JobExecution<'_> {
    async fn execute(self) -> anyhow::Result<JobReport> {
        let trigger = self.event.to_string();
        self.recorder
            .emit(
                EventKind::JobStarted,
                json!({
                    "trigger": &trigger,
                    "branch": &self.event.branch,
                    "sha": &self.git_sha,
                }),
            )
            .await?;
        obs::emit_job_started(&self.run_id, &self.workflow.name, &trigger);

        let deadline = self
            .options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(self.workflow.timeout_minutes * 60));
        let mut progress = Progress::default();
        let outcome = tokio::time::timeout(deadline, self.drive(&mut progress)).await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                progress.abort_upload();
                if let Some(services) = progress.services.take() {
                    services.teardown().await;
                }
                let summary = RunSummary {
                    total_events: self.recorder.events_recorded(),
                    outcome: "errored".to_string(),
                    exit_code: 1,
                    duration_ms: self.start.elapsed().as_millis() as u64,
                    success: false,
                };
                if let Err(finish) = self.recorder.finish_err(summary).await {
                    obs::emit_run_finalize_error(&self.run_id, &finish);
                }
                return Err(e);
            }
            Err(_) => {
                progress.abort_upload();
                warn!(timeout_secs = deadline.as_secs(), "job exceeded its global timeout");
                // Recorded best effort; teardown below must still run.
                if let Err(e) = self
                    .recorder
                    .emit(
                        EventKind::JobTimedOut,
                        json!({ "timeout_secs": deadline.as_secs() }),
                    )
                    .await
                {
                    obs::emit_run_finalize_error(&self.run_id, &e);
                }
                JobStatus::TimedOut
            }
        };

        if let Some(services) = progress.services.take() {
            let count = services.len();
            let errors = services.teardown().await;
            self.recorder
                .emit(
                    EventKind::ServicesTornDown,
                    json!({ "stopped": count, "errors": errors }),
                )
                .await?;
        }

        let upload = progress.upload.unwrap_or(UploadOutcome::NotReached);
        let tests = progress.steps.iter().find_map(|r| r.tests);
        let duration_ms = self.start.elapsed().as_millis() as u64;

        self.recorder
            .emit(
                EventKind::JobFinished,
                json!({
                    "status": status.as_str(),
                    "exit_code": status.exit_code(),
                    "tests": tests,
                    "upload": &upload,
                    "duration_ms": duration_ms,
                }),
            )
            .await?;

        let summary = RunSummary {
            total_events: self.recorder.events_recorded(),
            outcome: status.as_str().to_string(),
            exit_code: status.exit_code(),
            duration_ms,
            success: status.is_success(),
        };
        let finalized = match status {
            JobStatus::Passed => self.recorder.finish_ok(summary).await,
            JobStatus::TimedOut => self.recorder.finish_cancelled(summary).await,
            _ => self.recorder.finish_err(summary).await,
        };
        if let Err(e) = finalized {
            obs::emit_run_finalize_error(&self.run_id, &e);
        }

        METRICS.flush();
        obs::emit_job_finished(&self.run_id, status.as_str(), status.exit_code(), duration_ms);

        Ok(JobReport {
            run_id: Some(self.run_id),
            status,
            skip_reason: None,
            services: progress.readiness,
            steps: progress.steps,
            upload,
            tests,
            duration_ms,
            workflow_digest: self.digest,
        })
    }

    async fn drive(&self, progress: &mut Progress) -> anyhow::Result<JobStatus> {
        if !self.provision(progress).await? {
            return Ok(JobStatus::ProvisioningFailed);
        }

        let artifact = CoverageArtifact::for_workflow(self.workflow, &self.workspace);
        let stale_report = match artifact.discard().await {
            Ok(removed) => {
                if removed {
                    debug!(path = %artifact.path().display(), "removed coverage report from an earlier run");
                }
                false
            }
            Err(e) => {
                warn!(path = %artifact.path().display(), error = %e, "cannot remove earlier coverage report");
                true
            }
        };

        let ctx = JobContext::for_workflow(self.workflow, &self.workspace);
        let mut outcomes: HashMap<&str, StepOutcome> = HashMap::new();
        let mut status = JobStatus::Passed;

        for step in &self.plan {
            let failed_already = status != JobStatus::Passed;
            let result = self.run_step(step, &ctx, &outcomes, failed_already).await?;
            if result.outcome.is_failure() && status == JobStatus::Passed {
                status = JobStatus::for_phase(step.phase);
                info!(step = %step.id, status = %status, "first failing step");
            }
            outcomes.insert(step.id.as_str(), result.outcome);
            progress.steps.push(result);
        }

        progress.upload = Some(
            self.upload(&progress.steps, stale_report, &mut progress.upload_task)
                .await?,
        );
        Ok(status)
    }

    /// Returns `false` when provisioning failed and the job must stop.
    async fn provision(&self, progress: &mut Progress) -> anyhow::Result<bool> {
        let services = &self.workflow.services;
        for svc in services {
            self.recorder
                .emit(
                    EventKind::ServiceStarting {
                        service: svc.name.clone(),
                    },
                    json!({
                        "image": &svc.image,
                        "port": svc.port,
                        "probe": svc.readiness().probe.describe(),
                    }),
                )
                .await?;
        }

        let provisioner = Provisioner::new(self.options.runtime.clone(), self.options.prober.clone());
        progress.services = Some(provisioner.started());
        let (provisioned, error) = match provisioner.provision_all(services).await {
            Ok(provisioned) => (provisioned, None),
            Err(ProvisionFailure { error, services }) => (services, Some(error)),
        };

        for readiness in provisioned.readiness() {
            let payload = json!({
                "attempts": readiness.attempts,
                "waited_ms": readiness.waited_ms,
                "error": &readiness.error,
            });
            let kind = if readiness.healthy {
                EventKind::ServiceHealthy {
                    service: readiness.service.clone(),
                }
            } else {
                EventKind::ServiceUnhealthy {
                    service: readiness.service.clone(),
                }
            };
            self.recorder.emit(kind, payload).await?;
        }
        progress.readiness = provisioned.readiness().to_vec();

        match error {
            None => Ok(true),
            Some(error) => {
                warn!(error = %error, "provisioning failed; no steps will run");
                self.recorder
                    .emit(
                        EventKind::ProvisioningFailed,
                        json!({ "error": error.to_string() }),
                    )
                    .await?;
                Ok(false)
            }
        }
    }

    async fn run_step(
        &self,
        step: &StepConfig,
        ctx: &JobContext,
        outcomes: &HashMap<&str, StepOutcome>,
        failed_already: bool,
    ) -> anyhow::Result<StepResult> {
        if let Some(reason) = skip_reason(step, outcomes, failed_already) {
            self.recorder
                .emit(
                    EventKind::StepSkipped {
                        step_id: step.id.clone(),
                    },
                    json!({ "phase": step.phase, "reason": &reason }),
                )
                .await?;
            return Ok(StepResult::skipped(step, reason));
        }

        let signature = self.cache_signature(step).await;
        if let (Some(sig), Some(cache)) = (&signature, &self.options.cache) {
            if cache.contains(sig).await {
                METRICS.inc_steps_cached();
                self.recorder
                    .emit(
                        EventKind::StepCached {
                            step_id: step.id.clone(),
                        },
                        json!({ "phase": step.phase, "signature": sig.short() }),
                    )
                    .await?;
                return Ok(StepResult::cached(step, sig.short()));
            }
        }

        self.recorder
            .emit(
                EventKind::StepStarted {
                    step_id: step.id.clone(),
                },
                json!({
                    "name": step.display_name(),
                    "phase": step.phase,
                    "action": step.action.describe(),
                    "timeout_secs": step.timeout_secs,
                }),
            )
            .await?;
        METRICS.inc_steps();

        let started = Instant::now();
        let result = match StepRunner::execute(step, ctx).await {
            Ok(result) => result,
            Err(e) => StepResult::errored(step, &e, started.elapsed().as_millis() as u64),
        };
        obs::emit_step_finished(&step.id, result.exit_code, result.duration_ms, result.passed());

        let payload = json!({
            "phase": step.phase,
            "exit_code": result.exit_code,
            "outcome": result.outcome.as_str(),
            "duration_ms": result.duration_ms,
            "tests": result.tests,
            "stdout_tail": tail(&result.stdout, OUTPUT_TAIL_LINES),
            "stderr_tail": result.stderr_tail(OUTPUT_TAIL_LINES),
        });
        let step_id = step.id.clone();
        if result.passed() {
            self.recorder
                .emit(EventKind::StepPassed { step_id }, payload)
                .await?;
            if let (Some(sig), Some(cache)) = (&signature, &self.options.cache) {
                if let Err(e) = cache.store(sig).await {
                    warn!(step = %step.id, error = %e, "failed to store dependency cache marker");
                }
            }
        } else {
            self.recorder
                .emit(EventKind::StepFailed { step_id }, payload)
                .await?;
        }
        Ok(result)
    }

    async fn cache_signature(&self, step: &StepConfig) -> Option<LockSignature> {
        self.options.cache.as_ref()?;
        let lock = self.workspace.join(step.cache_key_file.as_ref()?);
        match LockSignature::compute(&lock).await {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(step = %step.id, lock = %lock.display(), error = %e, "lock file unreadable; caching disabled");
                None
            }
        }
    }

    /// Best-effort upload; the returned outcome never affects the status.
    async fn upload(
        &self,
        steps: &[StepResult],
        stale_report: bool,
        task: &mut Option<JoinHandle<Result<(), UploadError>>>,
    ) -> anyhow::Result<UploadOutcome> {
        let outcome = self.try_upload(steps, stale_report, task).await?;
        match &outcome {
            UploadOutcome::Succeeded => {
                self.recorder.emit(EventKind::UploadSucceeded, json!({})).await?;
            }
            UploadOutcome::Failed { error } => {
                obs::emit_upload_failed(error);
                self.recorder
                    .emit(EventKind::UploadFailed, json!({ "error": error }))
                    .await?;
            }
            UploadOutcome::Skipped { reason } => {
                self.recorder
                    .emit(EventKind::UploadSkipped, json!({ "reason": reason }))
                    .await?;
            }
            UploadOutcome::NotReached => {}
        }
        Ok(outcome)
    }

    async fn try_upload(
        &self,
        steps: &[StepResult],
        stale_report: bool,
        task: &mut Option<JoinHandle<Result<(), UploadError>>>,
    ) -> anyhow::Result<UploadOutcome> {
        let skipped = |reason: String| -> anyhow::Result<UploadOutcome> {
            Ok(UploadOutcome::Skipped { reason })
        };

        let Some(config) = self.workflow.upload.as_ref().filter(|c| c.enabled) else {
            return skipped("upload is not configured".to_string());
        };

        let report_ran = steps
            .iter()
            .filter(|r| r.phase == StepPhase::Report)
            .all(|r| r.outcome.executed())
            && steps
                .iter()
                .any(|r| matches!(r.phase, StepPhase::Test | StepPhase::Report) && r.outcome.executed());
        if !report_ran {
            return skipped("coverage report step did not run".to_string());
        }

        let artifact = CoverageArtifact::for_workflow(self.workflow, &self.workspace);
        if stale_report {
            return skipped(format!(
                "coverage report at {} may be left over from an earlier run",
                artifact.path().display()
            ));
        }
        if !artifact.exists() {
            warn!(path = %artifact.path().display(), "coverage report missing; upload skipped");
            return skipped(format!(
                "coverage report not found at {}",
                artifact.path().display()
            ));
        }

        let Some(token) = self
            .options
            .token
            .clone()
            .or_else(|| Secret::from_env(&config.token_env))
        else {
            return Ok(UploadOutcome::Failed {
                error: format!("token variable {} is not set", config.token_env),
            });
        };

        let uploader: Arc<dyn CoverageUploader> = match &self.options.uploader {
            Some(uploader) => uploader.clone(),
            None => match HttpUploader::from_config(config) {
                Ok(uploader) => Arc::new(uploader),
                Err(e) => {
                    return Ok(UploadOutcome::Failed {
                        error: e.to_string(),
                    })
                }
            },
        };

        self.recorder
            .emit(
                EventKind::UploadAttempted,
                json!({
                    "endpoint": &config.endpoint,
                    "report": artifact.path().display().to_string(),
                    "bytes": artifact.size().ok(),
                }),
            )
            .await?;
        METRICS.inc_uploads();

        let context = UploadContext {
            commit: self.git_sha.clone(),
            branch: self.event.branch.clone(),
            name: config.name.clone(),
        };
        let handle = task.insert(spawn_upload(
            uploader,
            artifact,
            token,
            context,
            Duration::from_secs(config.timeout_secs),
        ));
        let joined = handle.await;
        *task = None;
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(UploadError::Task(e.to_string())),
        };

        Ok(match result {
            Ok(()) => UploadOutcome::Succeeded,
            Err(e) => UploadOutcome::Failed {
                error: e.to_string(),
            },
        })
    }
}

/// Why `step` must not run, if it must not.
fn skip_reason(
    step: &StepConfig,
    outcomes: &HashMap<&str, StepOutcome>,
    failed_already: bool,
) -> Option<String> {
    if !step.enabled {
        return Some("step is disabled".to_string());
    }
    let outcome_of = |dep: &str| outcomes.get(dep).copied();
    match step.condition {
        RunCondition::OnSuccess => {
            if failed_already {
                return Some("an earlier step failed".to_string());
            }
            step.depends_on
                .iter()
                .find(|dep| !outcome_of(dep.as_str()).is_some_and(|o| o.satisfied()))
                .map(|dep| format!("dependency `{dep}` did not pass"))
        }
        RunCondition::Always => step
            .depends_on
            .iter()
            .find(|dep| {
                !outcome_of(dep.as_str()).is_some_and(|o| o.executed() || o.satisfied())
            })
            .map(|dep| format!("dependency `{dep}` never ran")),
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
