//! Integration tests for the job pipeline with MemoryRunLedger and fake services.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobline_ci::{
    CoverageArtifact, CoverageUploader, FailureClass, FsDependencyCache, JobGate, JobOptions,
    JobPipeline, JobStatus, ProbeRunner, ProvisionError, Secret, ServiceHandle, ServiceRuntime,
    StepOutcome, UploadContext, UploadError, UploadOutcome,
};
use jobline_core::{
    CoverageConfig, HealthCheckPolicy, Probe, ServiceDescriptor, StepConfig, StepPhase,
    TriggerEvent, TriggerFilter, UploadConfig, Workflow,
};
use jobline_state::fakes::MemoryRunLedger;
use jobline_state::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageError, StorageResult,
};

const SHA: &str = "0123456789abcdef0123456789abcdef01234567";
const FAILING_SUITE: &str =
    "printf 'Ran 120 tests in 4.210s\\n\\nFAILED (failures=2)\\n' >&2; exit 1";
const PASSING_SUITE: &str = "printf 'Ran 120 tests in 4.210s\\n\\nOK\\n' >&2";

#[derive(Default)]
struct FakeRuntime {
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
}

#[async_trait]
impl ServiceRuntime for FakeRuntime {
    async fn start(&self, service: &ServiceDescriptor) -> Result<ServiceHandle, ProvisionError> {
        self.started.lock().unwrap().push(service.name.clone());
        Ok(ServiceHandle {
            name: service.name.clone(),
            container_id: format!("ctr-{}", service.name),
            host: "127.0.0.1".to_string(),
            port: service.port,
        })
    }

    async fn exec(&self, _handle: &ServiceHandle, _command: &[String]) -> Result<i32, ProvisionError> {
        Ok(0)
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), ProvisionError> {
        self.stopped.lock().unwrap().push(handle.name.clone());
        Ok(())
    }
}

/// Healthy on the first attempt, except for `unhealthy`, which never is.
#[derive(Default)]
struct FakeProber {
    unhealthy: Option<&'static str>,
}

#[async_trait]
impl ProbeRunner for FakeProber {
    async fn probe(&self, handle: &ServiceHandle, _probe: &Probe) -> Result<(), String> {
        if self.unhealthy == Some(handle.name.as_str()) {
            Err("connection refused".to_string())
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct FakeUploader {
    fail: bool,
    calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    contexts: Mutex<Vec<UploadContext>>,
}

#[async_trait]
impl CoverageUploader for FakeUploader {
    async fn upload(
        &self,
        artifact: &CoverageArtifact,
        token: &Secret,
        context: &UploadContext,
    ) -> Result<(), UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.expose().to_string());
        self.contexts.lock().unwrap().push(context.clone());
        if !artifact.exists() {
            return Err(UploadError::MissingArtifact(artifact.path().to_path_buf()));
        }
        if self.fail {
            return Err(UploadError::Rejected {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

struct Harness {
    ledger: Arc<MemoryRunLedger>,
    runtime: Arc<FakeRuntime>,
    uploader: Arc<FakeUploader>,
    prober: Arc<FakeProber>,
}

impl Harness {
    fn new() -> Self {
        Self::with(FakeProber::default(), FakeUploader::default())
    }

    fn with(prober: FakeProber, uploader: FakeUploader) -> Self {
        Self {
            ledger: Arc::new(MemoryRunLedger::new()),
            runtime: Arc::new(FakeRuntime::default()),
            uploader: Arc::new(uploader),
            prober: Arc::new(prober),
        }
    }

    fn options(&self) -> JobOptions {
        JobOptions::new(self.runtime.clone(), self.prober.clone())
            .with_uploader(self.uploader.clone())
            .with_token(Secret::new("test-token"))
    }

    async fn events(&self, run_id: &str) -> Vec<RunEvent> {
        self.ledger
            .get_events(&RunId(run_id.to_string()))
            .await
            .expect("events")
    }

    fn uploads(&self) -> usize {
        self.uploader.calls.load(Ordering::SeqCst)
    }

    fn stopped(&self) -> Vec<String> {
        self.runtime.stopped.lock().unwrap().clone()
    }
}

fn sh(id: &str, phase: StepPhase, script: &str) -> StepConfig {
    StepConfig::exec(
        id,
        phase,
        vec!["sh".to_string(), "-c".to_string(), script.to_string()],
    )
}

fn quick_policy(probe: Probe) -> HealthCheckPolicy {
    HealthCheckPolicy {
        interval_secs: 0,
        ..HealthCheckPolicy::new(probe)
    }
}

/// Database + cache services and the four-stage job, with `suite` as the
/// test command.
fn workflow(workspace: &Path, suite: &str) -> Workflow {
    Workflow {
        name: "django-tests".to_string(),
        on: TriggerFilter::default(),
        env: BTreeMap::from([("DB_NAME".to_string(), "app_test".to_string())]),
        services: vec![
            ServiceDescriptor::new("postgres", "postgres:12", 5432).with_health_check(
                quick_policy(Probe::Exec {
                    command: vec!["pg_isready".to_string()],
                }),
            ),
            ServiceDescriptor::new("redis", "redis:6", 6379)
                .with_health_check(quick_policy(Probe::Tcp { port: 6379 })),
        ],
        steps: vec![
            sh(
                "install_dependencies",
                StepPhase::Toolchain,
                "echo installed >> install.log",
            ),
            sh(
                "migrate",
                StepPhase::Preparation,
                "mkdir -p db && touch db/schema && echo applied >> db/migrations.log",
            )
            .after(&["install_dependencies"]),
            sh("test", StepPhase::Test, suite).after(&["migrate"]),
            sh(
                "coverage_xml",
                StepPhase::Report,
                "echo '<coverage line-rate=\"0.9\"/>' > coverage.xml",
            )
            .after(&["test"])
            .always(),
        ],
        coverage: CoverageConfig::default(),
        upload: Some(UploadConfig {
            endpoint: "http://127.0.0.1:9/upload".to_string(),
            token_env: "JOBLINE_IT_UNSET_TOKEN".to_string(),
            name: Some("unittests".to_string()),
            timeout_secs: 5,
            enabled: true,
        }),
        timeout_minutes: 30,
        workspace: workspace.to_path_buf(),
    }
}

fn push_main() -> TriggerEvent {
    TriggerEvent::push("main").with_sha(SHA)
}

/// Test: green run passes, uploads once and tears services down
#[tokio::test]
async fn test_green_run_passes() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();

    let report = JobPipeline::run(
        h.ledger.clone(),
        &workflow(ws.path(), PASSING_SUITE),
        &push_main(),
        h.options(),
    )
    .await
    .expect("pipeline failed");

    assert_eq!(report.status, JobStatus::Passed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.passed_count(), 4);
    assert_eq!(report.upload, UploadOutcome::Succeeded);
    assert_eq!(h.uploads(), 1);
    assert_eq!(report.tests.map(|t| t.ran), Some(120));

    let mut stopped = h.stopped();
    stopped.sort();
    assert_eq!(stopped, vec!["postgres".to_string(), "redis".to_string()]);

    let run_id = report.run_id.clone().expect("run id");
    let run = h.ledger.get_run(&RunId(run_id.clone())).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.metadata.git_sha.as_deref(), Some(SHA));
    let summary = run.summary.expect("summary");
    assert!(summary.success);

    let events = h.events(&run_id).await;
    assert_eq!(summary.total_events, events.len() as u64);
    assert_eq!(events.first().unwrap().kind, "job_started");
    assert_eq!(events.last().unwrap().kind, "job_finished");
    assert!(events.iter().any(|e| e.kind == "services_torn_down"));

    let contexts = h.uploader.contexts.lock().unwrap();
    assert_eq!(contexts[0].commit.as_deref(), Some(SHA));
    assert_eq!(contexts[0].branch, "main");
    assert_eq!(contexts[0].name.as_deref(), Some("unittests"));
}

/// Test: a failing suite still produces and uploads coverage, but the job fails
#[tokio::test]
async fn test_failing_suite_still_uploads_coverage() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();

    let report = JobPipeline::run(
        h.ledger.clone(),
        &workflow(ws.path(), FAILING_SUITE),
        &push_main(),
        h.options(),
    )
    .await
    .expect("pipeline failed");

    assert_eq!(report.status, JobStatus::TestsFailed);
    assert_ne!(report.exit_code(), 0);

    let tests = report.tests.expect("test summary");
    assert_eq!(tests.ran, 120);
    assert_eq!(tests.failures, 2);

    let coverage = report.step("coverage_xml").expect("coverage step");
    assert_eq!(coverage.outcome, StepOutcome::Passed);
    assert!(ws.path().join("coverage.xml").is_file());
    assert_eq!(h.uploads(), 1);
    assert_eq!(report.upload, UploadOutcome::Succeeded);

    let run = h
        .ledger
        .get_run(&RunId(report.run_id.clone().unwrap()))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

/// Test: upload failure is logged and recorded but never changes the status
#[tokio::test]
async fn test_upload_failure_does_not_change_status() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::with(
        FakeProber::default(),
        FakeUploader {
            fail: true,
            ..FakeUploader::default()
        },
    );

    let report = JobPipeline::run(
        h.ledger.clone(),
        &workflow(ws.path(), PASSING_SUITE),
        &push_main(),
        h.options(),
    )
    .await
    .expect("pipeline failed");

    assert_eq!(report.status, JobStatus::Passed);
    assert_eq!(report.exit_code(), 0);
    match &report.upload {
        UploadOutcome::Failed { error } => assert!(error.contains("503"), "got {error}"),
        other => panic!("expected failed upload, got {other:?}"),
    }

    let events = h.events(report.run_id.as_deref().unwrap()).await;
    assert!(events.iter().any(|e| e.kind == "upload_failed"));
    let verdict = JobGate::evaluate(&events);
    assert!(verdict.passed, "{}", verdict.message);
}

/// Test: missing token is a failed upload that leaves the job green
#[tokio::test]
async fn test_missing_token_fails_upload_only() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let options = JobOptions::new(h.runtime.clone(), h.prober.clone())
        .with_uploader(h.uploader.clone());

    let report = JobPipeline::run(
        h.ledger.clone(),
        &workflow(ws.path(), PASSING_SUITE),
        &push_main(),
        options,
    )
    .await
    .unwrap();

    assert_eq!(report.status, JobStatus::Passed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(h.uploads(), 0);
    match &report.upload {
        UploadOutcome::Failed { error } => {
            assert!(error.contains("JOBLINE_IT_UNSET_TOKEN"), "got {error}")
        }
        other => panic!("expected failed upload, got {other:?}"),
    }

    let events = h.events(report.run_id.as_deref().unwrap()).await;
    assert!(events.iter().any(|e| e.kind == "upload_failed"));
    assert!(JobGate::evaluate(&events).passed);
}

/// Test: non-matching trigger runs nothing and records nothing
#[tokio::test]
async fn test_trigger_mismatch_records_nothing() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();

    let report = JobPipeline::run(
        h.ledger.clone(),
        &workflow(ws.path(), PASSING_SUITE),
        &TriggerEvent::push("feature/login").with_sha(SHA),
        h.options(),
    )
    .await
    .unwrap();

    assert_eq!(report.status, JobStatus::Skipped);
    assert_eq!(report.exit_code(), 0);
    assert!(report.run_id.is_none());
    assert!(report.skip_reason.unwrap().contains("feature/login"));
    assert!(report.steps.is_empty());
    assert!(h.runtime.started.lock().unwrap().is_empty());
    assert!(h.ledger.list_runs(None).await.unwrap().is_empty());
    assert!(!ws.path().join("install.log").exists());
}

/// Test: pull request closed against main is skipped, synchronize runs
#[tokio::test]
async fn test_pull_request_actions() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let wf = workflow(ws.path(), PASSING_SUITE);

    let closed = JobPipeline::run(
        h.ledger.clone(),
        &wf,
        &TriggerEvent::pull_request("main", "closed").with_sha(SHA),
        h.options(),
    )
    .await
    .unwrap();
    assert_eq!(closed.status, JobStatus::Skipped);

    let sync = JobPipeline::run(
        h.ledger.clone(),
        &wf,
        &TriggerEvent::pull_request("main", "synchronize").with_sha(SHA),
        h.options(),
    )
    .await
    .unwrap();
    assert_eq!(sync.status, JobStatus::Passed);
    assert_eq!(h.ledger.list_runs(None).await.unwrap().len(), 1);
}

/// Test: a database that never becomes ready aborts after the full
/// readiness window, before any step runs
#[tokio::test(start_paused = true)]
async fn test_unready_database_aborts_before_steps() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::with(
        FakeProber {
            unhealthy: Some("postgres"),
        },
        FakeUploader::default(),
    );
    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.services[0].health_check = Some(HealthCheckPolicy::new(Probe::Exec {
        command: vec!["pg_isready".to_string()],
    }));

    let event = TriggerEvent::pull_request("main", "synchronize").with_sha(SHA);

    let started = tokio::time::Instant::now();
    let report = JobPipeline::run(h.ledger.clone(), &wf, &event, h.options())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(50));
    assert_eq!(report.status, JobStatus::ProvisioningFailed);
    assert_eq!(report.exit_code(), 3);
    assert!(report.steps.is_empty());
    assert_eq!(report.upload, UploadOutcome::NotReached);
    assert_eq!(h.uploads(), 0);
    assert!(!ws.path().join("install.log").exists());

    let postgres = report
        .services
        .iter()
        .find(|s| s.service == "postgres")
        .unwrap();
    assert!(!postgres.healthy);
    assert_eq!(postgres.attempts, 5);

    // Every started container is still torn down.
    let mut stopped = h.stopped();
    stopped.sort();
    assert_eq!(stopped, vec!["postgres".to_string(), "redis".to_string()]);

    let events = h.events(report.run_id.as_deref().unwrap()).await;
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert!(kinds.contains(&"service_unhealthy"));
    assert!(kinds.contains(&"provisioning_failed"));
    assert!(kinds.contains(&"services_torn_down"));
    assert!(!kinds.contains(&"step_started"));

    let verdict = JobGate::evaluate(&events);
    assert!(!verdict.passed);
    assert_eq!(verdict.failure_class, Some(FailureClass::Provisioning));
}

/// Test: toolchain failure stops the job and nothing downstream runs
#[tokio::test]
async fn test_toolchain_failure_stops_job() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.steps[0] = sh(
        "install_dependencies",
        StepPhase::Toolchain,
        "echo 'lock file out of date' >&2; exit 1",
    );

    let report = JobPipeline::run(h.ledger.clone(), &wf, &push_main(), h.options())
        .await
        .unwrap();

    assert_eq!(report.status, JobStatus::ToolchainFailed);
    assert_eq!(report.exit_code(), 4);
    assert_eq!(report.step("migrate").unwrap().outcome, StepOutcome::Skipped);
    assert_eq!(report.step("test").unwrap().outcome, StepOutcome::Skipped);
    assert_eq!(
        report.step("coverage_xml").unwrap().outcome,
        StepOutcome::Skipped
    );
    assert!(matches!(report.upload, UploadOutcome::Skipped { .. }));
    assert_eq!(h.uploads(), 0);

    let events = h.events(report.run_id.as_deref().unwrap()).await;
    let failed = events.iter().find(|e| e.kind == "step_failed").unwrap();
    assert_eq!(failed.payload["step_id"], "install_dependencies");
    assert!(failed.payload["stderr_tail"]
        .as_str()
        .unwrap()
        .contains("lock file out of date"));
    assert_eq!(
        JobGate::evaluate(&events).failure_class,
        Some(FailureClass::Toolchain)
    );
}

/// Test: preparation failure maps to its own status
#[tokio::test]
async fn test_migration_failure_is_preparation_failure() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.steps[1] = sh("migrate", StepPhase::Preparation, "exit 2").after(&["install_dependencies"]);

    let report = JobPipeline::run(h.ledger.clone(), &wf, &push_main(), h.options())
        .await
        .unwrap();

    assert_eq!(report.status, JobStatus::PreparationFailed);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.step("migrate").unwrap().exit_code, 2);
}

/// Test: re-running in the same workspace passes again
#[tokio::test]
async fn test_rerun_in_same_workspace_passes() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.steps.push(
        sh("migrate_check", StepPhase::Preparation, "test -f db/schema").after(&["migrate"]),
    );

    for _ in 0..2 {
        let report = JobPipeline::run(h.ledger.clone(), &wf, &push_main(), h.options())
            .await
            .unwrap();
        assert_eq!(report.status, JobStatus::Passed);
        assert_eq!(
            report.step("migrate_check").unwrap().outcome,
            StepOutcome::Passed
        );
    }

    let migrations = std::fs::read_to_string(ws.path().join("db/migrations.log")).unwrap();
    assert_eq!(migrations.lines().count(), 2);
    assert_eq!(h.ledger.list_runs(None).await.unwrap().len(), 2);
}

async fn run_cached(h: &Harness, wf: &Workflow, cache: &Arc<FsDependencyCache>) -> jobline_ci::JobReport {
    JobPipeline::run(
        h.ledger.clone(),
        wf,
        &push_main(),
        h.options().with_cache(cache.clone()),
    )
    .await
    .unwrap()
}

/// Test: dependency install is skipped when the lock file is unchanged
#[tokio::test]
async fn test_dependency_cache_reused_until_lock_changes() {
    let ws = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("Pipfile.lock"), r#"{"default": {}}"#).unwrap();

    let h = Harness::new();
    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.steps[0] = wf.steps[0].clone().cached_by("Pipfile.lock");
    let cache = Arc::new(FsDependencyCache::new(cache_dir.path()));

    let first = run_cached(&h, &wf, &cache).await;
    assert_eq!(
        first.step("install_dependencies").unwrap().outcome,
        StepOutcome::Passed
    );

    let second = run_cached(&h, &wf, &cache).await;
    assert_eq!(second.status, JobStatus::Passed);
    assert_eq!(
        second.step("install_dependencies").unwrap().outcome,
        StepOutcome::Cached
    );
    // Downstream steps still ran.
    assert_eq!(second.step("migrate").unwrap().outcome, StepOutcome::Passed);

    std::fs::write(
        ws.path().join("Pipfile.lock"),
        r#"{"default": {"django": {}}}"#,
    )
    .unwrap();
    let third = run_cached(&h, &wf, &cache).await;
    assert_eq!(
        third.step("install_dependencies").unwrap().outcome,
        StepOutcome::Passed
    );

    let installs = std::fs::read_to_string(ws.path().join("install.log")).unwrap();
    assert_eq!(installs.lines().count(), 2);
}

/// Test: the global timeout cancels the job and still tears services down
#[tokio::test]
async fn test_global_timeout_cancels_job() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.steps[2] = sh("test", StepPhase::Test, "sleep 30").after(&["migrate"]);

    let report = JobPipeline::run(
        h.ledger.clone(),
        &wf,
        &push_main(),
        h.options().with_timeout(Duration::from_secs(1)),
    )
    .await
    .unwrap();

    assert_eq!(report.status, JobStatus::TimedOut);
    assert_eq!(report.exit_code(), 124);
    assert!(report.duration_ms < 30_000);
    assert_eq!(h.stopped().len(), 2);

    let run_id = report.run_id.clone().unwrap();
    let run = h.ledger.get_run(&RunId(run_id.clone())).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    let events = h.events(&run_id).await;
    assert!(events.iter().any(|e| e.kind == "job_timed_out"));
    assert_eq!(
        JobGate::evaluate(&events).failure_class,
        Some(FailureClass::Timeout)
    );
}

/// Test: the upload token reaches the uploader but never a step or the ledger
#[tokio::test]
async fn test_token_withheld_from_steps_and_ledger() {
    const VAR: &str = "JOBLINE_IT_WITHHELD_TOKEN";
    std::env::set_var(VAR, "tok-9f8e7d");

    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.upload.as_mut().unwrap().token_env = VAR.to_string();
    wf.steps[0] = sh(
        "install_dependencies",
        StepPhase::Toolchain,
        &format!("test -z \"${VAR}\" && echo installed >> install.log"),
    );
    let options = JobOptions::new(h.runtime.clone(), h.prober.clone())
        .with_uploader(h.uploader.clone());

    let report = JobPipeline::run(h.ledger.clone(), &wf, &push_main(), options)
        .await
        .unwrap();
    std::env::remove_var(VAR);

    assert_eq!(report.status, JobStatus::Passed, "{:?}", report.steps);
    assert_eq!(
        *h.uploader.tokens.lock().unwrap(),
        vec!["tok-9f8e7d".to_string()]
    );

    let events = h.events(report.run_id.as_deref().unwrap()).await;
    let dump = serde_json::to_string(&events).unwrap();
    assert!(!dump.contains("tok-9f8e7d"));
    let report_json = serde_json::to_string(&report).unwrap();
    assert!(!report_json.contains("tok-9f8e7d"));
}

/// Test: a clean run's recorded events pass the gate
#[tokio::test]
async fn test_gate_over_recorded_run() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();

    let failing = JobPipeline::run(
        h.ledger.clone(),
        &workflow(ws.path(), FAILING_SUITE),
        &push_main(),
        h.options(),
    )
    .await
    .unwrap();
    let verdict = JobGate::evaluate(&h.events(failing.run_id.as_deref().unwrap()).await);
    assert!(!verdict.passed);
    assert_eq!(verdict.failure_class, Some(FailureClass::Tests));
    assert!(verdict.violations.iter().any(|v| v.contains("test")));

    let passing = JobPipeline::run(
        h.ledger.clone(),
        &workflow(ws.path(), PASSING_SUITE),
        &push_main(),
        h.options(),
    )
    .await
    .unwrap();
    let verdict = JobGate::evaluate(&h.events(passing.run_id.as_deref().unwrap()).await);
    assert!(verdict.passed, "{}", verdict.message);
}

/// Test: a timeout while services are still gating tears down every
/// container that already started
#[tokio::test]
async fn test_timeout_during_provisioning_stops_started_services() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::with(
        FakeProber {
            unhealthy: Some("postgres"),
        },
        FakeUploader::default(),
    );
    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.services[0].health_check = Some(HealthCheckPolicy::new(Probe::Exec {
        command: vec!["pg_isready".to_string()],
    }));

    let report = JobPipeline::run(
        h.ledger.clone(),
        &wf,
        &push_main(),
        h.options().with_timeout(Duration::from_secs(1)),
    )
    .await
    .unwrap();

    assert_eq!(report.status, JobStatus::TimedOut);
    assert!(report.steps.is_empty());
    assert_eq!(h.runtime.started.lock().unwrap().len(), 2);
    let mut stopped = h.stopped();
    stopped.sort();
    assert_eq!(stopped, vec!["postgres".to_string(), "redis".to_string()]);

    let events = h.events(report.run_id.as_deref().unwrap()).await;
    let torn_down = events
        .iter()
        .find(|e| e.kind == "services_torn_down")
        .expect("teardown recorded");
    assert_eq!(torn_down.payload["stopped"], 2);
    assert!(!events.iter().any(|e| e.kind == "step_started"));
}

/// Test: a report left by an earlier run is never uploaded for a later one
#[tokio::test]
async fn test_failed_report_step_does_not_upload_previous_report() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();

    let first = JobPipeline::run(
        h.ledger.clone(),
        &workflow(ws.path(), PASSING_SUITE),
        &push_main(),
        h.options(),
    )
    .await
    .unwrap();
    assert_eq!(first.upload, UploadOutcome::Succeeded);
    assert!(ws.path().join("coverage.xml").is_file());

    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.steps[3] = sh("coverage_xml", StepPhase::Report, "exit 1")
        .after(&["test"])
        .always();
    let second = JobPipeline::run(
        h.ledger.clone(),
        &wf,
        &TriggerEvent::push("main").with_sha("ffffffffffffffffffffffffffffffffffffffff"),
        h.options(),
    )
    .await
    .unwrap();

    assert_eq!(second.status, JobStatus::TestsFailed);
    assert!(matches!(second.upload, UploadOutcome::Skipped { .. }));
    assert_eq!(h.uploads(), 1);
    assert!(!ws.path().join("coverage.xml").exists());
}

/// Uploader that takes `delay` and counts started and finished uploads.
struct SlowUploader {
    delay: Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl CoverageUploader for SlowUploader {
    async fn upload(
        &self,
        _artifact: &CoverageArtifact,
        _token: &Secret,
        _context: &UploadContext,
    ) -> Result<(), UploadError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Test: an upload still in flight at the global timeout is cancelled
#[tokio::test]
async fn test_global_timeout_cancels_inflight_upload() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let mut wf = workflow(ws.path(), PASSING_SUITE);
    wf.upload.as_mut().unwrap().timeout_secs = 60;
    let uploader = Arc::new(SlowUploader {
        delay: Duration::from_secs(2),
        started: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
    });

    let report = JobPipeline::run(
        h.ledger.clone(),
        &wf,
        &push_main(),
        h.options()
            .with_uploader(uploader.clone())
            .with_timeout(Duration::from_secs(1)),
    )
    .await
    .unwrap();

    assert_eq!(report.status, JobStatus::TimedOut);
    assert_eq!(report.upload, UploadOutcome::NotReached);
    assert_eq!(uploader.started.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(uploader.finished.load(Ordering::SeqCst), 0);
}

/// Ledger that refuses to record `step_started`, standing in for a
/// storage failure mid-job.
struct BrokenLedger {
    inner: MemoryRunLedger,
}

#[async_trait]
impl RunLedger for BrokenLedger {
    async fn create_run(
        &self,
        workflow_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        self.inner.create_run(workflow_digest, metadata).await
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        if event.kind == "step_started" {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.append_event(run_id, event).await
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.complete_run(run_id, summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.fail_run(run_id, summary).await
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.cancel_run(run_id, summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.inner.get_run(run_id).await
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.inner.get_events(run_id).await
    }

    async fn list_runs(
        &self,
        workflow_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        self.inner.list_runs(workflow_digest).await
    }
}

/// Test: a ledger error mid-job still finalizes the run and stops services
#[tokio::test]
async fn test_ledger_error_finalizes_run_as_failed() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let ledger = Arc::new(BrokenLedger {
        inner: MemoryRunLedger::new(),
    });

    let err = JobPipeline::run(
        ledger.clone(),
        &workflow(ws.path(), PASSING_SUITE),
        &push_main(),
        h.options(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("disk full"), "got {err}");

    assert_eq!(h.stopped().len(), 2);
    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(!runs[0].summary.as_ref().unwrap().success);
}
