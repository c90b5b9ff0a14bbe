//! The built-in test workflow: services, steps and their canonical commands.

use std::collections::BTreeMap;
use std::path::PathBuf;

use jobline_core::domain::service::{HealthCheckPolicy, Probe, ServiceDescriptor};
use jobline_core::domain::step::{StepConfig, StepPhase};
use jobline_core::domain::workflow::{
    CoverageConfig, UploadConfig, DEFAULT_COVERAGE_REPORT, DEFAULT_JOB_TIMEOUT_MINUTES,
    DEFAULT_UPLOAD_TIMEOUT_SECS,
};
use jobline_core::{TriggerFilter, Workflow};
use serde::{Deserialize, Serialize};

pub const DB_NAME: &str = "app_test";
pub const DB_USER: &str = "app";
pub const DB_PASSWORD: &str = "app";
pub const DB_PORT: u16 = 5432;
pub const CACHE_PORT: u16 = 6379;
pub const SEARCH_PORT: u16 = 9200;

/// Steps of the built-in workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStep {
    /// python -m pip install --upgrade pipenv
    InstallDependencyManager,

    /// pyenv install --skip-existing (version from `.python-version`)
    InstallRuntime,

    /// pipenv sync --dev, cached by `Pipfile.lock`
    InstallDependencies,

    /// ci/config -> config
    OverlayConfig,

    /// manage.py migrate --noinput
    Migrate,

    /// manage.py migrate --check
    MigrateCheck,

    /// manage.py collectstatic --noinput
    CollectStatic,

    /// manage.py search_index --rebuild -f
    RebuildSearchIndex,

    /// coverage run manage.py test -v 2
    RunTests,

    /// coverage xml -o coverage.xml
    CoverageXml,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn manage(args: &[&str]) -> Vec<String> {
    let mut cmd = argv(&["pipenv", "run", "python", "manage.py"]);
    cmd.extend(args.iter().map(|a| a.to_string()));
    cmd
}

impl BuiltinStep {
    pub const ALL: [BuiltinStep; 10] = [
        BuiltinStep::InstallDependencyManager,
        BuiltinStep::InstallRuntime,
        BuiltinStep::InstallDependencies,
        BuiltinStep::OverlayConfig,
        BuiltinStep::Migrate,
        BuiltinStep::MigrateCheck,
        BuiltinStep::CollectStatic,
        BuiltinStep::RebuildSearchIndex,
        BuiltinStep::RunTests,
        BuiltinStep::CoverageXml,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            BuiltinStep::InstallDependencyManager => "install_pipenv",
            BuiltinStep::InstallRuntime => "install_python",
            BuiltinStep::InstallDependencies => "install_dependencies",
            BuiltinStep::OverlayConfig => "overlay_config",
            BuiltinStep::Migrate => "migrate",
            BuiltinStep::MigrateCheck => "migrate_check",
            BuiltinStep::CollectStatic => "collectstatic",
            BuiltinStep::RebuildSearchIndex => "rebuild_search_index",
            BuiltinStep::RunTests => "test",
            BuiltinStep::CoverageXml => "coverage_xml",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStep::InstallDependencyManager => "Install pipenv",
            BuiltinStep::InstallRuntime => "Install pinned Python",
            BuiltinStep::InstallDependencies => "Install dependencies",
            BuiltinStep::OverlayConfig => "Overlay CI configuration",
            BuiltinStep::Migrate => "Apply migrations",
            BuiltinStep::MigrateCheck => "Check for unapplied migrations",
            BuiltinStep::CollectStatic => "Collect static assets",
            BuiltinStep::RebuildSearchIndex => "Rebuild search index",
            BuiltinStep::RunTests => "Run tests under coverage",
            BuiltinStep::CoverageXml => "Write coverage report",
        }
    }

    pub fn phase(&self) -> StepPhase {
        match self {
            BuiltinStep::InstallDependencyManager
            | BuiltinStep::InstallRuntime
            | BuiltinStep::InstallDependencies => StepPhase::Toolchain,
            BuiltinStep::OverlayConfig
            | BuiltinStep::Migrate
            | BuiltinStep::MigrateCheck
            | BuiltinStep::CollectStatic
            | BuiltinStep::RebuildSearchIndex => StepPhase::Preparation,
            BuiltinStep::RunTests => StepPhase::Test,
            BuiltinStep::CoverageXml => StepPhase::Report,
        }
    }

    /// Process command; `None` for the overlay, which is not a process.
    pub fn command(&self) -> Option<Vec<String>> {
        let cmd = match self {
            BuiltinStep::InstallDependencyManager => {
                argv(&["python", "-m", "pip", "install", "--upgrade", "pipenv"])
            }
            BuiltinStep::InstallRuntime => argv(&["pyenv", "install", "--skip-existing"]),
            BuiltinStep::InstallDependencies => argv(&["pipenv", "sync", "--dev"]),
            BuiltinStep::OverlayConfig => return None,
            BuiltinStep::Migrate => manage(&["migrate", "--noinput"]),
            BuiltinStep::MigrateCheck => manage(&["migrate", "--check"]),
            BuiltinStep::CollectStatic => manage(&["collectstatic", "--noinput"]),
            BuiltinStep::RebuildSearchIndex => manage(&["search_index", "--rebuild", "-f"]),
            BuiltinStep::RunTests => argv(&[
                "pipenv", "run", "coverage", "run", "manage.py", "test", "-v", "2",
            ]),
            BuiltinStep::CoverageXml => argv(&[
                "pipenv",
                "run",
                "coverage",
                "xml",
                "-o",
                DEFAULT_COVERAGE_REPORT,
            ]),
        };
        Some(cmd)
    }

    /// The step this one waits for.
    pub fn predecessor(&self) -> Option<BuiltinStep> {
        let index = Self::ALL.iter().position(|s| s == self)?;
        index.checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn to_step(&self) -> StepConfig {
        let step = match self.command() {
            Some(command) => StepConfig::exec(self.id(), self.phase(), command),
            None => StepConfig::overlay(self.id(), "ci/config", "config"),
        };
        let mut step = step.named(self.name());
        if let Some(prev) = self.predecessor() {
            step = step.after(&[prev.id()]);
        }
        match self {
            BuiltinStep::InstallDependencies => step.cached_by("Pipfile.lock"),
            BuiltinStep::CoverageXml => step.always(),
            _ => step,
        }
    }
}

/// Constructor for the built-in workflow.
pub trait BuiltinWorkflow {
    fn builtin() -> Self;
}

impl BuiltinWorkflow for Workflow {
    /// Test a Django application against PostgreSQL, Redis and a single-node
    /// Elasticsearch, then upload `coverage.xml`.
    fn builtin() -> Self {
        let pg_ready = HealthCheckPolicy::new(Probe::Exec {
            command: argv(&["pg_isready", "-U", DB_USER, "-d", DB_NAME]),
        });
        let redis_ready = HealthCheckPolicy::new(Probe::Exec {
            command: argv(&["redis-cli", "ping"]),
        });
        let search_ready = HealthCheckPolicy::new(Probe::Http {
            url: format!(
                "http://localhost:{SEARCH_PORT}/_cluster/health?wait_for_status=yellow&timeout=5s"
            ),
        });

        let services = vec![
            ServiceDescriptor::new("postgres", "postgres:12", DB_PORT)
                .with_env("POSTGRES_DB", DB_NAME)
                .with_env("POSTGRES_USER", DB_USER)
                .with_env("POSTGRES_PASSWORD", DB_PASSWORD)
                .with_health_check(pg_ready),
            ServiceDescriptor::new("redis", "redis:6", CACHE_PORT).with_health_check(redis_ready),
            ServiceDescriptor::new("elasticsearch", "elasticsearch:7.10.1", SEARCH_PORT)
                .with_env("discovery.type", "single-node")
                .with_env("ES_JAVA_OPTS", "-Xms512m -Xmx512m")
                .with_health_check(search_ready),
        ];

        let env: BTreeMap<String, String> = [
            ("APP_ENV", "test".to_string()),
            ("DB_NAME", DB_NAME.to_string()),
            ("DB_USER", DB_USER.to_string()),
            ("DB_PASSWORD", DB_PASSWORD.to_string()),
            ("DB_HOST", "localhost".to_string()),
            ("DB_PORT", DB_PORT.to_string()),
            ("REDIS_URL", format!("redis://localhost:{CACHE_PORT}/0")),
            ("ELASTICSEARCH_URL", format!("http://localhost:{SEARCH_PORT}")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Workflow {
            name: "django-tests".to_string(),
            on: TriggerFilter::default(),
            env,
            services,
            steps: BuiltinStep::ALL.iter().map(BuiltinStep::to_step).collect(),
            coverage: CoverageConfig::default(),
            upload: Some(UploadConfig {
                endpoint: "https://codecov.io/upload/v2".to_string(),
                token_env: "CODECOV_TOKEN".to_string(),
                name: Some("unittests".to_string()),
                timeout_secs: DEFAULT_UPLOAD_TIMEOUT_SECS,
                enabled: true,
            }),
            timeout_minutes: DEFAULT_JOB_TIMEOUT_MINUTES,
            workspace: PathBuf::from("."),
        }
    }
}
