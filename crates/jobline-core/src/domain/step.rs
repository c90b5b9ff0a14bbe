//! Step definitions: what a step does, when it runs, and which failure
//! class it belongs to.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default per-step timeout (30 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 1800;

/// Pipeline phase a step belongs to. Determines how its failure is classified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Runtime, dependency manager and dependency installation.
    Toolchain,
    /// Config overlay, migrations, static assets, index rebuild.
    Preparation,
    /// The test suite under coverage.
    Test,
    /// Coverage conversion and other reporting.
    Report,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Toolchain => "toolchain",
            StepPhase::Preparation => "preparation",
            StepPhase::Test => "test",
            StepPhase::Report => "report",
        }
    }
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Run a process; first element is the executable.
    Exec { command: Vec<String> },
    /// Copy every file under `source` into `destination` (last writer wins).
    Overlay {
        source: PathBuf,
        destination: PathBuf,
    },
}

impl StepAction {
    pub fn describe(&self) -> String {
        match self {
            StepAction::Exec { command } => command.join(" "),
            StepAction::Overlay {
                source,
                destination,
            } => format!("overlay {} -> {}", source.display(), destination.display()),
        }
    }
}

/// When a step is allowed to run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunCondition {
    /// Every dependency passed.
    #[default]
    OnSuccess,
    /// Every dependency was executed, whatever its outcome.
    Always,
}

fn default_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_enabled() -> bool {
    true
}

/// Configuration for one step of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Stable identifier used by `depends_on`.
    pub id: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: String,

    pub phase: StepPhase,

    pub action: StepAction,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Timeout in seconds (0 disables the step timeout).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Extra environment for this step, layered over the job environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory relative to the workspace.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub condition: RunCondition,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Lock file whose signature lets the step be skipped on a cache hit.
    #[serde(default)]
    pub cache_key_file: Option<PathBuf>,
}

impl StepConfig {
    /// A process step with default timeout and no dependencies.
    pub fn exec(id: impl Into<String>, phase: StepPhase, command: Vec<String>) -> Self {
        Self::new(id, phase, StepAction::Exec { command })
    }

    /// A config overlay step.
    pub fn overlay(
        id: impl Into<String>,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            id,
            StepPhase::Preparation,
            StepAction::Overlay {
                source: source.into(),
                destination: destination.into(),
            },
        )
    }

    fn new(id: impl Into<String>, phase: StepPhase, action: StepAction) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            phase,
            action,
            depends_on: Vec::new(),
            timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            env: BTreeMap::new(),
            working_dir: None,
            condition: RunCondition::OnSuccess,
            enabled: true,
            cache_key_file: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run even when a dependency failed, as long as it executed.
    pub fn always(mut self) -> Self {
        self.condition = RunCondition::Always;
        self
    }

    pub fn cached_by(mut self, lock_file: impl Into<PathBuf>) -> Self {
        self.cache_key_file = Some(lock_file.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}
