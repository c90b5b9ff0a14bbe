//! Workflow definition: the explicit configuration of one job.
//!
//! Everything a step needs (service endpoints, environment, paths, upload
//! target) is carried here and passed down, instead of being looked up
//! from ambient process state.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use jobline_state::ContentDigest;
use serde::{Deserialize, Serialize};

use crate::domain::error::{JoblineError, Result};
use crate::domain::service::ServiceDescriptor;
use crate::domain::step::{StepAction, StepConfig};
use crate::domain::trigger::TriggerFilter;
use crate::graph::TaskGraph;

pub const DEFAULT_COVERAGE_REPORT: &str = "coverage.xml";
pub const DEFAULT_JOB_TIMEOUT_MINUTES: u64 = 60;
pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 60;

fn default_report_path() -> PathBuf {
    PathBuf::from(DEFAULT_COVERAGE_REPORT)
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_job_timeout() -> u64 {
    DEFAULT_JOB_TIMEOUT_MINUTES
}

fn default_upload_timeout() -> u64 {
    DEFAULT_UPLOAD_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

/// Where the coverage report is written and read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageConfig {
    /// Path relative to the workspace.
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            report_path: default_report_path(),
        }
    }
}

/// External coverage reporting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    pub endpoint: String,
    /// Name of the environment variable holding the upload token.
    pub token_env: String,
    /// Optional flag/name attached to the upload.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_upload_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A complete job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,

    #[serde(default)]
    pub on: TriggerFilter,

    /// Environment passed to every step.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,

    pub steps: Vec<StepConfig>,

    #[serde(default)]
    pub coverage: CoverageConfig,

    #[serde(default)]
    pub upload: Option<UploadConfig>,

    /// Global job timeout.
    #[serde(default = "default_job_timeout")]
    pub timeout_minutes: u64,

    /// Root directory the steps run in.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
}

impl Workflow {
    /// Structural checks, ending with a cycle check on the step graph.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("workflow name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(invalid("workflow has no steps"));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(invalid("step id must not be empty"));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id `{}`", step.id)));
            }
            if let StepAction::Exec { command } = &step.action {
                if command.is_empty() {
                    return Err(invalid(format!("step `{}` has an empty command", step.id)));
                }
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(invalid(format!(
                        "step `{}` depends on unknown step `{dep}`",
                        step.id
                    )));
                }
            }
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for svc in &self.services {
            if !names.insert(svc.name.as_str()) {
                return Err(invalid(format!("duplicate service `{}`", svc.name)));
            }
            if !ports.insert(svc.port) {
                return Err(invalid(format!(
                    "service `{}` reuses port {}",
                    svc.name, svc.port
                )));
            }
        }

        if self.timeout_minutes == 0 {
            return Err(invalid("timeout_minutes must be positive"));
        }

        TaskGraph::from_steps(&self.steps)?.topological_order()?;
        Ok(())
    }

    /// Steps in execution order: every step after all of its dependencies.
    pub fn plan(&self) -> Result<Vec<&StepConfig>> {
        self.validate()?;
        let graph = self.graph()?;
        let order = graph.topological_order()?;
        Ok(order.into_iter().filter_map(|id| self.step(id)).collect())
    }

    pub fn graph(&self) -> Result<TaskGraph> {
        Ok(TaskGraph::from_steps(&self.steps)?)
    }

    /// Content digest of the canonical JSON form; identifies the workflow in the ledger.
    pub fn digest(&self) -> Result<ContentDigest> {
        let bytes = serde_json::to_vec(self)?;
        Ok(ContentDigest::from_bytes(&bytes))
    }

    pub fn step(&self, id: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Absolute-or-relative path of the coverage report inside the workspace.
    pub fn coverage_report_path(&self) -> PathBuf {
        self.workspace.join(&self.coverage.report_path)
    }
}

fn invalid(msg: impl Into<String>) -> JoblineError {
    JoblineError::InvalidWorkflow(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::step::StepPhase;

    fn minimal() -> Workflow {
        Workflow {
            name: "tests".to_string(),
            on: TriggerFilter::default(),
            env: BTreeMap::new(),
            services: vec![],
            steps: vec![StepConfig::exec(
                "test",
                StepPhase::Test,
                vec!["true".to_string()],
            )],
            coverage: CoverageConfig::default(),
            upload: None,
            timeout_minutes: 30,
            workspace: PathBuf::from("."),
        }
    }

    #[test]
    fn test_minimal_workflow_validates() {
        minimal().validate().unwrap();
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let mut wf = minimal();
        wf.steps.push(wf.steps[0].clone());
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut wf = minimal();
        wf.steps[0].depends_on = vec!["install".to_string()];
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("unknown step `install`"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut wf = minimal();
        wf.steps[0].action = StepAction::Exec { command: vec![] };
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_port_collision_rejected() {
        let mut wf = minimal();
        wf.services = vec![
            ServiceDescriptor::new("a", "img", 5432),
            ServiceDescriptor::new("b", "img", 5432),
        ];
        assert!(wf.validate().unwrap_err().to_string().contains("reuses port"));
    }

    #[test]
    fn test_digest_changes_with_content() {
        let a = minimal();
        let mut b = minimal();
        b.timeout_minutes = 31;
        assert_eq!(a.digest().unwrap(), minimal().digest().unwrap());
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn test_plan_orders_by_dependencies() {
        let mut wf = minimal();
        wf.steps = vec![
            StepConfig::exec("test", StepPhase::Test, vec!["true".to_string()]).after(&["install"]),
            StepConfig::exec("install", StepPhase::Toolchain, vec!["true".to_string()]),
        ];
        let ids: Vec<&str> = wf.plan().unwrap().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["install", "test"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut wf = minimal();
        wf.steps = vec![
            StepConfig::exec("a", StepPhase::Test, vec!["true".to_string()]).after(&["b"]),
            StepConfig::exec("b", StepPhase::Test, vec!["true".to_string()]).after(&["a"]),
        ];
        let err = wf.validate().unwrap_err();
        assert!(matches!(err, JoblineError::Graph(_)), "got {err:?}");
    }

    #[test]
    fn test_coverage_path_is_workspace_relative() {
        let mut wf = minimal();
        wf.workspace = PathBuf::from("/srv/app");
        assert_eq!(
            wf.coverage_report_path(),
            PathBuf::from("/srv/app/coverage.xml")
        );
    }
}
