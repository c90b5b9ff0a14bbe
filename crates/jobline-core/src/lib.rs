//! Jobline core library
//!
//! Domain model (triggers, services, steps, workflows, events), workflow
//! loading, run recording and tracing setup shared by the runner and CLI.

pub mod config;
pub mod domain;
pub mod git;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod recording;
pub mod telemetry;

pub use config::{load_workflow, parse_workflow_str, substitute_env_vars};

pub use domain::{
    BranchFilter, CoverageConfig, Event, EventKind, EventType, HealthCheckPolicy, JoblineError,
    PrAction, Probe, PullRequestFilter, Result, RunCondition, ServiceDescriptor, StepAction,
    StepConfig, StepPhase, TriggerDecision, TriggerEvent, TriggerFilter, UploadConfig, Workflow,
};

pub use git::{capture_head_sha, current_branch, is_git_repo};
pub use graph::{GraphError, TaskGraph};
pub use metrics::METRICS;
pub use obs::job_span;
pub use recording::JobRunRecorder;
pub use telemetry::init_tracing;

pub use jobline_state::{ContentDigest, RunId, RunLedger, RunMetadata, RunSummary};

/// Jobline version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
