//! Domain models for Jobline.
//!
//! Canonical definitions for the core entities:
//! - `TriggerEvent` / `TriggerFilter`: when a job runs
//! - `ServiceDescriptor`: auxiliary services and their readiness gates
//! - `StepConfig`: one unit of work in the job
//! - `Workflow`: the explicit per-job configuration tying it all together
//! - `Event`: lifecycle events recorded into the run ledger

pub mod error;
pub mod run;
pub mod service;
pub mod step;
pub mod trigger;
pub mod workflow;

pub use error::{JoblineError, Result};
pub use run::{Event, EventKind};
pub use service::{HealthCheckPolicy, Probe, ServiceDescriptor};
pub use step::{RunCondition, StepAction, StepConfig, StepPhase};
pub use trigger::{
    BranchFilter, EventType, PrAction, PullRequestFilter, TriggerDecision, TriggerEvent,
    TriggerFilter,
};
pub use workflow::{CoverageConfig, UploadConfig, Workflow};
