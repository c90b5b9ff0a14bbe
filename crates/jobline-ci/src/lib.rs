//! Jobline CI - job engine
//!
//! Runs one test job end to end:
//! - Starts backing services and gates each on its readiness probe
//! - Installs the toolchain, reusing a lock-keyed dependency cache
//! - Prepares the application and runs the suite under coverage
//! - Uploads the coverage report on a best-effort side channel
//! - Records every lifecycle event as a run in the ledger

pub mod coverage;
pub mod gate;
pub mod pipeline;
pub mod provision;
pub mod runner;
pub mod stage;
pub mod summary;
pub mod toolchain;
pub mod upload;

// Re-export key types
pub use coverage::CoverageArtifact;
pub use gate::{FailureClass, GateVerdict, JobGate};
pub use pipeline::{JobOptions, JobPipeline, JobReport, JobStatus};
pub use provision::{
    wait_until_ready, DefaultProbeRunner, DockerRuntime, ProbeRunner, ProvisionError,
    ProvisionFailure, ProvisionedServices, Provisioner, ServiceHandle, ServiceReadiness,
    ServiceRuntime, StartedServices,
};
pub use runner::{JobContext, StepOutcome, StepResult, StepRunner, TIMEOUT_EXIT_CODE};
pub use stage::{BuiltinStep, BuiltinWorkflow};
pub use summary::TestSummary;
pub use toolchain::{DependencyCache, FsDependencyCache, LockSignature};
pub use upload::{
    spawn_upload, CoverageUploader, HttpUploader, Secret, UploadContext, UploadError,
    UploadOutcome,
};
