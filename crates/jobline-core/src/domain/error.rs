//! Domain-level error taxonomy for Jobline.

/// Jobline domain errors.
#[derive(Debug, thiserror::Error)]
pub enum JoblineError {
    #[error("invalid trigger event: {0}")]
    InvalidEvent(String),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("invalid step graph: {0}")]
    Graph(#[from] crate::graph::GraphError),

    #[error("missing environment variable(s): {}", .0.join(", "))]
    MissingEnvVars(Vec<String>),

    #[error("git error: {0}")]
    GitError(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("storage error: {0}")]
    Storage(#[from] jobline_state::StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Jobline domain operations.
pub type Result<T> = std::result::Result<T, JoblineError>;
