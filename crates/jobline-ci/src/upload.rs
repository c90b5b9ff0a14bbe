//! Best-effort coverage upload to an external reporting service.
//!
//! Upload outcomes are recorded but never change the job verdict.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobline_core::UploadConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::coverage::CoverageArtifact;

/// A credential that never appears in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read the secret from the environment variable `var`; unset or empty is `None`.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Self)
    }

    /// The raw value, for building the request only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("coverage report not found at {0}")]
    MissingArtifact(PathBuf),

    #[error("failed to read coverage report: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("upload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("upload timed out after {0}s")]
    TimedOut(u64),

    #[error("upload task failed: {0}")]
    Task(String),
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Http(err.to_string())
    }
}

/// Commit identity attached to an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadContext {
    pub commit: Option<String>,
    pub branch: String,
    pub name: Option<String>,
}

/// Final state of the upload side channel for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    Succeeded,
    Failed { error: String },
    Skipped { reason: String },
    /// The job ended before the upload stage.
    NotReached,
}

impl UploadOutcome {
    pub fn attempted(&self) -> bool {
        matches!(self, UploadOutcome::Succeeded | UploadOutcome::Failed { .. })
    }
}

#[async_trait]
pub trait CoverageUploader: Send + Sync {
    async fn upload(
        &self,
        artifact: &CoverageArtifact,
        token: &Secret,
        context: &UploadContext,
    ) -> Result<(), UploadError>;
}

/// POSTs the report body to the configured endpoint.
pub struct HttpUploader {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("jobline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn from_config(config: &UploadConfig) -> Result<Self, UploadError> {
        Self::new(config.endpoint.clone())
    }
}

#[async_trait]
impl CoverageUploader for HttpUploader {
    async fn upload(
        &self,
        artifact: &CoverageArtifact,
        token: &Secret,
        context: &UploadContext,
    ) -> Result<(), UploadError> {
        if !artifact.exists() {
            return Err(UploadError::MissingArtifact(artifact.path().to_path_buf()));
        }
        let body = artifact.read().await?;

        let mut query: Vec<(&str, &str)> = vec![("branch", context.branch.as_str())];
        if let Some(commit) = &context.commit {
            query.push(("commit", commit));
        }
        if let Some(name) = &context.name {
            query.push(("name", name));
        }

        debug!(endpoint = %self.endpoint, bytes = body.len(), "uploading coverage report");
        let response = self
            .client
            .post(&self.endpoint)
            .query(&query)
            .header(reqwest::header::AUTHORIZATION, format!("token {}", token.expose()))
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(UploadError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            })
        }
    }
}

/// Run one upload as a detached task bounded by `timeout`.
pub fn spawn_upload(
    uploader: Arc<dyn CoverageUploader>,
    artifact: CoverageArtifact,
    token: Secret,
    context: UploadContext,
    timeout: Duration,
) -> JoinHandle<Result<(), UploadError>> {
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, uploader.upload(&artifact, &token, &context)).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::TimedOut(timeout.as_secs())),
        }
    })
}
