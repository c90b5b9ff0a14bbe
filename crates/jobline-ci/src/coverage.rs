//! The coverage report handed from the test executor to the uploader.

use std::path::{Path, PathBuf};

use jobline_core::Workflow;

/// A coverage report at a fixed path inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageArtifact {
    path: PathBuf,
}

impl CoverageArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The report configured by `workflow`, resolved against `workspace`.
    pub fn for_workflow(workflow: &Workflow, workspace: &Path) -> Self {
        Self::new(workspace.join(&workflow.coverage.report_path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn size(&self) -> std::io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    /// Remove a report left behind by an earlier run in the same workspace.
    /// Returns whether there was one.
    pub async fn discard(&self) -> std::io::Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn artifact_reads_report() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = CoverageArtifact::new(dir.path().join("coverage.xml"));
        assert!(!artifact.exists());
        assert!(artifact.size().is_err());

        std::fs::write(artifact.path(), "<coverage line-rate=\"0.9\"/>").unwrap();
        assert!(artifact.exists());
        assert_eq!(artifact.size().unwrap(), 27);
        assert!(artifact.read().await.unwrap().starts_with(b"<coverage"));
    }

    #[tokio::test]
    async fn discard_removes_leftover_report() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = CoverageArtifact::new(dir.path().join("coverage.xml"));
        assert!(!artifact.discard().await.unwrap());

        std::fs::write(artifact.path(), "<coverage/>").unwrap();
        assert!(artifact.discard().await.unwrap());
        assert!(!artifact.exists());
    }

    #[test]
    fn directory_is_not_an_artifact() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!CoverageArtifact::new(dir.path()).exists());
    }
}
