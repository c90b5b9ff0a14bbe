//! Dependency-install caching keyed by the lock file signature.
//!
//! Caching only ever skips work: a missing lock file, an unreadable cache
//! directory or a failed marker write all fall back to running the step.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// SHA-256 (hex) of a lock file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockSignature(String);

impl LockSignature {
    pub async fn compute(lock_file: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(lock_file).await?;
        Ok(Self::from_bytes(&bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for LockSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record of dependency sets already materialised.
#[async_trait]
pub trait DependencyCache: Send + Sync {
    async fn contains(&self, signature: &LockSignature) -> bool;

    async fn store(&self, signature: &LockSignature) -> std::io::Result<()>;
}

/// Marker files under a cache directory, one per signature.
#[derive(Debug, Clone)]
pub struct FsDependencyCache {
    dir: PathBuf,
}

impl FsDependencyCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `JOBLINE_CACHE_DIR`, or `.jobline/cache`.
    pub fn from_env() -> Self {
        let dir = std::env::var("JOBLINE_CACHE_DIR").unwrap_or_else(|_| ".jobline/cache".to_string());
        Self::new(dir)
    }

    fn marker(&self, signature: &LockSignature) -> PathBuf {
        self.dir.join(format!("{}.ok", signature.as_str()))
    }
}

#[async_trait]
impl DependencyCache for FsDependencyCache {
    async fn contains(&self, signature: &LockSignature) -> bool {
        tokio::fs::try_exists(self.marker(signature))
            .await
            .unwrap_or(false)
    }

    async fn store(&self, signature: &LockSignature) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.marker(signature), b"").await
    }
}
