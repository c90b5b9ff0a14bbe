//! Filesystem-backed `RunLedger`.
//!
//! Layout: `<root>/<run_id>/run.json` holds the `RunRecord`,
//! `<root>/<run_id>/events.jsonl` holds one `RunEvent` per line.
//! Record rewrites are atomic (temp file in the same directory, then rename).

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

const RUN_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";

/// JSON-file implementation of [`RunLedger`].
pub struct FsRunLedger {
    root: PathBuf,
    // Serializes read-modify-write cycles on run.json.
    write_lock: Mutex<()>,
}

impl FsRunLedger {
    /// Open (and create if needed) a ledger rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Open the ledger at `$JOBLINE_STATE_DIR/runs`, defaulting to `.jobline/runs`.
    pub fn from_env() -> StorageResult<Self> {
        let base = std::env::var("JOBLINE_STATE_DIR").unwrap_or_else(|_| ".jobline".to_string());
        Self::new(Path::new(&base).join("runs"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(&run_id.0)
    }

    fn read_record(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let path = self.run_dir(run_id).join(RUN_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::RunNotFound {
                    run_id: run_id.0.clone(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_record(&self, record: &RunRecord) -> StorageResult<()> {
        let dir = self.run_dir(&record.run_id);
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(record)?)?;
        tmp.persist(dir.join(RUN_FILE)).map_err(|e| e.error)?;
        Ok(())
    }

    /// The guarded value is `()`, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        let _guard = self.lock();
        let mut record = self.read_record(run_id)?;
        finalize(&mut record, status, summary)?;
        self.write_record(&record)
    }
}

#[async_trait]
impl RunLedger for FsRunLedger {
    async fn create_run(
        &self,
        workflow_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            workflow_digest: workflow_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let _guard = self.lock();
        self.write_record(&record)?;
        debug!(run_id = %run_id, root = %self.root.display(), "run created");
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let _guard = self.lock();
        let record = self.read_record(run_id)?;
        ensure_running(&record)?;

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir(run_id).join(EVENTS_FILE))?;
        file.write_all(&line)?;
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.transition(run_id, RunStatus::Completed, summary)
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.transition(run_id, RunStatus::Failed, summary)
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.transition(run_id, RunStatus::Cancelled, summary)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.read_record(run_id)
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        // Existence check first so unknown runs report RunNotFound.
        self.read_record(run_id)?;

        let path = self.run_dir(run_id).join(EVENTS_FILE);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<RunEvent>(&line)?);
        }
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(
        &self,
        workflow_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let run_id = RunId(entry.file_name().to_string_lossy().into_owned());
            match self.read_record(&run_id) {
                Ok(record) => {
                    if workflow_digest
                        .map(|d| record.workflow_digest == *d)
                        .unwrap_or(true)
                    {
                        records.push(record);
                    }
                }
                // Directories without run.json are not runs.
                Err(StorageError::RunNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
