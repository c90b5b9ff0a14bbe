//! Job lifecycle adapter: bridges domain `Event`s to `RunLedger` persistence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use jobline_state::{ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunSummary, StorageResult};

use crate::domain::run::{Event, EventKind};
use crate::metrics::METRICS;

/// Adapter that records job lifecycle [`Event`]s into a [`RunLedger`].
///
/// Usage:
/// 1. Call [`JobRunRecorder::start`] to create a new run.
/// 2. Call [`JobRunRecorder::record`] for each domain event; sequence
///    numbers are assigned here, starting at 1.
/// 3. Call one of the `finish_*` methods to finalize.
pub struct JobRunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    next_seq: AtomicU64,
}

impl JobRunRecorder {
    /// Start a new run in the ledger, returning a recorder bound to that run.
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        workflow_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<Self> {
        let run_id = ledger.create_run(workflow_digest, metadata).await?;
        Ok(Self {
            ledger,
            run_id,
            next_seq: AtomicU64::new(1),
        })
    }

    /// Record a single domain event into the ledger.
    pub async fn record(&self, event: &Event) -> StorageResult<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let kind = event.kind.tag();
        let run_event = RunEvent {
            seq,
            kind: kind.clone(),
            payload: event.merged_payload(),
            timestamp: event.timestamp,
        };
        crate::obs::emit_event_appended(&self.run_id.to_string(), &kind, seq);
        METRICS.inc_events_recorded();
        self.ledger.append_event(&self.run_id, run_event).await
    }

    /// Shorthand for `record(&Event::new(kind, payload))`.
    pub async fn emit(&self, kind: EventKind, payload: serde_json::Value) -> StorageResult<()> {
        self.record(&Event::new(kind, payload)).await
    }

    /// Number of events recorded so far.
    pub fn events_recorded(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Finalize the run as completed.
    pub async fn finish_ok(self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.complete_run(&self.run_id, summary).await
    }

    /// Finalize the run as failed.
    pub async fn finish_err(self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.fail_run(&self.run_id, summary).await
    }

    /// Finalize the run as cancelled (global timeout).
    pub async fn finish_cancelled(self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.cancel_run(&self.run_id, summary).await
    }

    /// Return a reference to the run ID.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}
