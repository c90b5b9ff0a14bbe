//! Process-wide counters for job activity.
//!
//! Counters are bumped at the call site and emitted together by
//! [`Metrics::flush`] at the end of a job.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    events_recorded: AtomicU64,
    probes_attempted: AtomicU64,
    steps_executed: AtomicU64,
    steps_cached: AtomicU64,
    uploads_attempted: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_recorded: AtomicU64::new(0),
            probes_attempted: AtomicU64::new(0),
            steps_executed: AtomicU64::new(0),
            steps_cached: AtomicU64::new(0),
            uploads_attempted: AtomicU64::new(0),
        }
    }

    pub fn inc_events_recorded(&self) {
        self.events_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_probes(&self) {
        self.probes_attempted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "probes_attempted", "counter incremented");
    }

    pub fn inc_steps(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_executed", "counter incremented");
    }

    pub fn inc_steps_cached(&self) {
        self.steps_cached.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_cached", "counter incremented");
    }

    pub fn inc_uploads(&self) {
        self.uploads_attempted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "uploads_attempted", "counter incremented");
    }

    /// Emit all counters as one `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_recorded = self.events_recorded(),
            probes_attempted = self.probes_attempted(),
            steps_executed = self.steps_executed(),
            steps_cached = self.steps_cached(),
            uploads_attempted = self.uploads_attempted(),
        );
    }

    pub fn events_recorded(&self) -> u64 {
        self.events_recorded.load(Ordering::Relaxed)
    }

    pub fn probes_attempted(&self) -> u64 {
        self.probes_attempted.load(Ordering::Relaxed)
    }

    pub fn steps_executed(&self) -> u64 {
        self.steps_executed.load(Ordering::Relaxed)
    }

    pub fn steps_cached(&self) -> u64 {
        self.steps_cached.load(Ordering::Relaxed)
    }

    pub fn uploads_attempted(&self) -> u64 {
        self.uploads_attempted.load(Ordering::Relaxed)
    }
}
