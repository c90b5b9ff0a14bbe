//! Structured observability hooks for the job lifecycle.
//!
//! This module provides:
//! - A run-scoped tracing span via [`job_span`]
//! - Emission functions for key lifecycle events: job start/finish, service
//!   readiness, step completion, upload outcome, gate evaluation
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).
//! For JSON output, pass `--json` to the CLI.

use tracing::{info, warn};

/// Span covering one job; attach it with `tracing::Instrument` so it
/// follows the job future across await points.
pub fn job_span(run_id: &str, job_name: &str) -> tracing::Span {
    tracing::info_span!("jobline.job", run_id = %run_id, job = %job_name)
}

/// Emit event: trigger matched and the job started.
pub fn emit_job_started(run_id: &str, job_name: &str, trigger: &str) {
    info!(event = "job.started", run_id = %run_id, job = %job_name, trigger = %trigger);
}

/// Emit event: trigger did not match.
pub fn emit_job_skipped(job_name: &str, trigger: &str, reason: &str) {
    info!(event = "job.skipped", job = %job_name, trigger = %trigger, reason = %reason);
}

/// Emit event: job finished with its status label and exit code.
pub fn emit_job_finished(run_id: &str, status: &str, exit_code: i32, duration_ms: u64) {
    info!(
        event = "job.finished",
        run_id = %run_id,
        status = %status,
        exit_code = exit_code,
        duration_ms = duration_ms,
    );
}

/// Emit event: a single event appended to the run.
pub fn emit_event_appended(run_id: &str, event_kind: &str, seq: u64) {
    tracing::debug!(event = "run.event_appended", run_id = %run_id, kind = %event_kind, seq = seq);
}

/// Emit event: a service passed its readiness gate.
pub fn emit_service_healthy(service: &str, attempts: u32) {
    info!(event = "service.healthy", service = %service, attempts = attempts);
}

/// Emit event: a service failed to become ready (warning level).
pub fn emit_service_unhealthy(service: &str, attempts: u32, error: &str) {
    warn!(event = "service.unhealthy", service = %service, attempts = attempts, error = %error);
}

/// Emit event: a step finished.
pub fn emit_step_finished(step_id: &str, exit_code: i32, duration_ms: u64, passed: bool) {
    info!(
        event = "step.finished",
        step = %step_id,
        exit_code = exit_code,
        duration_ms = duration_ms,
        passed = passed,
    );
}

/// Emit event: coverage upload failed (warning level, never fatal).
pub fn emit_upload_failed(error: &dyn std::fmt::Display) {
    warn!(event = "upload.failed", error = %error);
}

/// Emit event: gate evaluation completed.
pub fn emit_gate_evaluated(run_id: &str, passed: bool, violations: usize) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        passed = passed,
        violations = violations,
    );
}

/// Emit event: run finalization error (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}
