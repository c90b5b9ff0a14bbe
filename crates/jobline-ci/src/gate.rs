//! Job verdict reconstructed from recorded run events.

use std::collections::HashSet;

use jobline_state::RunEvent;
use serde::{Deserialize, Serialize};

/// Which part of the job failed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Provisioning,
    Toolchain,
    Preparation,
    Tests,
    Timeout,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Provisioning => "provisioning",
            FailureClass::Toolchain => "toolchain",
            FailureClass::Preparation => "preparation",
            FailureClass::Tests => "tests",
            FailureClass::Timeout => "timeout",
        }
    }

    fn from_phase(phase: &str) -> Self {
        match phase {
            "toolchain" => FailureClass::Toolchain,
            "preparation" => FailureClass::Preparation,
            _ => FailureClass::Tests,
        }
    }
}

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,

    /// Class of the first failure (None if passed).
    pub failure_class: Option<FailureClass>,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    pub message: String,
}

pub struct JobGate;

impl JobGate {
    /// Replay a run's events and decide pass/fail.
    ///
    /// Rules:
    /// - `service_unhealthy`, `provisioning_failed`, `step_failed` and
    ///   `job_timed_out` are violations
    /// - a `step_started` without a matching `step_passed`/`step_failed` is a
    ///   violation
    /// - upload events are ignored; the test verdict never depends on them
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut failure_class = None;
        let mut started = Vec::new();
        let mut finished = HashSet::new();

        let step_id = |event: &RunEvent| {
            event.payload["step_id"]
                .as_str()
                .unwrap_or("unknown")
                .to_string()
        };

        for event in events {
            match event.kind.as_str() {
                "service_unhealthy" => {
                    let service = event.payload["service"].as_str().unwrap_or("unknown");
                    let error = event.payload["error"].as_str().unwrap_or("not ready");
                    violations.push(format!("Service '{service}' unhealthy: {error}"));
                    failure_class.get_or_insert(FailureClass::Provisioning);
                }
                "provisioning_failed" => {
                    failure_class.get_or_insert(FailureClass::Provisioning);
                }
                "step_started" => started.push(step_id(event)),
                "step_passed" => {
                    finished.insert(step_id(event));
                }
                "step_failed" => {
                    let id = step_id(event);
                    let phase = event.payload["phase"].as_str().unwrap_or("test");
                    let exit_code = event.payload["exit_code"].as_i64().unwrap_or(-1);
                    violations.push(format!(
                        "Step '{id}' ({phase}) failed with exit code {exit_code}"
                    ));
                    failure_class.get_or_insert(FailureClass::from_phase(phase));
                    finished.insert(id);
                }
                "job_timed_out" => {
                    violations.push("Job exceeded its global timeout".to_string());
                    failure_class.get_or_insert(FailureClass::Timeout);
                }
                _ => {}
            }
        }

        for id in &started {
            if !finished.contains(id) && failure_class != Some(FailureClass::Timeout) {
                violations.push(format!("Step '{id}' was started but never completed"));
            }
        }

        let passed = violations.is_empty() && failure_class.is_none();
        let message = if passed {
            "All steps passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            failure_class,
            violations,
            message,
        }
    }
}
