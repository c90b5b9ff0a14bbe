//! Job lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of an event in a job run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Trigger matched; the job is starting.
    JobStarted,

    /// Job reached a terminal status.
    JobFinished,

    /// A service container is being started.
    ServiceStarting { service: String },

    /// A service passed its readiness gate.
    ServiceHealthy { service: String },

    /// A service exhausted its health-check retries or failed to start.
    ServiceUnhealthy { service: String },

    /// Provisioning aborted the job.
    ProvisioningFailed,

    /// All services were stopped.
    ServicesTornDown,

    /// A step began executing.
    StepStarted { step_id: String },

    /// A step exited with code 0.
    StepPassed { step_id: String },

    /// A step exited non-zero, timed out, or could not be spawned.
    StepFailed { step_id: String },

    /// A step did not run (disabled, or a dependency did not pass).
    StepSkipped { step_id: String },

    /// A step was satisfied by the dependency cache.
    StepCached { step_id: String },

    /// The coverage report was handed to the uploader.
    UploadAttempted,

    /// The reporting service accepted the report.
    UploadSucceeded,

    /// Upload failed; never affects the job verdict.
    UploadFailed,

    /// Upload was not attempted (no report, no token, or disabled).
    UploadSkipped,

    /// The global job timeout expired.
    JobTimedOut,
}

impl EventKind {
    /// The snake_case tag used as `RunEvent::kind` in the ledger.
    pub fn tag(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v["type"].as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// A single event in a job's execution trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// Event classification.
    pub kind: EventKind,

    /// Event-specific payload.
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event stamped with the current time.
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }

    /// Payload with the kind's own fields merged in (kind fields win).
    pub fn merged_payload(&self) -> serde_json::Value {
        let mut merged = match &self.payload {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        if let Ok(serde_json::Value::Object(kind_fields)) = serde_json::to_value(&self.kind) {
            for (k, v) in kind_fields {
                if k != "type" {
                    merged.insert(k, v);
                }
            }
        }
        serde_json::Value::Object(merged)
    }
}
