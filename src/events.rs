//! JSON status events
//!
//! One JSON object per line, consumable by external tools. Every event carries
//! a `type` tag and an RFC 3339 timestamp.

use crate::recipe::Value;
use crate::session::SessionState;
use crate::snapshot::Snapshot;
use crate::supervisor::ProgramState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Program lifecycle event emitted on every supervisor transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub submission_id: u64,
    pub state: ProgramState,
    pub paused: bool,
    pub message: String,
}

impl ProgramEvent {
    pub fn new(submission_id: u64, state: ProgramState, paused: bool, message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: "program_status",
            submission_id,
            state,
            paused,
            message: message.to_string(),
        }
    }
}

/// Telemetry event for the monitor output
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub state: SessionState,
    pub sequence: u64,
    pub stale: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

impl SessionEvent {
    pub fn from_snapshot(state: SessionState, snapshot: &Snapshot) -> Self {
        Self {
            timestamp: snapshot.received_at,
            event_type: "robot_state",
            state,
            sequence: snapshot.sequence,
            stale: snapshot.stale,
            fields: snapshot.to_map(),
        }
    }

    /// State change without a sample
    pub fn state_change(state: SessionState) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: "session_state",
            state,
            sequence: 0,
            stale: false,
            fields: BTreeMap::new(),
        }
    }
}

/// Error event, optionally tied to a submission
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<u64>,
    pub error: String,
}

impl ErrorEvent {
    pub fn new(error: &str, submission_id: Option<u64>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: "error",
            submission_id,
            error: error.to_string(),
        }
    }
}

/// Serialize an event as a single JSON line
pub fn to_json_line<T: Serialize>(event: &T) -> Option<String> {
    serde_json::to_string(event).ok()
}

/// Write an event to stdout as one JSON line
pub fn output_event<T: Serialize>(event: &T) {
    if let Some(json) = to_json_line(event) {
        println!("{}", json);
    }
}
