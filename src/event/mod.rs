use crate::config::SourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;


/// Event represents one item published by a source onto the bus.
///
/// The wire shape is fixed: no envelope is added around these five fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Id of the source configuration that produced the event
    pub source: String,

    /// Transport-defined event type (e.g. "message", "tick", "MESSAGE_CREATE")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Decoded payload
    pub data: Map<String, Value>,

    /// Emission time (ISO-8601 on the wire)
    pub timestamp: DateTime<Utc>,

    /// Original untouched payload, kept for debugging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: Map<String, Value>,
        raw: Option<Value>,
    ) -> Self {
        Self {
            source: source.into(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            raw,
        }
    }
}

/// Connection status of a source.
///
/// `Stopped` is terminal: once reached, no reconnection logic runs again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Stopped,
}

impl SourceStatus {
    pub fn is_stopped(self) -> bool {
        self == SourceStatus::Stopped
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Disconnected => "disconnected",
            SourceStatus::Connecting => "connecting",
            SourceStatus::Connected => "connected",
            SourceStatus::Error => "error",
            SourceStatus::Stopped => "stopped",
        }
    }
}

impl Default for SourceStatus {
    fn default() -> Self {
        SourceStatus::Disconnected
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of a source's counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub id: String,
    pub kind: SourceKind,
    pub status: SourceStatus,
    /// Count of emitted events (filtered events are not counted)
    pub events_received: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}
