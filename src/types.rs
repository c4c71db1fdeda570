//! Core types for the live-query client.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Client-assigned identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of change notification delivered for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Create,
    Update,
    Delete,
    Enter,
    Leave,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Create,
        EventType::Update,
        EventType::Delete,
        EventType::Enter,
        EventType::Leave,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
            EventType::Enter => "enter",
            EventType::Leave => "leave",
        }
    }

    /// Whether frames of this kind carry the object's previous state.
    pub fn carries_original(self) -> bool {
        matches!(self, EventType::Update | EventType::Enter | EventType::Leave)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(EventType::Create),
            "update" => Ok(EventType::Update),
            "delete" => Ok(EventType::Delete),
            "enter" => Ok(EventType::Enter),
            "leave" => Ok(EventType::Leave),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// A change notification decoded from one inbound frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub class_name: String,
    /// The object's current state.
    pub object_data: serde_json::Value,
    /// Previous state, present for update/enter/leave.
    pub original_data: Option<serde_json::Value>,
    /// The subscription this event belongs to.
    pub request_id: RequestId,
    pub received_at: Timestamp,
    /// The full decoded frame.
    pub raw: serde_json::Value,
}

impl Event {
    /// Object id (`objectId`) of the changed record, if present.
    pub fn object_id(&self) -> Option<&str> {
        self.object_data.get("objectId").and_then(|v| v.as_str())
    }
}

/// Lifecycle state of the client's logical connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link; a reconnect may be pending.
    Disconnected,
    /// Transport opening or handshake in flight.
    Connecting,
    /// Handshake acknowledged.
    Connected,
    /// Closed by the caller; terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}
