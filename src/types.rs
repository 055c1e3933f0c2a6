//! Core types for the stream subscriber.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Event type of the marker events appended to heartbeat streams.
pub const HEARTBEAT_EVENT_TYPE: &str = "SubscriberHeartbeat";

/// Prefix reserved for system-internal event types.
pub const SYSTEM_EVENT_PREFIX: &str = "$";

/// Position of an event within the stream it was read from.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct StreamPosition(pub u64);

impl fmt::Debug for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({})", self.0)
    }
}

impl fmt::Display for StreamPosition {
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
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// An event delivered by the event source.
///
/// `position` is the position in the subscribed stream, which differs from the
/// event's own stream when subscribing to an aggregate stream such as the
/// all-stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribedEvent {
    pub position: StreamPosition,
    pub event_type: String,
    pub payload: Vec<u8>,
    /// Stream the event was originally appended to.
    pub stream_id: String,
    pub created: Timestamp,
}

impl SubscribedEvent {
    pub fn new(
        position: StreamPosition,
        event_type: impl Into<String>,
        payload: Vec<u8>,
        stream_id: impl Into<String>,
    ) -> Self {
        Self {
            position,
            event_type: event_type.into(),
            payload,
            stream_id: stream_id.into(),
            created: Timestamp::now(),
        }
    }

    /// System events are counted but never handed to the dispatcher.
    pub fn is_system(&self) -> bool {
        self.event_type.starts_with(SYSTEM_EVENT_PREFIX)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event_type == HEARTBEAT_EVENT_TYPE
    }

    /// Decode the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Why the event source dropped a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The subscription was closed or stopped by its owner.
    UserInitiated,
    /// The connection to the server was lost.
    ConnectionClosed,
    /// The server reported an error.
    ServerError,
    /// The subscribe request itself failed.
    SubscribingError,
    /// Reading history failed during catch-up.
    CatchUpError,
    /// The subscriber fell too far behind live events.
    ProcessingQueueOverflow,
    Unknown,
}

impl DropReason {
    pub fn is_user_initiated(self) -> bool {
        self == DropReason::UserInitiated
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DropReason::UserInitiated => "user_initiated",
            DropReason::ConnectionClosed => "connection_closed",
            DropReason::ServerError => "server_error",
            DropReason::SubscribingError => "subscribing_error",
            DropReason::CatchUpError => "catch_up_error",
            DropReason::ProcessingQueueOverflow => "processing_queue_overflow",
            DropReason::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Snapshot of how far a catch-up subscription has come.
#[derive(Clone, Debug, PartialEq)]
pub struct CatchUpProgress {
    pub events_processed: u64,
    /// Position the subscriber was constructed to start from (0 for stream start).
    pub starting_position: u64,
    pub stream_name: String,
    /// Position of the last event currently in the stream.
    pub last_position: Option<StreamPosition>,
}

impl CatchUpProgress {
    /// Percentage of the stream processed, clamped to `0.0..=100.0`.
    ///
    /// An empty stream is reported as fully processed.
    pub fn percentage(&self) -> f64 {
        let Some(last) = self.last_position else {
            return 100.0;
        };
        let total = last.0.saturating_add(1);
        let done = self
            .starting_position
            .saturating_add(self.events_processed)
            .min(total);
        done as f64 / total as f64 * 100.0
    }
}
