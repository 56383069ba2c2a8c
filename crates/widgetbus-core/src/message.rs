//! Message helpers shared by the relay client and the room hub.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use widgetbus_protocol::RawMessage;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Whether a payload carries no content.
///
/// `null`, `{}`, `[]` and whitespace-only strings are empty; numbers and
/// booleans are not.
#[must_use]
pub fn is_empty_payload(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// A message stored in a room's archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    /// Room the message was published in.
    pub room: String,
    /// Archive time in milliseconds since the epoch.
    pub timestamp: u64,
    /// The message exactly as the publisher sent it.
    pub message: RawMessage,
}

impl ArchivedMessage {
    /// Create an archive entry.
    #[must_use]
    pub fn new(room: impl Into<String>, timestamp: u64, message: RawMessage) -> Self {
        Self {
            room: room.into(),
            timestamp,
            message,
        }
    }
}
