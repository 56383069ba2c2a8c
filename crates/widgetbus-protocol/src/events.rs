//! Relay events exchanged between relay clients and the broadcast server.
//!
//! Every event is a `{event, data}` pair. Queries and their replies share an
//! event name; the request carries no data and the reply carries the answer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::version::Version;

/// Event names as they appear on the wire.
pub mod names {
    pub const PUBLISH: &str = "publish";
    pub const MESSAGE: &str = "message";
    pub const ACK: &str = "ack";
    pub const ROOM_SWITCH: &str = "room.switch";
    pub const ROOM_GET_NAME: &str = "room.get.name";
    pub const ROOM_GET_ALL_NAME: &str = "room.get.all.name";
    pub const USER_SET_NAME: &str = "user.set.name";
    pub const USER_GET_NAME: &str = "user.get.name";
    pub const USER_GET_ALL_NAME: &str = "user.get.all.name";
    pub const CONNECTED: &str = "connected";
    /// Synthetic event raised locally by a client when its connection ends.
    pub const DISCONNECT: &str = "disconnect";
}

/// A relay message as it appears on the wire.
///
/// Fields are optional here so that a malformed message can still be
/// decoded, logged and acknowledged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawMessage {
    /// Topic the message was published on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Message payload.
    #[serde(default)]
    pub data: Value,
    /// Uid of the publishing widget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl RawMessage {
    /// Create a well-formed raw message.
    #[must_use]
    pub fn new(topic: impl Into<String>, data: Value, uid: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            data,
            uid: Some(uid.into()),
        }
    }
}

/// Returned when a raw message lacks a topic.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("message has no topic")]
pub struct MalformedMessage;

/// A validated relay message.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Message payload.
    pub data: Value,
    /// Uid of the publishing widget, empty when the sender gave none.
    pub uid: String,
}

impl TryFrom<RawMessage> for RelayMessage {
    type Error = MalformedMessage;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let topic = raw.topic.ok_or(MalformedMessage)?;
        Ok(Self {
            topic,
            data: raw.data,
            uid: raw.uid.unwrap_or_default(),
        })
    }
}

impl From<RelayMessage> for RawMessage {
    fn from(msg: RelayMessage) -> Self {
        Self {
            topic: Some(msg.topic),
            data: msg.data,
            uid: Some(msg.uid),
        }
    }
}

/// A relay protocol event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    /// Client publishes a message to its room.
    #[serde(rename = "publish")]
    Publish(RawMessage),

    /// Server delivers a message published by a room peer.
    #[serde(rename = "message")]
    Message(RawMessage),

    /// Client acknowledges a delivered message.
    #[serde(rename = "ack")]
    Ack(RawMessage),

    /// Client moves to another room.
    #[serde(rename = "room.switch")]
    RoomSwitch(String),

    /// Current room query / reply.
    #[serde(rename = "room.get.name")]
    RoomGetName(Option<String>),

    /// Occupied rooms query / reply.
    #[serde(rename = "room.get.all.name")]
    RoomGetAllName(Option<Vec<String>>),

    /// Client registers a display name.
    #[serde(rename = "user.set.name")]
    UserSetName(String),

    /// Own display name query / reply.
    #[serde(rename = "user.get.name")]
    UserGetName(Option<String>),

    /// Room members' display names query / reply.
    #[serde(rename = "user.get.all.name")]
    UserGetAllName(Option<Vec<String>>),

    /// Server greeting sent once per connection.
    #[serde(rename = "connected")]
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Server protocol version.
        version: Version,
    },
}

impl Event {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::Publish(_) => names::PUBLISH,
            Event::Message(_) => names::MESSAGE,
            Event::Ack(_) => names::ACK,
            Event::RoomSwitch(_) => names::ROOM_SWITCH,
            Event::RoomGetName(_) => names::ROOM_GET_NAME,
            Event::RoomGetAllName(_) => names::ROOM_GET_ALL_NAME,
            Event::UserSetName(_) => names::USER_SET_NAME,
            Event::UserGetName(_) => names::USER_GET_NAME,
            Event::UserGetAllName(_) => names::USER_GET_ALL_NAME,
            Event::Connected { .. } => names::CONNECTED,
        }
    }

    /// Get the `data` part of this event as JSON.
    #[must_use]
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Create a `publish` event.
    #[must_use]
    pub fn publish(topic: impl Into<String>, data: Value, uid: impl Into<String>) -> Self {
        Event::Publish(RawMessage::new(topic, data, uid))
    }

    /// Create a `connected` greeting.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: Version) -> Self {
        Event::Connected {
            connection_id: connection_id.into(),
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_names() {
        assert_eq!(Event::publish("t", json!(1), "u").name(), "publish");
        assert_eq!(Event::RoomSwitch("ops".into()).name(), "room.switch");
        assert_eq!(Event::UserGetAllName(None).name(), "user.get.all.name");
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::publish("ping", json!({"x": 1}), "u1");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "publish", "data": {"topic": "ping", "data": {"x": 1}, "uid": "u1"}})
        );

        let reply = Event::RoomGetAllName(Some(vec!["ops".into()]));
        assert_eq!(reply.payload(), json!(["ops"]));
        assert_eq!(Event::RoomGetName(None).payload(), Value::Null);
    }

    #[test]
    fn test_malformed_message() {
        let raw: RawMessage = serde_json::from_value(json!({"data": "orphan"})).unwrap();
        assert_eq!(RelayMessage::try_from(raw), Err(MalformedMessage));

        let raw: RawMessage = serde_json::from_value(json!({"topic": "t", "data": 5})).unwrap();
        let msg = RelayMessage::try_from(raw).unwrap();
        assert_eq!(msg.topic, "t");
        assert_eq!(msg.uid, "");
    }
}
