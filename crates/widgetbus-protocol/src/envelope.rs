//! Envelopes carried between widget contexts and the coordinator.
//!
//! The coordinator never inspects `message`; it forwards `publish`
//! envelopes verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cross-context bridge message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum BridgeEnvelope {
    /// Widget to coordinator: request an identity token.
    #[serde(rename = "ack")]
    Ack,

    /// Coordinator to widget: assigns the widget's identity token.
    #[serde(rename = "set_uid")]
    SetUid {
        /// The assigned uid.
        uid: String,
    },

    /// A publish, in either direction.
    #[serde(rename = "publish")]
    Publish {
        /// Channel the message was published on.
        channel: String,
        /// Arbitrary payload.
        message: Value,
        /// Uid of the publishing widget.
        uid: String,
    },
}

impl BridgeEnvelope {
    /// Create a `set_uid` envelope.
    #[must_use]
    pub fn set_uid(uid: impl Into<String>) -> Self {
        BridgeEnvelope::SetUid { uid: uid.into() }
    }

    /// Create a `publish` envelope.
    #[must_use]
    pub fn publish(channel: impl Into<String>, message: Value, uid: impl Into<String>) -> Self {
        BridgeEnvelope::Publish {
            channel: channel.into(),
            message,
            uid: uid.into(),
        }
    }

    /// The `action` tag of this envelope.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            BridgeEnvelope::Ack => "ack",
            BridgeEnvelope::SetUid { .. } => "set_uid",
            BridgeEnvelope::Publish { .. } => "publish",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let ack = serde_json::to_value(BridgeEnvelope::Ack).unwrap();
        assert_eq!(ack, json!({"action": "ack"}));

        let set_uid = serde_json::to_value(BridgeEnvelope::set_uid("u1")).unwrap();
        assert_eq!(set_uid, json!({"action": "set_uid", "uid": "u1"}));

        let publish = serde_json::to_value(BridgeEnvelope::publish("ping", json!("hi"), "u2")).unwrap();
        assert_eq!(
            publish,
            json!({"action": "publish", "channel": "ping", "message": "hi", "uid": "u2"})
        );
    }

    #[test]
    fn test_envelope_parse() {
        let parsed: BridgeEnvelope = serde_json::from_value(
            json!({"action": "publish", "channel": "ping", "message": {"x": 1}, "uid": "u2"}),
        )
        .unwrap();
        assert_eq!(parsed.action(), "publish");

        let unknown = serde_json::from_value::<BridgeEnvelope>(json!({"action": "send"}));
        assert!(unknown.is_err());
    }
}
