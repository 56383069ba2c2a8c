//! # widgetbus-protocol
//!
//! Wire protocol definitions for the widgetbus messaging fabric.
//!
//! Two independent protocols live here:
//!
//! - **Bridge envelopes** - messages exchanged between a widget context and
//!   the shared coordinator (`ack`, `set_uid`, `publish`)
//! - **Relay events** - messages exchanged between a relay client and the
//!   room-scoped broadcast server, framed by the binary codec
//!
//! ## Example
//!
//! ```rust
//! use widgetbus_protocol::{codec, Event, RawMessage};
//! use serde_json::json;
//!
//! let event = Event::Publish(RawMessage::new("chat", json!({"text": "hi"}), "u1"));
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod events;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::BridgeEnvelope;
pub use events::{Event, MalformedMessage, RawMessage, RelayMessage};
pub use version::{Version, VersionError, PROTOCOL_VERSION};
