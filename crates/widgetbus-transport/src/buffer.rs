//! Reassembly of relay events from WebSocket messages.

use bytes::BytesMut;
use tracing::warn;
use widgetbus_protocol::{codec, Event, ProtocolError};

use crate::traits::TransportError;

/// Accumulates inbound bytes and yields complete events.
///
/// A WebSocket message may carry several frames or part of one.
#[derive(Debug)]
pub(crate) struct FrameBuffer {
    buf: BytesMut,
    max_message_size: usize,
}

impl FrameBuffer {
    pub(crate) fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    /// The next buffered event, if one is complete.
    pub(crate) fn next_event(&mut self) -> Result<Option<Event>, TransportError> {
        Ok(codec::decode_from(&mut self.buf)?)
    }

    /// Append one WebSocket message and try to complete an event.
    pub(crate) fn push(&mut self, data: &[u8]) -> Result<Option<Event>, TransportError> {
        if data.len() > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                data.len(),
                self.max_message_size
            );
            return Err(ProtocolError::FrameTooLarge(data.len()).into());
        }

        self.buf.extend_from_slice(data);
        self.next_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_and_joined_frames() {
        let first = codec::encode(&Event::publish("ping", json!(1), "u1")).unwrap();
        let second = codec::encode(&Event::RoomGetName(None)).unwrap();
        let mut buffer = FrameBuffer::new(1024);

        assert!(buffer.push(&first[..3]).unwrap().is_none());
        let mut rest = first[3..].to_vec();
        rest.extend_from_slice(&second);

        assert_eq!(
            buffer.push(&rest).unwrap(),
            Some(Event::publish("ping", json!(1), "u1"))
        );
        assert_eq!(buffer.next_event().unwrap(), Some(Event::RoomGetName(None)));
        assert!(buffer.next_event().unwrap().is_none());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut buffer = FrameBuffer::new(4);
        assert!(matches!(
            buffer.push(&[0; 5]),
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge(5)))
        ));
    }
}
