//! Codec for encoding and decoding relay events.
//!
//! Events are MessagePack maps behind a 4-byte big-endian length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::events::Event;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Bytes left over after a complete frame.
    #[error("Invalid frame: {0} trailing bytes")]
    Invalid(usize),
}

/// Body length announced by a frame header, if the header is complete.
fn body_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(header) = buf.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

/// Encode an event into a standalone frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(event: &Event) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Append an encoded frame to `buf`.
///
/// `buf` is untouched on error.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(event: &Event, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = rmp_serde::to_vec_named(event)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(())
}

/// Decode exactly one frame.
///
/// # Errors
///
/// Returns an error if `data` is short, oversized, malformed or carries
/// bytes past the frame.
pub fn decode(data: &[u8]) -> Result<Event, ProtocolError> {
    let Some(len) = body_len(data)? else {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    };

    let end = LENGTH_PREFIX_SIZE + len;
    match data.len().cmp(&end) {
        std::cmp::Ordering::Less => Err(ProtocolError::Incomplete(end - data.len())),
        std::cmp::Ordering::Greater => Err(ProtocolError::Invalid(data.len() - end)),
        std::cmp::Ordering::Equal => Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..])?),
    }
}

/// Take the next complete frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` alone while the frame is partial.
///
/// # Errors
///
/// Returns an error if the frame is oversized or malformed.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Event>, ProtocolError> {
    let Some(len) = body_len(buf)? else {
        return Ok(None);
    };
    if buf.len() < LENGTH_PREFIX_SIZE + len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(len);
    Ok(Some(rmp_serde::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RawMessage;
    use crate::version::PROTOCOL_VERSION;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let events = vec![
            Event::publish("map.feature.plot", json!({"id": 7, "coords": [1.5, 2.5]}), "u1"),
            Event::Message(RawMessage::new("ping", json!("hi"), "u2")),
            Event::Ack(RawMessage::default()),
            Event::RoomSwitch("ops".to_string()),
            Event::RoomGetName(None),
            Event::RoomGetAllName(Some(vec!["ops".into(), "dev".into()])),
            Event::UserSetName("alice".to_string()),
            Event::connected("conn-1", PROTOCOL_VERSION),
        ];

        for event in events {
            let encoded = encode(&event).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(event, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let event = Event::RoomSwitch("ops".to_string());
        let encoded = encode(&event).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match decode(&buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut buf = BytesMut::new();
        encode_into(&Event::RoomGetName(None), &mut buf).unwrap();
        buf.put_u8(0);

        assert!(matches!(decode(&buf), Err(ProtocolError::Invalid(1))));
    }

    #[test]
    fn test_streaming_decode() {
        let first = Event::UserSetName("alice".to_string());
        let second = Event::UserGetAllName(None);

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        // Only half of the first frame available
        let mut partial = BytesMut::from(&buf[..3]);
        assert!(decode_from(&mut partial).unwrap().is_none());

        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }
}
