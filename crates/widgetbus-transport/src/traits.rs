//! Connection abstraction for widgetbus.
//!
//! The relay client and the broadcast server both talk to a `Connection`,
//! so either side can run over WebSocket or an in-process pipe.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use widgetbus_protocol::Event;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one live connection, unique within the process.
///
/// Rendered as `conn_<start-seconds>_<sequence>`, both in hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn generate() -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", started, seq))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer or the local side closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Writing to the socket failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Reading from the socket failed.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] widgetbus_protocol::ProtocolError),

    /// Dialing or closing failed.
    #[error("{0}")]
    Other(String),
}

/// An open, bidirectional event connection.
///
/// `recv` must be cancel-safe: partially received frames stay buffered in
/// the connection, so callers may race it against other futures.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next event from the connection.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Event>, TransportError>;

    /// Send an event to the connection.
    async fn send(&mut self, event: Event) -> Result<(), TransportError>;

    /// Send a pre-encoded event.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
