//! In-process connection pair.
//!
//! Lets a relay client talk to a broadcast hub in the same process without
//! a socket. Events travel unencoded; `send_raw` decodes first.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use widgetbus_protocol::{codec, Event};

use crate::traits::{Connection, ConnectionId, TransportError};

/// One end of an in-memory duplex.
pub struct MemoryConnection {
    id: ConnectionId,
    tx: Option<mpsc::UnboundedSender<Event>>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl MemoryConnection {
    /// Create two connected ends.
    #[must_use]
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a = MemoryConnection {
            id: ConnectionId::generate(),
            tx: Some(a_tx),
            rx: a_rx,
        };
        let b = MemoryConnection {
            id: ConnectionId::generate(),
            tx: Some(b_tx),
            rx: b_rx,
        };
        (a, b)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Event>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, event: Event) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(event).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        let event = codec::decode(&data)?;
        self.send(event).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping our sender ends the peer's stream.
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_delivers_both_ways() {
        let (mut a, mut b) = MemoryConnection::pair();

        a.send(Event::RoomSwitch("ops".into())).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(Event::RoomSwitch("ops".into())));

        let raw = codec::encode(&Event::UserGetName(None)).unwrap();
        b.send_raw(raw).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(Event::UserGetName(None)));
    }

    #[tokio::test]
    async fn test_memory_close_ends_peer_stream() {
        let (mut a, mut b) = MemoryConnection::pair();
        assert!(a.is_open());

        a.close().await.unwrap();
        assert!(!a.is_open());
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(matches!(
            a.send(Event::RoomGetName(None)).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
