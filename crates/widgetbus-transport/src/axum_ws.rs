//! Server-side connection over an upgraded axum WebSocket.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use widgetbus_protocol::{codec, Event};

use crate::buffer::FrameBuffer;
use crate::traits::{Connection, ConnectionId, TransportError};

/// An accepted WebSocket connection.
pub struct AxumConnection {
    id: ConnectionId,
    socket: Mutex<WebSocket>,
    remote_addr: Option<String>,
    is_open: AtomicBool,
    frames: FrameBuffer,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<String>, max_message_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket: Mutex::new(socket),
            remote_addr,
            is_open: AtomicBool::new(true),
            frames: FrameBuffer::new(max_message_size),
        }
    }
}

#[async_trait]
impl Connection for AxumConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Event>, TransportError> {
        if let Some(event) = self.frames.next_event()? {
            return Ok(Some(event));
        }

        let socket = self.socket.get_mut();
        loop {
            let data = match socket.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = socket.send(Message::Pong(data)).await {
                        warn!(connection = %self.id, "Failed to send pong: {}", e);
                    }
                    continue;
                }
                Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    debug!(connection = %self.id, "WebSocket closed by peer");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            };

            if let Some(event) = self.frames.push(&data)? {
                return Ok(Some(event));
            }
        }
    }

    async fn send(&mut self, event: Event) -> Result<(), TransportError> {
        self.send_raw(codec::encode(&event)?).await
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        self.socket
            .get_mut()
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.socket
            .get_mut()
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}
