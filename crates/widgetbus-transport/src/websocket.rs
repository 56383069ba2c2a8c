//! WebSocket connection over tokio-tungstenite.
//!
//! Used by relay clients to reach the broadcast server.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};
use widgetbus_protocol::{codec, Event};

use crate::buffer::FrameBuffer;
use crate::traits::{Connection, ConnectionId, TransportError};

/// Default maximum inbound message size (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Open a client WebSocket connection to `url`.
///
/// # Errors
///
/// Returns an error if the TCP connect or the WebSocket handshake fails.
pub async fn connect(
    url: &str,
    max_message_size: usize,
) -> Result<WebSocketConnection<MaybeTlsStream<TcpStream>>, TransportError> {
    let (ws_stream, _response) = connect_async(url).await.map_err(|e| {
        error!(url = %url, "WebSocket connect failed: {}", e);
        TransportError::Other(format!("WebSocket connect failed: {}", e))
    })?;

    debug!(url = %url, "WebSocket handshake completed");

    Ok(WebSocketConnection::new(
        ws_stream,
        Some(url.to_string()),
        max_message_size,
    ))
}

/// A WebSocket connection.
pub struct WebSocketConnection<S> {
    id: ConnectionId,
    stream: Mutex<WebSocketStream<S>>,
    remote_addr: Option<String>,
    is_open: AtomicBool,
    frames: FrameBuffer,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established WebSocket stream.
    pub fn new(
        stream: WebSocketStream<S>,
        remote_addr: Option<String>,
        max_message_size: usize,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream: Mutex::new(stream),
            remote_addr,
            is_open: AtomicBool::new(true),
            frames: FrameBuffer::new(max_message_size),
        }
    }
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Event>, TransportError> {
        if let Some(event) = self.frames.next_event()? {
            return Ok(Some(event));
        }

        let stream = self.stream.get_mut();
        loop {
            let data = match stream.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = stream.send(Message::Pong(data)).await {
                        warn!(connection = %self.id, "Failed to send pong: {}", e);
                    }
                    continue;
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(connection = %self.id, "WebSocket error: {}", e);
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

        self.stream
            .get_mut()
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.stream
            .get_mut()
            .close(None)
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_websocket_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut conn =
                WebSocketConnection::new(ws, Some(peer.to_string()), DEFAULT_MAX_MESSAGE_SIZE);
            let event = conn.recv().await.unwrap().unwrap();
            conn.send(event).await.unwrap();
        });

        let mut client = connect(&format!("ws://{}", addr), DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        let event = Event::publish("ping", json!("hi"), "u1");
        client.send(event.clone()).await.unwrap();

        assert_eq!(client.recv().await.unwrap(), Some(event));
        server.await.unwrap();
    }
}
