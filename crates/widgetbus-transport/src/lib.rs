//! # widgetbus-transport
//!
//! Connection layer for widgetbus relay traffic.
//!
//! - **WebSocket client** - relay clients dialing the broadcast server
//! - **axum WebSocket** - the server side of an upgraded HTTP request
//! - **Memory** - an in-process pipe for embedded hubs and tests
//!
//! All of them implement the `Connection` trait, so the relay client and the
//! server session loop are transport-agnostic.
//!
//! ```rust,ignore
//! use widgetbus_transport::Connection;
//!
//! async fn drain(mut conn: Box<dyn Connection>) {
//!     while let Ok(Some(event)) = conn.recv().await {
//!         // Process event
//!     }
//! }
//! ```

pub mod axum_ws;
mod buffer;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use axum_ws::AxumConnection;
pub use memory::MemoryConnection;
pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{connect, WebSocketConnection};
