//! Drives one relay connection against a [`RoomHub`].

use std::sync::Arc;
use tracing::{debug, info, warn};
use widgetbus_protocol::{Event, PROTOCOL_VERSION};
use widgetbus_transport::Connection;

use crate::hub::RoomHub;

/// Traffic counts for a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Events read from the client.
    pub received: u64,
    /// Of those, `publish` events.
    pub published: u64,
    /// Events written to the client.
    pub sent: u64,
    /// Whether the session ended on a transport error.
    pub failed: bool,
}

/// Serve `conn` until it closes.
///
/// Sends the `connected` greeting, applies inbound events in order and
/// writes whatever the hub queues for this connection. The connection is
/// removed from its room on return.
pub async fn serve(mut conn: Box<dyn Connection>, hub: Arc<RoomHub>) -> SessionSummary {
    let id = conn.id().to_string();
    let mut summary = SessionSummary::default();
    let mut outbound = hub.connect(&id).await;

    info!(connection = %id, remote = ?conn.remote_addr(), "Session started");

    match conn.send(Event::connected(id.as_str(), PROTOCOL_VERSION)).await {
        Ok(()) => summary.sent += 1,
        Err(e) => {
            warn!(connection = %id, error = %e, "Failed to greet client");
            summary.failed = true;
            hub.disconnect(&id).await;
            return summary;
        }
    }

    loop {
        tokio::select! {
            incoming = conn.recv() => match incoming {
                Ok(Some(event)) => {
                    summary.received += 1;
                    if matches!(event, Event::Publish(_)) {
                        summary.published += 1;
                    }
                    hub.handle(&id, event).await;
                }
                Ok(None) => {
                    debug!(connection = %id, "Client closed connection");
                    break;
                }
                Err(e) => {
                    warn!(connection = %id, error = %e, "Connection error");
                    summary.failed = true;
                    break;
                }
            },

            Some(event) = outbound.recv() => {
                if let Err(e) = conn.send(event).await {
                    warn!(connection = %id, error = %e, "Failed to write to client");
                    summary.failed = true;
                    break;
                }
                summary.sent += 1;
            }
        }
    }

    hub.disconnect(&id).await;
    let _ = conn.close().await;

    info!(
        connection = %id,
        received = summary.received,
        sent = summary.sent,
        "Session ended"
    );
    summary
}
