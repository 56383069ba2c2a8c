//! Room-scoped broadcast hub.
//!
//! The transport-independent half of the broadcast server. Each live
//! connection gets an outbound queue; inbound events are applied through
//! [`RoomHub::handle`] in the order the connection sent them.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use widgetbus_protocol::{Event, RawMessage};

use crate::message::{now_millis, ArchivedMessage};
use crate::rooms::RoomTable;
use crate::store::RoomStore;

/// Default room name.
pub const DEFAULT_ROOM: &str = "default";

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Room every connection starts in.
    pub default_room: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_room: DEFAULT_ROOM.to_string(),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Live connections.
    pub connections: usize,
    /// Rooms with at least one member, default room included.
    pub rooms: usize,
}

/// The broadcast hub.
pub struct RoomHub {
    table: Mutex<RoomTable>,
    outboxes: DashMap<String, mpsc::UnboundedSender<Event>>,
    store: Arc<dyn RoomStore>,
}

impl RoomHub {
    /// Create a hub over a persistence store.
    #[must_use]
    pub fn new(config: HubConfig, store: Arc<dyn RoomStore>) -> Self {
        info!(default_room = %config.default_room, "Creating room hub");
        Self {
            table: Mutex::new(RoomTable::new(config.default_room)),
            outboxes: DashMap::new(),
            store,
        }
    }

    /// The persistence store behind this hub.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    /// Admit a connection into the default room.
    ///
    /// Returns the queue of events to write to that connection.
    pub async fn connect(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.insert(connection_id.to_string(), tx);
        let room = self.table.lock().await.join(connection_id);

        match self.store.add_member(&room, connection_id).await {
            Ok(()) => debug!(connection = %connection_id, room = %room, "Membership stored"),
            Err(e) => warn!(connection = %connection_id, room = %room, error = %e, "Failed to store membership"),
        }
        rx
    }

    /// Drop a connection from its room.
    pub async fn disconnect(&self, connection_id: &str) {
        self.outboxes.remove(connection_id);
        // The room comes from the entry being removed, not a reset value.
        let Some(occupant) = self.table.lock().await.leave(connection_id) else {
            return;
        };

        match self.store.remove_member(&occupant.room, connection_id).await {
            Ok(_) => debug!(connection = %connection_id, room = %occupant.room, "Membership removed"),
            Err(e) => warn!(connection = %connection_id, room = %occupant.room, error = %e, "Failed to remove membership"),
        }
        info!(connection = %connection_id, room = %occupant.room, "Disconnected");
    }

    /// Apply one event from `connection_id`.
    pub async fn handle(&self, connection_id: &str, event: Event) {
        match event {
            Event::Publish(msg) => self.publish(connection_id, msg).await,
            Event::Ack(msg) => {
                debug!(connection = %connection_id, topic = ?msg.topic, "Ack received");
            }
            Event::RoomSwitch(room) => self.switch_room(connection_id, &room).await,
            Event::RoomGetName(_) => {
                let room = self.table.lock().await.room_of(connection_id).map(str::to_string);
                if let Some(room) = room {
                    self.reply(connection_id, Event::RoomGetName(Some(room)));
                }
            }
            Event::RoomGetAllName(_) => {
                let rooms = self.table.lock().await.occupied_rooms();
                self.reply(connection_id, Event::RoomGetAllName(Some(rooms)));
            }
            Event::UserSetName(name) => {
                if name.trim().is_empty() {
                    warn!(connection = %connection_id, "Ignoring blank user name");
                    return;
                }
                if self.table.lock().await.set_name(connection_id, &name) {
                    debug!(connection = %connection_id, name = %name, "User name set");
                }
            }
            Event::UserGetName(_) => {
                let name = self.table.lock().await.name_of(connection_id).map(str::to_string);
                if let Some(name) = name {
                    self.reply(connection_id, Event::UserGetName(Some(name)));
                }
            }
            Event::UserGetAllName(_) => {
                let names = {
                    let table = self.table.lock().await;
                    table
                        .room_of(connection_id)
                        .map(|room| table.names_in(room))
                        .unwrap_or_default()
                };
                self.reply(connection_id, Event::UserGetAllName(Some(names)));
            }
            other @ (Event::Message(_) | Event::Connected { .. }) => {
                warn!(connection = %connection_id, event = other.name(), "Unexpected event from client");
            }
        }
    }

    /// Get hub statistics.
    pub async fn stats(&self) -> HubStats {
        let table = self.table.lock().await;
        HubStats {
            connections: table.connection_count(),
            rooms: table.room_count(),
        }
    }

    async fn publish(&self, connection_id: &str, msg: RawMessage) {
        let (room, timestamp, peers) = {
            let mut table = self.table.lock().await;
            let Some(room) = table.room_of(connection_id).map(str::to_string) else {
                warn!(connection = %connection_id, "Publish from unknown connection");
                return;
            };
            let timestamp = table.stamp(&room, now_millis());
            (room, timestamp, table.peers(connection_id))
        };

        let mut delivered = 0usize;
        for peer in &peers {
            if let Some(outbox) = self.outboxes.get(peer) {
                if outbox.send(Event::Message(msg.clone())).is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!(connection = %connection_id, room = %room, topic = ?msg.topic, delivered, "Broadcast");

        // Broadcast has already happened; a failed write is only logged.
        let entry = ArchivedMessage::new(room, timestamp, msg);
        match self.store.archive(&entry).await {
            Ok(()) => trace!(room = %entry.room, timestamp, "Message archived"),
            Err(e) => warn!(room = %entry.room, error = %e, "Failed to archive message"),
        }
    }

    async fn switch_room(&self, connection_id: &str, room: &str) {
        if room.trim().is_empty() {
            warn!(connection = %connection_id, "Ignoring switch to blank room name");
            return;
        }

        let Some(moved) = self.table.lock().await.switch(connection_id, room) else {
            return;
        };

        match self.store.move_member(&moved.from, &moved.to, connection_id).await {
            Ok(()) => debug!(connection = %connection_id, from = %moved.from, to = %moved.to, "Membership moved"),
            Err(e) => warn!(connection = %connection_id, from = %moved.from, to = %moved.to, error = %e, "Failed to move membership"),
        }
    }

    fn reply(&self, connection_id: &str, event: Event) {
        let sent = self
            .outboxes
            .get(connection_id)
            .is_some_and(|outbox| outbox.send(event).is_ok());
        if !sent {
            trace!(connection = %connection_id, "Reply to closed connection dropped");
        }
    }
}
