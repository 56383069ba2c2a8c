//! Room membership table.
//!
//! Tracks which room every live connection is in and the display name it
//! registered. Every connection is in exactly one room while present, so a
//! switch is always a move.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Display name used until a connection registers one.
pub const ANONYMOUS: &str = "anonymous";

/// A connection's place in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupant {
    /// Room the connection is in.
    pub room: String,
    /// Display name.
    pub name: String,
    /// Order of arrival, used to list names deterministically.
    seq: u64,
}

/// A room switch that took effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    /// Room left.
    pub from: String,
    /// Room joined.
    pub to: String,
}

/// In-memory room membership.
#[derive(Debug)]
pub struct RoomTable {
    default_room: String,
    occupants: HashMap<String, Occupant>,
    rooms: HashMap<String, BTreeSet<String>>,
    last_stamp: HashMap<String, u64>,
    next_seq: u64,
}

impl RoomTable {
    /// Create a table whose connections start in `default_room`.
    #[must_use]
    pub fn new(default_room: impl Into<String>) -> Self {
        Self {
            default_room: default_room.into(),
            occupants: HashMap::new(),
            rooms: HashMap::new(),
            last_stamp: HashMap::new(),
            next_seq: 0,
        }
    }

    /// The room new connections land in.
    #[must_use]
    pub fn default_room(&self) -> &str {
        &self.default_room
    }

    /// Place a new connection in the default room as "anonymous".
    ///
    /// Returns the room joined. Joining twice keeps the existing entry.
    pub fn join(&mut self, connection_id: &str) -> String {
        if let Some(existing) = self.occupants.get(connection_id) {
            return existing.room.clone();
        }

        let room = self.default_room.clone();
        self.occupants.insert(
            connection_id.to_string(),
            Occupant {
                room: room.clone(),
                name: ANONYMOUS.to_string(),
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(connection_id.to_string());

        debug!(connection = %connection_id, room = %room, "Joined room");
        room
    }

    /// Move a connection to `room`.
    ///
    /// Returns `None` if the connection is unknown or already there.
    pub fn switch(&mut self, connection_id: &str, room: &str) -> Option<Move> {
        let occupant = self.occupants.get_mut(connection_id)?;
        if occupant.room == room {
            return None;
        }

        let from = std::mem::replace(&mut occupant.room, room.to_string());
        self.vacate(&from, connection_id);
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());

        debug!(connection = %connection_id, from = %from, to = %room, "Switched room");
        Some(Move {
            from,
            to: room.to_string(),
        })
    }

    /// Remove a connection.
    ///
    /// Returns its last entry, so callers can clean up the room it was in.
    pub fn leave(&mut self, connection_id: &str) -> Option<Occupant> {
        let occupant = self.occupants.remove(connection_id)?;
        self.vacate(&occupant.room, connection_id);
        debug!(connection = %connection_id, room = %occupant.room, "Left room");
        Some(occupant)
    }

    /// The room a connection is in.
    #[must_use]
    pub fn room_of(&self, connection_id: &str) -> Option<&str> {
        self.occupants.get(connection_id).map(|o| o.room.as_str())
    }

    /// Bind a display name to a connection.
    ///
    /// Returns `false` if the connection is unknown.
    pub fn set_name(&mut self, connection_id: &str, name: &str) -> bool {
        match self.occupants.get_mut(connection_id) {
            Some(occupant) => {
                occupant.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// A connection's display name.
    #[must_use]
    pub fn name_of(&self, connection_id: &str) -> Option<&str> {
        self.occupants.get(connection_id).map(|o| o.name.as_str())
    }

    /// Connections sharing a room with `connection_id`, excluding itself.
    #[must_use]
    pub fn peers(&self, connection_id: &str) -> Vec<String> {
        let Some(room) = self.room_of(connection_id) else {
            return Vec::new();
        };
        self.rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter(|id| id.as_str() != connection_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Display names of everyone in `room`, in order of arrival.
    #[must_use]
    pub fn names_in(&self, room: &str) -> Vec<String> {
        let Some(members) = self.rooms.get(room) else {
            return Vec::new();
        };
        let mut occupants: Vec<&Occupant> = members
            .iter()
            .filter_map(|id| self.occupants.get(id))
            .collect();
        occupants.sort_by_key(|o| o.seq);
        occupants.into_iter().map(|o| o.name.clone()).collect()
    }

    /// Rooms with at least one member, other than the default room, sorted.
    #[must_use]
    pub fn occupied_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .rooms
            .keys()
            .filter(|room| **room != self.default_room)
            .cloned()
            .collect();
        rooms.sort();
        rooms
    }

    /// Drop `connection_id` from `room`, forgetting the room once empty.
    fn vacate(&mut self, room: &str, connection_id: &str) {
        let Some(members) = self.rooms.get_mut(room) else {
            return;
        };
        members.remove(connection_id);
        if members.is_empty() {
            self.rooms.remove(room);
            self.last_stamp.remove(room);
        }
    }

    /// Archive timestamp for `room`, never earlier than the previous one
    /// while the room stays occupied.
    pub fn stamp(&mut self, room: &str, now: u64) -> u64 {
        let last = self.last_stamp.entry(room.to_string()).or_insert(0);
        *last = (*last).max(now);
        *last
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.occupants.len()
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_defaults() {
        let mut table = RoomTable::new("default");

        assert_eq!(table.join("c1"), "default");
        assert_eq!(table.room_of("c1"), Some("default"));
        assert_eq!(table.name_of("c1"), Some(ANONYMOUS));
        assert_eq!(table.connection_count(), 1);
    }

    #[test]
    fn test_switch_is_a_move() {
        let mut table = RoomTable::new("default");
        table.join("c1");
        table.join("c2");

        let moved = table.switch("c2", "ops").unwrap();
        assert_eq!(moved.from, "default");
        assert_eq!(moved.to, "ops");
        assert_eq!(table.peers("c1"), Vec::<String>::new());
        assert_eq!(table.occupied_rooms(), vec!["ops".to_string()]);

        // Same room again changes nothing.
        assert!(table.switch("c2", "ops").is_none());

        table.switch("c2", "dev");
        assert_eq!(table.occupied_rooms(), vec!["dev".to_string()]);
        assert_eq!(table.room_count(), 2);
    }

    #[test]
    fn test_leave_returns_last_room() {
        let mut table = RoomTable::new("default");
        table.join("c1");
        table.switch("c1", "ops");

        let gone = table.leave("c1").unwrap();
        assert_eq!(gone.room, "ops");
        assert!(table.occupied_rooms().is_empty());
        assert!(table.leave("c1").is_none());
    }

    #[test]
    fn test_names_and_peers() {
        let mut table = RoomTable::new("default");
        table.join("c1");
        table.join("c2");
        table.join("c3");
        assert!(table.set_name("c1", "alice"));
        assert!(!table.set_name("nobody", "bob"));
        table.switch("c3", "ops");

        assert_eq!(
            table.names_in("default"),
            vec!["alice".to_string(), ANONYMOUS.to_string()]
        );
        assert_eq!(table.peers("c1"), vec!["c2".to_string()]);
        assert_eq!(table.names_in("ops"), vec![ANONYMOUS.to_string()]);
    }

    #[test]
    fn test_stamp_never_decreases() {
        let mut table = RoomTable::new("default");

        assert_eq!(table.stamp("ops", 100), 100);
        assert_eq!(table.stamp("ops", 90), 100);
        assert_eq!(table.stamp("ops", 120), 120);
        assert_eq!(table.stamp("dev", 50), 50);
    }

    #[test]
    fn test_stamp_forgotten_when_room_empties() {
        let mut table = RoomTable::new("default");
        table.join("c1");
        table.join("c2");
        table.switch("c1", "ops");
        table.switch("c2", "ops");

        assert_eq!(table.stamp("ops", 100), 100);
        table.switch("c1", "dev");
        assert_eq!(table.stamp("ops", 90), 100);

        table.leave("c2");
        assert!(table.last_stamp.is_empty());
        table.switch("c1", "ops");
        assert_eq!(table.stamp("ops", 90), 90);
    }
}
