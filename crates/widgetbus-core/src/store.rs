//! Persistence store for room membership and message archives.
//!
//! The broadcast hub is the only writer. Implementations do storage only;
//! a failed write is reported to the caller and never retried here.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::trace;

use crate::message::ArchivedMessage;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// An archived message could not be (de)serialized.
    #[error("archive serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Durable room membership and per-room ordered archive.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Add `member` to the member set of `room`.
    async fn add_member(&self, room: &str, member: &str) -> Result<(), StoreError>;

    /// Remove `member` from the member set of `room`.
    ///
    /// Returns whether the member was present.
    async fn remove_member(&self, room: &str, member: &str) -> Result<bool, StoreError>;

    /// Move `member` from one room set to another.
    async fn move_member(&self, from: &str, to: &str, member: &str) -> Result<(), StoreError> {
        self.remove_member(from, member).await?;
        self.add_member(to, member).await
    }

    /// Members of `room`.
    async fn members(&self, room: &str) -> Result<Vec<String>, StoreError>;

    /// Append a message to its room's archive.
    async fn archive(&self, entry: &ArchivedMessage) -> Result<(), StoreError>;

    /// The most recent `limit` archived messages of `room`, oldest first.
    async fn history(&self, room: &str, limit: usize) -> Result<Vec<ArchivedMessage>, StoreError>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: DashMap<String, BTreeSet<String>>,
    archives: DashMap<String, Vec<ArchivedMessage>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn add_member(&self, room: &str, member: &str) -> Result<(), StoreError> {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(member.to_string());
        trace!(room = %room, member = %member, "Member added");
        Ok(())
    }

    async fn remove_member(&self, room: &str, member: &str) -> Result<bool, StoreError> {
        let removed = self
            .rooms
            .get_mut(room)
            .is_some_and(|mut members| members.remove(member));
        self.rooms.remove_if(room, |_, members| members.is_empty());
        trace!(room = %room, member = %member, removed, "Member removed");
        Ok(removed)
    }

    async fn members(&self, room: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn archive(&self, entry: &ArchivedMessage) -> Result<(), StoreError> {
        let mut archive = self.archives.entry(entry.room.clone()).or_default();
        // Equal timestamps keep insertion order.
        let at = archive.partition_point(|m| m.timestamp <= entry.timestamp);
        archive.insert(at, entry.clone());
        Ok(())
    }

    async fn history(&self, room: &str, limit: usize) -> Result<Vec<ArchivedMessage>, StoreError> {
        Ok(self
            .archives
            .get(room)
            .map(|archive| {
                let skip = archive.len().saturating_sub(limit);
                archive[skip..].to_vec()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use widgetbus_protocol::RawMessage;

    fn entry(room: &str, timestamp: u64, data: i64) -> ArchivedMessage {
        ArchivedMessage::new(room, timestamp, RawMessage::new("ping", json!(data), "u1"))
    }

    #[tokio::test]
    async fn test_membership() {
        let store = MemoryStore::new();
        store.add_member("default", "c1").await.unwrap();
        store.add_member("default", "c2").await.unwrap();

        store.move_member("default", "ops", "c2").await.unwrap();
        assert_eq!(store.members("default").await.unwrap(), vec!["c1"]);
        assert_eq!(store.members("ops").await.unwrap(), vec!["c2"]);

        assert!(store.remove_member("ops", "c2").await.unwrap());
        assert!(!store.remove_member("ops", "c2").await.unwrap());
        assert!(store.members("ops").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_ordered_by_timestamp() {
        let store = MemoryStore::new();
        store.archive(&entry("ops", 20, 2)).await.unwrap();
        store.archive(&entry("ops", 10, 1)).await.unwrap();
        store.archive(&entry("ops", 20, 3)).await.unwrap();
        store.archive(&entry("dev", 5, 9)).await.unwrap();

        let all: Vec<i64> = store
            .history("ops", 10)
            .await
            .unwrap()
            .iter()
            .filter_map(|m| m.message.data.as_i64())
            .collect();
        assert_eq!(all, vec![1, 2, 3]);

        let recent = store.history("ops", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message.data, json!(2));
        assert!(store.history("nowhere", 5).await.unwrap().is_empty());
    }
}
