//! Redis-backed room store.
//!
//! Room membership lives in sets keyed `room:<name>`; each room's archive is
//! a sorted set keyed `archive:<name>` scored by the archive timestamp.
//! Archive members are prefixed with a per-room sequence from
//! `archive_seq:<name>`, so identical messages in the same millisecond stay
//! distinct and keep their arrival order.

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use tracing::debug;
use widgetbus_core::{ArchivedMessage, RoomStore, StoreError};

const ROOM_PREFIX: &str = "room:";
const ARCHIVE_PREFIX: &str = "archive:";
const ARCHIVE_SEQ_PREFIX: &str = "archive_seq:";

fn room_key(room: &str) -> String {
    format!("{}{}", ROOM_PREFIX, room)
}

fn archive_key(room: &str) -> String {
    format!("{}{}", ARCHIVE_PREFIX, room)
}

fn archive_seq_key(room: &str) -> String {
    format!("{}{}", ARCHIVE_SEQ_PREFIX, room)
}

/// Sorted-set member for an archive entry: zero-padded sequence, `:`, JSON.
fn archive_member(seq: u64, entry: &ArchivedMessage) -> Result<String, StoreError> {
    Ok(format!("{:020}:{}", seq, serde_json::to_string(entry)?))
}

fn parse_archive_member(member: &str) -> Result<ArchivedMessage, StoreError> {
    let (_, json) = member
        .split_once(':')
        .ok_or_else(|| StoreError::Serialization(format!("unsequenced archive member: {}", member)))?;
    Ok(serde_json::from_str(json)?)
}

/// Room store over a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    /// Create a store for `redis_url`.
    ///
    /// No connection is made until the first operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Backend(format!("Redis connection failed: {}", e)))?;
        Ok(Self { client })
    }

    /// Check that the server answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.get_conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis PING error: {}", e)))?;
        Ok(())
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("Redis connection error: {}", e)))
    }
}

#[async_trait]
impl RoomStore for RedisStore {
    async fn add_member(&self, room: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.get_conn().await?;
        let key = room_key(room);

        let added: i64 = conn
            .sadd(&key, member)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis SADD error: {}", e)))?;

        debug!(key = %key, member = %member, added, "SADD");
        Ok(())
    }

    async fn remove_member(&self, room: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.get_conn().await?;
        let key = room_key(room);

        let removed: i64 = conn
            .srem(&key, member)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis SREM error: {}", e)))?;

        debug!(key = %key, member = %member, removed, "SREM");
        Ok(removed > 0)
    }

    async fn move_member(&self, from: &str, to: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.get_conn().await?;
        let (from_key, to_key) = (room_key(from), room_key(to));

        // SMOVE would skip the add when the member is missing from the source.
        let (): () = redis::pipe()
            .atomic()
            .srem(&from_key, member)
            .ignore()
            .sadd(&to_key, member)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis MULTI error: {}", e)))?;

        debug!(from = %from_key, to = %to_key, member = %member, "Moved member");
        Ok(())
    }

    async fn members(&self, room: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.get_conn().await?;

        let mut members: Vec<String> = conn
            .smembers(room_key(room))
            .await
            .map_err(|e| StoreError::Backend(format!("Redis SMEMBERS error: {}", e)))?;
        members.sort();
        Ok(members)
    }

    async fn archive(&self, entry: &ArchivedMessage) -> Result<(), StoreError> {
        let mut conn = self.get_conn().await?;
        let key = archive_key(&entry.room);

        let seq: u64 = conn
            .incr(archive_seq_key(&entry.room), 1)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis INCR error: {}", e)))?;
        let member = archive_member(seq, entry)?;

        let added: i64 = conn
            .zadd(&key, member, entry.timestamp)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis ZADD error: {}", e)))?;

        debug!(key = %key, timestamp = entry.timestamp, seq, added, "ZADD");
        Ok(())
    }

    async fn history(&self, room: &str, limit: usize) -> Result<Vec<ArchivedMessage>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_conn().await?;
        let start = -(isize::try_from(limit).unwrap_or(isize::MAX));

        let values: Vec<String> = conn
            .zrange(archive_key(room), start, -1)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis ZRANGE error: {}", e)))?;

        values.iter().map(|v| parse_archive_member(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use widgetbus_protocol::RawMessage;

    #[test]
    fn test_keys_are_prefixed() {
        assert_eq!(room_key("ops"), "room:ops");
        assert_eq!(archive_key("default"), "archive:default");
        assert_eq!(archive_seq_key("default"), "archive_seq:default");
    }

    #[test]
    fn test_identical_messages_get_distinct_members() {
        let entry = ArchivedMessage::new(
            "ops",
            1_700_000_000_000,
            RawMessage::new("ping", json!("hi"), "u1"),
        );

        let first = archive_member(9, &entry).unwrap();
        let second = archive_member(10, &entry).unwrap();
        assert_ne!(first, second);
        // Equal scores fall back to lexicographic order, which must follow the sequence.
        assert!(first < second);
        assert!(first.starts_with("00000000000000000009:"));

        assert_eq!(parse_archive_member(&first).unwrap(), entry);
        assert_eq!(parse_archive_member(&second).unwrap(), entry);
        assert!(matches!(
            parse_archive_member("no separator"),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(matches!(
            RedisStore::new("not-a-url"),
            Err(StoreError::Backend(_))
        ));
        assert!(RedisStore::new("redis://127.0.0.1:6379").is_ok());
    }
}
