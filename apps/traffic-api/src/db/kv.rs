use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::ApiError;

/// Abstraction over a keyed hash store holding one opaque record per field.
///
/// Backed by Redis hashes in production and an in-memory map in tests.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_field(&self, collection: &str, field: &str) -> Result<Option<String>, ApiError>;
    async fn set_field(&self, collection: &str, field: &str, value: &str) -> Result<(), ApiError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (dev / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_field(&self, collection: &str, field: &str) -> Result<Option<String>, ApiError> {
        Ok(self
            .data
            .lock()
            .get(collection)
            .and_then(|fields| fields.get(field))
            .cloned())
    }

    async fn set_field(&self, collection: &str, field: &str, value: &str) -> Result<(), ApiError> {
        self.data
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Redis hash store (`HGET` / `HSET`). Every round-trip is bounded by
/// `timeout`; the connection manager reconnects on its own after failures.
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = redis::Client::open(redis_url)?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| ApiError::unavailable("Redis connect timed out"))??;
        tracing::info!("redis connection established");
        Ok(Self { conn, timeout })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get_field(&self, collection: &str, field: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn.clone();
        let value = tokio::time::timeout(
            self.timeout,
            conn.hget::<_, _, Option<String>>(collection, field),
        )
        .await
        .map_err(|_| ApiError::unavailable("Redis HGET timed out"))??;
        Ok(value)
    }

    async fn set_field(&self, collection: &str, field: &str, value: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(
            self.timeout,
            conn.hset::<_, _, _, ()>(collection, field, value),
        )
        .await
        .map_err(|_| ApiError::unavailable("Redis HSET timed out"))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_get_missing_field() {
        let store = MemoryStore::new();
        assert!(store.get_field("c", "a.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_fields_are_scoped_by_collection() {
        let store = MemoryStore::new();
        store.set_field("c1", "a.com", "one").await.unwrap();
        store.set_field("c2", "a.com", "two").await.unwrap();

        assert_eq!(store.get_field("c1", "a.com").await.unwrap().as_deref(), Some("one"));
        assert_eq!(store.get_field("c2", "a.com").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn memory_store_last_write_wins() {
        let store = MemoryStore::new();
        store.set_field("c", "a.com", "old").await.unwrap();
        store.set_field("c", "a.com", "new").await.unwrap();
        assert_eq!(store.get_field("c", "a.com").await.unwrap().as_deref(), Some("new"));
    }
}
