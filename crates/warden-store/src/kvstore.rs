//! SQLite-backed bucketed byte store
//!
//! Buckets are rows in one table keyed by `(bucket, key)`. The underlying
//! pool is capped at a single connection, which gives the single-writer,
//! multi-reader behavior the callers rely on.

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// Bucket holding the persisted plugin descriptors.
pub const PLUGIN_INSTANCES_BUCKET: &str = "plugin_instances";

/// Bucket holding the running controller instances, keyed by cid.
pub const CONTROLLERS_BUCKET: &str = "controllers";

/// KvStore provides bucketed key/value storage of opaque byte strings.
pub struct KvStore {
    pool: SqlitePool,
}

impl KvStore {
    /// Open (creating if necessary) the store at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        info!("Opening KV store: {}", url);
        Self::connect(&url).await
    }

    /// Create an in-memory store for testing.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Set up the backing table.
    async fn initialize(&self) -> Result<()> {
        debug!("Initializing KV store schema");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_buckets (
                bucket TEXT NOT NULL,
                key    BLOB NOT NULL,
                value  BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set a key/value pair in a bucket, replacing any previous value.
    pub async fn set(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_buckets (bucket, key, value) VALUES (?, ?, ?) \
             ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
        )
        .bind(bucket)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retrieve a value by key.
    pub async fn get(&self, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
        let row = sqlx::query("SELECT value FROM kv_buckets WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.get::<Vec<u8>, _>("value")),
            None => Err(StoreError::NoSuchKey),
        }
    }

    /// Retrieve every key/value pair stored in a bucket, in key order.
    pub async fn get_all(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let rows = sqlx::query("SELECT key, value FROM kv_buckets WHERE bucket = ? ORDER BY key")
            .bind(bucket)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<Vec<u8>, _>("key"), row.get::<Vec<u8>, _>("value")))
            .collect())
    }

    /// Delete a key from a bucket. Deleting an absent key is not an error.
    pub async fn del(&self, bucket: &str, key: &[u8]) -> Result<()> {
        sqlx::query("DELETE FROM kv_buckets WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = KvStore::in_memory().await.unwrap();
        store.set("b", b"k", b"v1").await.unwrap();
        assert_eq!(store.get("b", b"k").await.unwrap(), b"v1");

        store.set("b", b"k", b"v2").await.unwrap();
        assert_eq!(store.get("b", b"k").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn missing_key_is_no_such_key() {
        let store = KvStore::in_memory().await.unwrap();
        assert!(matches!(
            store.get("b", b"nope").await,
            Err(StoreError::NoSuchKey)
        ));
    }

    #[tokio::test]
    async fn buckets_are_disjoint() {
        let store = KvStore::in_memory().await.unwrap();
        store.set("a", b"k", b"in-a").await.unwrap();
        store.set("b", b"k", b"in-b").await.unwrap();
        assert_eq!(store.get("a", b"k").await.unwrap(), b"in-a");
        assert_eq!(store.get("b", b"k").await.unwrap(), b"in-b");
    }

    #[tokio::test]
    async fn get_all_and_del() {
        let store = KvStore::in_memory().await.unwrap();
        store.set("b", b"k1", b"v1").await.unwrap();
        store.set("b", b"k2", b"v2").await.unwrap();

        let all = store.get_all("b").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], (b"k1".to_vec(), b"v1".to_vec()));

        store.del("b", b"k1").await.unwrap();
        assert_eq!(store.get_all("b").await.unwrap().len(), 1);
        // deleting a missing key is fine
        store.del("b", b"k1").await.unwrap();
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.db");
        {
            let store = KvStore::open(&path).await.unwrap();
            store
                .set(PLUGIN_INSTANCES_BUCKET, b"key", b"value")
                .await
                .unwrap();
            store.close().await;
        }
        let store = KvStore::open(&path).await.unwrap();
        assert_eq!(
            store.get(PLUGIN_INSTANCES_BUCKET, b"key").await.unwrap(),
            b"value"
        );
    }
}
