// SQLite-backed datastore.
//
// Local single-host backend with the same CAS contract as the distributed
// stores: an idx column versions every key, and writes/deletes guard on it.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use super::{key_path, Datastore, KvObject, StoreError};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the store at the given sqlx sqlite URL, e.g.
    /// `sqlite:///var/lib/weft/overlay.db?mode=rwc` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        // A single connection keeps every CAS round serialized.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS overlay_kv (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                idx   INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(SqliteStore { pool })
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn get_object(&self, key: &[String], out: &dyn KvObject) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT value, idx FROM overlay_kv WHERE key = ?")
            .bind(key_path(key))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let row = row.ok_or(StoreError::KeyNotFound)?;
        let value: Vec<u8> = row.get("value");
        let index: i64 = row.get("idx");

        out.set_value(&value)?;
        out.set_index(index as u64);
        Ok(())
    }

    async fn put_object_atomic(&self, obj: &dyn KvObject) -> Result<(), StoreError> {
        if obj.skip() {
            return Ok(());
        }
        let key = key_path(&obj.key());
        let value = obj.value()?;

        if obj.exists() {
            let index = obj.index();
            let result = sqlx::query(
                "UPDATE overlay_kv SET value = ?, idx = idx + 1 WHERE key = ? AND idx = ?",
            )
            .bind(&value)
            .bind(&key)
            .bind(index as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::KeyModified);
            }
            obj.set_index(index + 1);
        } else {
            let result = sqlx::query("INSERT INTO overlay_kv (key, value, idx) VALUES (?, ?, 1)")
                .bind(&key)
                .bind(&value)
                .execute(&self.pool)
                .await;

            match result {
                Ok(_) => obj.set_index(1),
                Err(sqlx::Error::Database(e))
                    if matches!(e.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
                {
                    return Err(StoreError::KeyModified);
                }
                Err(e) => return Err(StoreError::Unavailable(e.to_string())),
            }
        }
        Ok(())
    }

    async fn delete_object_atomic(&self, obj: &dyn KvObject) -> Result<(), StoreError> {
        let key = key_path(&obj.key());

        let result = sqlx::query("DELETE FROM overlay_kv WHERE key = ? AND idx = ?")
            .bind(&key)
            .bind(obj.index() as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let present = sqlx::query("SELECT 1 FROM overlay_kv WHERE key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if present.is_some() {
            Err(StoreError::KeyModified)
        } else {
            Err(StoreError::KeyNotFound)
        }
    }
}
