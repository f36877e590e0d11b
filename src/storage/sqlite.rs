/// Sqlite storage backend
///
/// One database file with a single key/value table keyed by
/// (scope, key). Values are serialized JSON text.
use crate::error::{StoreError, StoreResult};
use crate::storage::Storage;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::debug;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (and create if missing) the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePool::connect_with(
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .create_if_missing(true)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                scope TEXT NOT NULL,
                "key" TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (scope, "key")
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_scope ON kv(scope)")
            .execute(&pool)
            .await?;

        debug!("Opened sqlite storage at {}", path.display());
        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, partition: &str, key: &str) -> StoreResult<Option<Value>> {
        let row = sqlx::query(r#"SELECT value FROM kv WHERE scope = ?1 AND "key" = ?2"#)
            .bind(partition)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let text: String = row.try_get("value")?;
                let value = serde_json::from_str(&text).map_err(|e| {
                    StoreError::Storage(format!(
                        "corrupt value at {}/{}: {}",
                        partition, key, e
                    ))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, partition: &str, key: &str, value: Value) -> StoreResult<()> {
        let text = serde_json::to_string(&value)?;
        sqlx::query(
            r#"
            INSERT INTO kv (scope, "key", value, updated_at)
            VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
            ON CONFLICT (scope, "key")
            DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(partition)
        .bind(key)
        .bind(text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, partition: &str, key: &str) -> StoreResult<()> {
        sqlx::query(r#"DELETE FROM kv WHERE scope = ?1 AND "key" = ?2"#)
            .bind(partition)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn entries(&self, partition: &str) -> StoreResult<Vec<(String, Value)>> {
        let rows = sqlx::query(r#"SELECT "key", value FROM kv WHERE scope = ?1"#)
            .bind(partition)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let text: String = row.try_get("value")?;
            let value = serde_json::from_str(&text).map_err(|e| {
                StoreError::Storage(format!("corrupt value at {}/{}: {}", partition, key, e))
            })?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    async fn clear(&self, partition: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM kv WHERE scope = ?1")
            .bind(partition)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_all(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM kv").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::partitions;
    use serde_json::json;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let storage = SqliteStorage::open(&path).await.unwrap();
            storage
                .set(partitions::ACCOUNTS, "a1", json!({"name": "Account 1"}))
                .await
                .unwrap();
        }

        let storage = SqliteStorage::open(&path).await.unwrap();
        let value = storage.get(partitions::ACCOUNTS, "a1").await.unwrap();
        assert_eq!(value.unwrap()["name"], "Account 1");
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("store.db")).await.unwrap();

        storage
            .set(partitions::COMMENTS_CACHE, "cid 1", json!({"updatedAt": 1}))
            .await
            .unwrap();
        storage
            .set(partitions::COMMENTS_CACHE, "cid 1", json!({"updatedAt": 2}))
            .await
            .unwrap();

        let entries = storage.entries(partitions::COMMENTS_CACHE).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1["updatedAt"], 2);
    }
}
