/// In-memory storage backend
use crate::error::StoreResult;
use crate::storage::Storage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Volatile backend; every store starts empty and nothing survives drop
#[derive(Default)]
pub struct MemoryStorage {
    partitions: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, partition: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn set(&self, partition: &str, key: &str, value: Value) -> StoreResult<()> {
        self.partitions
            .write()
            .await
            .entry(partition.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, partition: &str, key: &str) -> StoreResult<()> {
        if let Some(entries) = self.partitions.write().await.get_mut(partition) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn entries(&self, partition: &str) -> StoreResult<Vec<(String, Value)>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear(&self, partition: &str) -> StoreResult<()> {
        self.partitions.write().await.remove(partition);
        Ok(())
    }

    async fn clear_all(&self) -> StoreResult<()> {
        self.partitions.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{get_typed, partitions, set_typed};
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_remove() {
        let storage = MemoryStorage::new();
        storage
            .set(partitions::ACCOUNTS, "a1", json!({"name": "Account 1"}))
            .await
            .unwrap();

        let value = storage.get(partitions::ACCOUNTS, "a1").await.unwrap();
        assert_eq!(value.unwrap()["name"], "Account 1");

        storage.remove(partitions::ACCOUNTS, "a1").await.unwrap();
        assert!(storage
            .get(partitions::ACCOUNTS, "a1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let storage = MemoryStorage::new();
        storage
            .set(partitions::COMMENTS_CACHE, "cid 1", json!(1))
            .await
            .unwrap();
        storage
            .set(partitions::SUBPLEBBITS_CACHE, "sub.eth", json!(2))
            .await
            .unwrap();

        storage.clear(partitions::COMMENTS_CACHE).await.unwrap();
        assert!(storage
            .get(partitions::COMMENTS_CACHE, "cid 1")
            .await
            .unwrap()
            .is_none());
        assert!(storage
            .get(partitions::SUBPLEBBITS_CACHE, "sub.eth")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let storage = MemoryStorage::new();
        set_typed(&storage, partitions::ACCOUNTS_METADATA, "activeAccountId", &"a1")
            .await
            .unwrap();
        let value: Option<String> =
            get_typed(&storage, partitions::ACCOUNTS_METADATA, "activeAccountId")
                .await
                .unwrap();
        assert_eq!(value.as_deref(), Some("a1"));
    }
}
