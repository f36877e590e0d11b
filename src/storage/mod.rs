/// Persistence Layer
///
/// Partitioned key/value storage behind a backend trait. Values are plain
/// JSON so backends stay trivial; everything typed lives in the stores.
/// Two backends ship: in-memory (tests, ephemeral sessions) and sqlite.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::StoreResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Storage partitions used by the stores
///
/// Partition names are part of the on-disk format; renaming one orphans
/// previously persisted data.
pub mod partitions {
    pub const ACCOUNTS: &str = "accounts";
    pub const ACCOUNTS_METADATA: &str = "accountsMetadata";
    pub const ACCOUNT_COMMENTS: &str = "accountsComments";
    pub const ACCOUNT_VOTES: &str = "accountsVotes";
    pub const ACCOUNT_EDITS: &str = "accountsEdits";
    pub const NOTIFICATIONS_READ: &str = "notificationsRead";
    pub const COMMENTS_CACHE: &str = "comments";
    pub const SUBPLEBBITS_CACHE: &str = "subplebbits";
    pub const PAGES_CACHE: &str = "subplebbitsPages";
}

/// Storage backend trait
///
/// Implementations must be safe under concurrent access from every store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read one value, `None` when the key was never written
    async fn get(&self, partition: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Write one value, replacing any previous one
    async fn set(&self, partition: &str, key: &str, value: Value) -> StoreResult<()>;

    /// Delete one key; deleting a missing key is not an error
    async fn remove(&self, partition: &str, key: &str) -> StoreResult<()>;

    /// All key/value pairs of a partition, unordered
    async fn entries(&self, partition: &str) -> StoreResult<Vec<(String, Value)>>;

    /// Drop every key of a partition
    async fn clear(&self, partition: &str) -> StoreResult<()>;

    /// Drop everything; used by the full store reset
    async fn clear_all(&self) -> StoreResult<()>;
}

/// Read a typed value from storage
pub async fn get_typed<T: DeserializeOwned>(
    storage: &dyn Storage,
    partition: &str,
    key: &str,
) -> StoreResult<Option<T>> {
    match storage.get(partition, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Write a typed value to storage
pub async fn set_typed<T: Serialize>(
    storage: &dyn Storage,
    partition: &str,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    storage
        .set(partition, key, serde_json::to_value(value)?)
        .await
}
