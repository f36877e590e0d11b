/// Store aggregate
///
/// One protocol client, one storage backend and one event bus shared by
/// every subsystem. Construction order matters: the cache and page
/// adapter come up first, the account store loads (or creates) its
/// accounts over them, then the derived stores attach their listeners.

use crate::accounts::AccountsStore;
use crate::cache::ContentCache;
use crate::client::{MockClient, ProtocolClient};
use crate::config::{StorageConfig, StoreConfig};
use crate::error::StoreResult;
use crate::events::{EventReceiver, EventSender};
use crate::feeds::FeedsStore;
use crate::notifications::NotificationsStore;
use crate::pages::{PageCommentsHook, PagesStore};
use crate::replies::RepliesStore;
use crate::storage::{MemoryStorage, SqliteStorage, Storage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

pub struct Store {
    config: StoreConfig,
    storage: Arc<dyn Storage>,
    events: EventSender,
    cache: Arc<ContentCache>,
    pages: Arc<PagesStore>,
    accounts: Arc<AccountsStore>,
    feeds: FeedsStore,
    replies: RepliesStore,
    notifications: NotificationsStore,
}

impl Store {
    /// Open a store over the given client and storage backend
    pub async fn open(
        config: StoreConfig,
        client: Arc<dyn ProtocolClient>,
        storage: Arc<dyn Storage>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.cache.event_buffer_size);

        let cache = Arc::new(ContentCache::new(
            client.clone(),
            storage.clone(),
            config.cache.clone(),
            events.clone(),
        ));
        let pages = Arc::new(PagesStore::new(client.clone(), storage.clone()));
        let accounts = Arc::new(
            AccountsStore::new(
                client.clone(),
                storage.clone(),
                cache.clone(),
                config.polling.clone(),
                events.clone(),
            )
            .await?,
        );

        // every comment delivered in a page can settle a pending publication
        let reconciler = accounts.clone();
        let hook: PageCommentsHook = Arc::new(move |comments| {
            let accounts = reconciler.clone();
            tokio::spawn(async move {
                if let Err(error) = accounts.reconcile_comments(&comments).await {
                    warn!("Page reconciliation failed: {}", error);
                }
            });
        });
        pages.on_comments_seen(hook).await;

        let feeds = FeedsStore::new(
            cache.clone(),
            pages.clone(),
            accounts.clone(),
            config.feed.clone(),
            &events,
        );
        let replies = RepliesStore::new(
            cache.clone(),
            pages.clone(),
            accounts.clone(),
            config.feed.clone(),
            &events,
        );
        let notifications = NotificationsStore::new(
            accounts.clone(),
            cache.clone(),
            storage.clone(),
            events.clone(),
        );

        Ok(Self {
            config,
            storage,
            events,
            cache,
            pages,
            accounts,
            feeds,
            replies,
            notifications,
        })
    }

    /// Open with SQLite persistence at the configured database path
    pub async fn open_sqlite(
        config: StoreConfig,
        storage_config: &StorageConfig,
        client: Arc<dyn ProtocolClient>,
    ) -> StoreResult<Self> {
        let storage = Arc::new(SqliteStorage::open(&storage_config.database).await?);
        Self::open(config, client, storage).await
    }

    /// Open with the deterministic in-process backend and no persistence
    pub async fn open_mock(config: StoreConfig) -> StoreResult<Self> {
        Self::open(
            config,
            Arc::new(MockClient::new()),
            Arc::new(MemoryStorage::new()),
        )
        .await
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn accounts(&self) -> &AccountsStore {
        &self.accounts
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn pages(&self) -> &PagesStore {
        &self.pages
    }

    pub fn feeds(&self) -> &FeedsStore {
        &self.feeds
    }

    pub fn replies(&self) -> &RepliesStore {
        &self.replies
    }

    pub fn notifications(&self) -> &NotificationsStore {
        &self.notifications
    }

    /// Subscribe to every store-wide change announcement
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Stop background work, leaving persisted data in place
    pub async fn shutdown(&self) {
        self.feeds.reset().await;
        self.feeds.shutdown().await;
        self.replies.reset().await;
        self.replies.shutdown().await;
        self.notifications.shutdown().await;
        self.accounts.shutdown().await;
        self.cache.stop_all().await;
    }

    /// Stop background work and wipe every persisted partition
    pub async fn reset(&self) -> StoreResult<()> {
        self.shutdown().await;
        self.storage.clear_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StoreEvent;

    #[tokio::test]
    async fn test_open_creates_default_account() {
        let store = Store::open_mock(StoreConfig::default()).await.unwrap();
        let active = store.accounts().active_account().await.unwrap();
        assert_eq!(active.name, "Account 1");
    }

    #[tokio::test]
    async fn test_event_bus_announces_account_changes() {
        let store = Store::open_mock(StoreConfig::default()).await.unwrap();
        let mut events = store.subscribe();
        store.accounts().create_account(Some("alice")).await.unwrap();
        loop {
            if let StoreEvent::AccountsChanged = events.recv().await.unwrap() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_reset_wipes_persisted_state() {
        let client = Arc::new(MockClient::new());
        let storage = Arc::new(MemoryStorage::new());
        let store = Store::open(StoreConfig::default(), client.clone(), storage.clone())
            .await
            .unwrap();
        let first = store.accounts().active_account().await.unwrap();
        store.reset().await.unwrap();

        let reopened = Store::open(StoreConfig::default(), client, storage)
            .await
            .unwrap();
        let fresh = reopened.accounts().active_account().await.unwrap();
        assert_eq!(fresh.name, "Account 1");
        assert_ne!(fresh.id, first.id);
    }
}
