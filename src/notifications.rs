/// Notification derivation
///
/// Notifications are never stored: they are a projection of the reply
/// trees under the account's authored comments, minus blocked content,
/// newest first. Only the set of read cids persists. Unread counts are
/// pushed into the account store whenever inputs change so account
/// snapshots stay honest without a fetch.

use crate::accounts::AccountsStore;
use crate::cache::ContentCache;
use crate::error::StoreResult;
use crate::events::{EventReceiver, EventSender, StoreEvent};
use crate::models::{Comment, Notification};
use crate::sorts::flatten_reply_pages;
use crate::storage::{get_typed, partitions, set_typed, Storage};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct NotificationsStore {
    accounts: Arc<AccountsStore>,
    cache: Arc<ContentCache>,
    storage: Arc<dyn Storage>,
    events: EventSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationsStore {
    pub fn new(
        accounts: Arc<AccountsStore>,
        cache: Arc<ContentCache>,
        storage: Arc<dyn Storage>,
        events: EventSender,
    ) -> Self {
        let listener = spawn_refresh_listener(
            accounts.clone(),
            cache.clone(),
            storage.clone(),
            events.clone(),
        );
        Self {
            accounts,
            cache,
            storage,
            events,
            tasks: Mutex::new(vec![listener]),
        }
    }

    /// Current notifications for an account, newest first
    pub async fn notifications(&self, account_id: &str) -> StoreResult<Vec<Notification>> {
        derive_notifications(
            &self.accounts,
            &self.cache,
            self.storage.as_ref(),
            account_id,
        )
        .await
    }

    /// Notifications not yet marked read
    pub async fn unread_count(&self, account_id: &str) -> StoreResult<u64> {
        let notifications = self.notifications(account_id).await?;
        Ok(count_unread(&notifications))
    }

    /// Mark every currently-visible notification as read
    pub async fn mark_notifications_read(&self, account_id: &str) -> StoreResult<()> {
        let notifications = self.notifications(account_id).await?;
        let mut read: BTreeSet<String> =
            get_typed(self.storage.as_ref(), partitions::NOTIFICATIONS_READ, account_id)
                .await?
                .unwrap_or_default();
        for notification in &notifications {
            if let Some(cid) = &notification.comment.cid {
                read.insert(cid.clone());
            }
        }
        set_typed(
            self.storage.as_ref(),
            partitions::NOTIFICATIONS_READ,
            account_id,
            &read,
        )
        .await?;
        self.accounts.set_unread_count(account_id, 0).await;
        let _ = self.events.send(StoreEvent::NotificationsChanged {
            account_id: account_id.to_string(),
        });
        Ok(())
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

fn count_unread(notifications: &[Notification]) -> u64 {
    notifications
        .iter()
        .filter(|notification| !notification.marked_as_read)
        .count() as u64
}

/// Project the account's reply trees into a notification list
///
/// Reply snapshots come from the cache when a fresher copy exists there,
/// falling back to whatever the authored record last embedded.
pub(crate) async fn derive_notifications(
    accounts: &AccountsStore,
    cache: &ContentCache,
    storage: &dyn Storage,
    account_id: &str,
) -> StoreResult<Vec<Notification>> {
    let account = accounts.account_by_id(account_id).await?;
    let authored = accounts.account_comments(account_id).await?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut replies: Vec<Comment> = Vec::new();
    for record in &authored {
        let Some(cid) = &record.comment.cid else {
            continue;
        };
        let comment = match cache.comment(cid).await {
            Some(entry) => entry.comment,
            None => record.comment.clone(),
        };
        for reply in flatten_reply_pages(&comment.replies) {
            let Some(reply_cid) = reply.cid.clone() else {
                continue;
            };
            if !seen.insert(reply_cid) {
                continue;
            }
            if account.blocked_addresses.contains(&reply.subplebbit_address)
                || account.blocked_addresses.contains(&reply.author.address)
                || reply
                    .cid
                    .as_ref()
                    .is_some_and(|cid| account.blocked_cids.contains(cid))
            {
                continue;
            }
            replies.push(reply);
        }
    }

    replies.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.cid.cmp(&b.cid))
    });

    let read: BTreeSet<String> = get_typed(storage, partitions::NOTIFICATIONS_READ, account_id)
        .await?
        .unwrap_or_default();
    Ok(replies
        .into_iter()
        .map(|comment| {
            let marked_as_read = comment
                .cid
                .as_ref()
                .is_some_and(|cid| read.contains(cid));
            Notification {
                comment,
                marked_as_read,
            }
        })
        .collect())
}

/// Keep per-account unread counts current as replies and block-lists move
fn spawn_refresh_listener(
    accounts: Arc<AccountsStore>,
    cache: Arc<ContentCache>,
    storage: Arc<dyn Storage>,
    events: EventSender,
) -> JoinHandle<()> {
    let mut receiver: EventReceiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            let refresh = match receiver.recv().await {
                Ok(StoreEvent::CommentUpdated { cid }) => {
                    account_authoring(&accounts, &cid).await
                }
                Ok(StoreEvent::AccountCommentsChanged { account_id }) => vec![account_id],
                // block-list edits change visibility without any fetch
                Ok(StoreEvent::AccountsChanged) => match accounts.accounts().await {
                    Ok(all) => all.into_iter().map(|account| account.id).collect(),
                    Err(error) => {
                        warn!("Failed to list accounts for unread refresh: {}", error);
                        Vec::new()
                    }
                },
                Ok(_) => Vec::new(),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };

            for account_id in refresh {
                match derive_notifications(&accounts, &cache, storage.as_ref(), &account_id).await
                {
                    Ok(notifications) => {
                        accounts
                            .set_unread_count(&account_id, count_unread(&notifications))
                            .await;
                        let _ = events.send(StoreEvent::NotificationsChanged { account_id });
                    }
                    Err(error) => debug!("Notification refresh failed: {}", error),
                }
            }
        }
    })
}

/// Accounts that authored the given cid
async fn account_authoring(accounts: &AccountsStore, cid: &str) -> Vec<String> {
    let Ok(all) = accounts.accounts().await else {
        return Vec::new();
    };
    let mut authoring = Vec::new();
    for account in all {
        if let Ok(comments) = accounts.account_comments(&account.id).await {
            if comments
                .iter()
                .any(|record| record.comment.cid.as_deref() == Some(cid))
            {
                authoring.push(account.id);
            }
        }
    }
    authoring
}
