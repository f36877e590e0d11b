/// Account Store
///
/// Owns every local identity and everything it authored. All mutations
/// are validated against in-memory state, applied, then written through
/// to storage before the change is announced. The store always has at
/// least one account and exactly one active account.

pub mod publications;

pub use publications::{
    edited_comment_state, EditedCommentState, PublicationHandle, PublicationStatus,
};

use crate::cache::ContentCache;
use crate::client::ProtocolClient;
use crate::config::PollingConfig;
use crate::error::{StoreError, StoreResult};
use crate::events::{EventReceiver, EventSender, StoreEvent};
use crate::models::{
    Account, AccountComment, AccountEdit, AccountVote, Author, Comment, Karma, Subplebbit,
    SubplebbitEditOptions,
};
use crate::storage::{get_typed, partitions, set_typed, Storage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_ACCOUNT_NAME: &str = "Account 1";
const ACTIVE_ACCOUNT_KEY: &str = "activeAccountId";
const ACCOUNT_IDS_KEY: &str = "accountIds";

#[derive(Default)]
pub(crate) struct AccountsState {
    pub accounts: HashMap<String, Account>,
    /// Account ids in user-chosen order
    pub order: Vec<String>,
    pub active_id: String,
    pub comments: HashMap<String, Vec<AccountComment>>,
    pub votes: HashMap<String, Vec<AccountVote>>,
    pub edits: HashMap<String, Vec<AccountEdit>>,
    /// Derived by the notification store, displayed on accounts
    pub unread_counts: HashMap<String, u64>,
    /// Latest owned-subplebbit listing from the backend
    pub owned_subplebbits: Vec<String>,
}

impl AccountsState {
    fn name_taken(&self, name: &str, excluding_id: Option<&str>) -> bool {
        self.accounts
            .values()
            .any(|account| account.name == name && Some(account.id.as_str()) != excluding_id)
    }

    /// First free variant of `name`: the name itself, then "name 2", ...
    fn free_name(&self, name: &str) -> String {
        if !self.name_taken(name, None) {
            return name.to_string();
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{} {}", name, counter);
            if !self.name_taken(&candidate, None) {
                return candidate;
            }
            counter += 1;
        }
    }
}

pub struct AccountsStore {
    client: Arc<dyn ProtocolClient>,
    storage: Arc<dyn Storage>,
    cache: Arc<ContentCache>,
    events: EventSender,
    inner: Arc<RwLock<AccountsState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AccountsStore {
    /// Load persisted accounts, creating the default one on first run
    pub async fn new(
        client: Arc<dyn ProtocolClient>,
        storage: Arc<dyn Storage>,
        cache: Arc<ContentCache>,
        config: PollingConfig,
        events: EventSender,
    ) -> StoreResult<Self> {
        let mut state = AccountsState::default();

        for (id, value) in storage.entries(partitions::ACCOUNTS).await? {
            match serde_json::from_value::<Account>(value) {
                Ok(account) => {
                    state.accounts.insert(id, account);
                }
                Err(error) => warn!("Skipping corrupt account record {}: {}", id, error),
            }
        }
        if let Some(order) =
            get_typed::<Vec<String>>(storage.as_ref(), partitions::ACCOUNTS_METADATA, ACCOUNT_IDS_KEY)
                .await?
        {
            state.order = order
                .into_iter()
                .filter(|id| state.accounts.contains_key(id))
                .collect();
        }
        for id in state.accounts.keys() {
            if !state.order.contains(id) {
                state.order.push(id.clone());
            }
        }
        if let Some(active) =
            get_typed::<String>(storage.as_ref(), partitions::ACCOUNTS_METADATA, ACTIVE_ACCOUNT_KEY)
                .await?
        {
            if state.accounts.contains_key(&active) {
                state.active_id = active;
            }
        }

        for id in state.order.clone() {
            state.comments.insert(
                id.clone(),
                get_typed(storage.as_ref(), partitions::ACCOUNT_COMMENTS, &id)
                    .await?
                    .unwrap_or_default(),
            );
            state.votes.insert(
                id.clone(),
                get_typed(storage.as_ref(), partitions::ACCOUNT_VOTES, &id)
                    .await?
                    .unwrap_or_default(),
            );
            state.edits.insert(
                id.clone(),
                get_typed(storage.as_ref(), partitions::ACCOUNT_EDITS, &id)
                    .await?
                    .unwrap_or_default(),
            );
        }

        let store = Self {
            client,
            storage,
            cache,
            events,
            inner: Arc::new(RwLock::new(state)),
            tasks: Mutex::new(Vec::new()),
        };

        let needs_default = store.inner.read().await.accounts.is_empty();
        if needs_default {
            let account = store.generate_account(DEFAULT_ACCOUNT_NAME).await?;
            info!("Created default account {}", account.name);
            let mut state = store.inner.write().await;
            state.active_id = account.id.clone();
            state.order.push(account.id.clone());
            state.comments.insert(account.id.clone(), Vec::new());
            state.votes.insert(account.id.clone(), Vec::new());
            state.edits.insert(account.id.clone(), Vec::new());
            state.accounts.insert(account.id.clone(), account);
            drop(state);
            store.persist_metadata().await?;
        } else if store.inner.read().await.active_id.is_empty() {
            let first = store.inner.read().await.order.first().cloned();
            if let Some(first) = first {
                store.inner.write().await.active_id = first;
                store.persist_metadata().await?;
            }
        }

        let poll = spawn_subplebbits_poll(
            store.client.clone(),
            store.inner.clone(),
            config.owned_subplebbits_interval_secs,
        );
        let reconciler = spawn_reconcile_listener(
            store.inner.clone(),
            store.storage.clone(),
            store.cache.clone(),
            store.events.clone(),
        );
        store.tasks.lock().await.push(poll);
        store.tasks.lock().await.push(reconciler);
        Ok(store)
    }

    async fn generate_account(&self, name: &str) -> StoreResult<Account> {
        let signer = self.client.create_signer().await?;
        Ok(Account {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            author: Author {
                address: signer.address.clone(),
                display_name: None,
            },
            signer,
            plebbit_options: Value::Null,
            ..Default::default()
        })
    }

    // --- getters ---

    /// Stored record by id; derived fields are whatever was last computed
    pub async fn account_by_id(&self, id: &str) -> StoreResult<Account> {
        self.inner
            .read()
            .await
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("account id {}", id)))
    }

    /// Account by name, with karma and unread count derived
    pub async fn account_by_name(&self, name: &str) -> StoreResult<Account> {
        let id = {
            let state = self.inner.read().await;
            state
                .accounts
                .values()
                .find(|account| account.name == name)
                .map(|account| account.id.clone())
                .ok_or_else(|| StoreError::NotFound(format!("account named '{}'", name)))?
        };
        self.enriched(&id).await
    }

    /// The active account, with karma and unread count derived
    pub async fn active_account(&self) -> StoreResult<Account> {
        let id = self.inner.read().await.active_id.clone();
        self.enriched(&id).await
    }

    /// Every account in user order, derived fields included
    pub async fn accounts(&self) -> StoreResult<Vec<Account>> {
        let ids = self.inner.read().await.order.clone();
        let mut accounts = Vec::with_capacity(ids.len());
        for id in ids {
            accounts.push(self.enriched(&id).await?);
        }
        Ok(accounts)
    }

    async fn enriched(&self, id: &str) -> StoreResult<Account> {
        let mut account = self.account_by_id(id).await?;
        account.karma = self.derive_karma(id).await;
        account.unread_notification_count = self
            .inner
            .read()
            .await
            .unread_counts
            .get(id)
            .copied()
            .unwrap_or(0);
        Ok(account)
    }

    /// Aggregate vote counts over the account's published comments,
    /// preferring fresher cached versions over the stored snapshots
    async fn derive_karma(&self, account_id: &str) -> Karma {
        let comments = self
            .inner
            .read()
            .await
            .comments
            .get(account_id)
            .cloned()
            .unwrap_or_default();

        let mut karma = Karma::default();
        for account_comment in &comments {
            let Some(cid) = &account_comment.comment.cid else {
                continue;
            };
            let (upvotes, downvotes) = match self.cache.comment(cid).await {
                Some(entry) => (
                    entry.comment.upvote_count.unwrap_or(0),
                    entry.comment.downvote_count.unwrap_or(0),
                ),
                None => (
                    account_comment.comment.upvote_count.unwrap_or(0),
                    account_comment.comment.downvote_count.unwrap_or(0),
                ),
            };
            if account_comment.comment.is_reply() {
                karma.reply_upvote_count += upvotes;
                karma.reply_downvote_count += downvotes;
            } else {
                karma.post_upvote_count += upvotes;
                karma.post_downvote_count += downvotes;
            }
        }
        karma.post_score = karma.post_upvote_count as i64 - karma.post_downvote_count as i64;
        karma.reply_score = karma.reply_upvote_count as i64 - karma.reply_downvote_count as i64;
        karma.upvote_count = karma.post_upvote_count + karma.reply_upvote_count;
        karma.downvote_count = karma.post_downvote_count + karma.reply_downvote_count;
        karma.score = karma.post_score + karma.reply_score;
        karma
    }

    pub async fn account_comments(&self, account_id: &str) -> StoreResult<Vec<AccountComment>> {
        self.require_account(account_id).await?;
        Ok(self
            .inner
            .read()
            .await
            .comments
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn account_votes(&self, account_id: &str) -> StoreResult<Vec<AccountVote>> {
        self.require_account(account_id).await?;
        Ok(self
            .inner
            .read()
            .await
            .votes
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn account_edits(&self, account_id: &str) -> StoreResult<Vec<AccountEdit>> {
        self.require_account(account_id).await?;
        Ok(self
            .inner
            .read()
            .await
            .edits
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    /// The account's latest vote on a comment, if any
    pub async fn account_vote_on(
        &self,
        account_id: &str,
        comment_cid: &str,
    ) -> StoreResult<Option<AccountVote>> {
        let votes = self.account_votes(account_id).await?;
        Ok(votes
            .into_iter()
            .filter(|vote| vote.comment_cid == comment_cid)
            .max_by_key(|vote| vote.index))
    }

    async fn require_account(&self, id: &str) -> StoreResult<()> {
        if self.inner.read().await.accounts.contains_key(id) {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("account id {}", id)))
        }
    }

    // --- account management ---

    /// Create a new account with a fresh signer; `name` defaults to the
    /// next free "Account N"
    pub async fn create_account(&self, name: Option<&str>) -> StoreResult<Account> {
        let chosen = {
            let state = self.inner.read().await;
            match name {
                Some(name) if name.is_empty() => {
                    return Err(StoreError::Validation(
                        "account name must not be empty".to_string(),
                    ))
                }
                Some(name) => {
                    if state.name_taken(name, None) {
                        return Err(StoreError::Conflict(format!(
                            "account named '{}' already exists",
                            name
                        )));
                    }
                    name.to_string()
                }
                None => state.free_name(&format!("Account {}", state.accounts.len() + 1)),
            }
        };

        let mut account = self.generate_account(&chosen).await?;
        {
            let mut state = self.inner.write().await;
            // a concurrent create may have taken the name while the
            // signer was generated
            if state.name_taken(&account.name, None) {
                if name.is_some() {
                    return Err(StoreError::Conflict(format!(
                        "account named '{}' already exists",
                        account.name
                    )));
                }
                account.name =
                    state.free_name(&format!("Account {}", state.accounts.len() + 1));
            }
            state.order.push(account.id.clone());
            state.comments.insert(account.id.clone(), Vec::new());
            state.votes.insert(account.id.clone(), Vec::new());
            state.edits.insert(account.id.clone(), Vec::new());
            state.accounts.insert(account.id.clone(), account.clone());
        }
        self.persist_account(&account).await?;
        self.persist_metadata().await?;
        self.announce_accounts_changed();
        Ok(account)
    }

    /// Replace an existing account record; the id is immutable
    pub async fn set_account(&self, account: Account) -> StoreResult<()> {
        {
            let mut state = self.inner.write().await;
            if !state.accounts.contains_key(&account.id) {
                return Err(StoreError::NotFound(format!("account id {}", account.id)));
            }
            if account.name.is_empty() {
                return Err(StoreError::Validation(
                    "account name must not be empty".to_string(),
                ));
            }
            if state.name_taken(&account.name, Some(&account.id)) {
                return Err(StoreError::Conflict(format!(
                    "account named '{}' already exists",
                    account.name
                )));
            }
            state.accounts.insert(account.id.clone(), account.clone());
        }
        self.persist_account(&account).await?;
        self.announce_accounts_changed();
        Ok(())
    }

    /// Make the named account the active one
    pub async fn set_active_account(&self, name: &str) -> StoreResult<()> {
        let id = {
            let mut state = self.inner.write().await;
            let id = state
                .accounts
                .values()
                .find(|account| account.name == name)
                .map(|account| account.id.clone())
                .ok_or_else(|| StoreError::NotFound(format!("account named '{}'", name)))?;
            state.active_id = id.clone();
            id
        };
        debug!("Active account set to {}", id);
        self.persist_metadata().await?;
        self.announce_accounts_changed();
        Ok(())
    }

    /// Reorder accounts; `names` must be a permutation of all names
    pub async fn set_accounts_order(&self, names: &[String]) -> StoreResult<()> {
        {
            let mut state = self.inner.write().await;
            if names.len() != state.accounts.len() {
                return Err(StoreError::Validation(
                    "account order must list every account exactly once".to_string(),
                ));
            }
            let mut order = Vec::with_capacity(names.len());
            for name in names {
                let id = state
                    .accounts
                    .values()
                    .find(|account| &account.name == name)
                    .map(|account| account.id.clone())
                    .ok_or_else(|| {
                        StoreError::Validation(format!("unknown account name '{}'", name))
                    })?;
                if order.contains(&id) {
                    return Err(StoreError::Validation(format!(
                        "duplicate account name '{}'",
                        name
                    )));
                }
                order.push(id);
            }
            state.order = order;
        }
        self.persist_metadata().await?;
        self.announce_accounts_changed();
        Ok(())
    }

    /// Delete the named account (the active one when no name is given)
    /// and everything it authored
    ///
    /// Deleting the active account activates the first remaining one;
    /// deleting the last account regenerates a fresh default.
    pub async fn delete_account(&self, name: Option<&str>) -> StoreResult<()> {
        let id = {
            let mut state = self.inner.write().await;
            let id = match name {
                Some(name) => state
                    .accounts
                    .values()
                    .find(|account| account.name == name)
                    .map(|account| account.id.clone())
                    .ok_or_else(|| StoreError::NotFound(format!("account named '{}'", name)))?,
                None => state.active_id.clone(),
            };
            if state.accounts.remove(&id).is_none() {
                return Err(StoreError::NotFound(format!("account id {}", id)));
            }
            state.order.retain(|existing| existing != &id);
            state.comments.remove(&id);
            state.votes.remove(&id);
            state.edits.remove(&id);
            state.unread_counts.remove(&id);
            if state.active_id == id {
                state.active_id = state.order.first().cloned().unwrap_or_default();
            }
            id
        };

        self.storage.remove(partitions::ACCOUNTS, &id).await?;
        self.storage.remove(partitions::ACCOUNT_COMMENTS, &id).await?;
        self.storage.remove(partitions::ACCOUNT_VOTES, &id).await?;
        self.storage.remove(partitions::ACCOUNT_EDITS, &id).await?;
        self.storage
            .remove(partitions::NOTIFICATIONS_READ, &id)
            .await?;

        let empty = self.inner.read().await.accounts.is_empty();
        if empty {
            let account = self.generate_account(DEFAULT_ACCOUNT_NAME).await?;
            info!("Last account deleted, regenerated {}", account.name);
            {
                let mut state = self.inner.write().await;
                state.active_id = account.id.clone();
                state.order.push(account.id.clone());
                state.comments.insert(account.id.clone(), Vec::new());
                state.votes.insert(account.id.clone(), Vec::new());
                state.edits.insert(account.id.clone(), Vec::new());
                state.accounts.insert(account.id.clone(), account.clone());
            }
            self.persist_account(&account).await?;
        }
        self.persist_metadata().await?;
        self.announce_accounts_changed();
        Ok(())
    }

    /// Serialize an account for backup or transfer
    ///
    /// Exports the active account when no name is given.
    pub async fn export_account(&self, name: Option<&str>) -> StoreResult<String> {
        let account = match name {
            Some(name) => self.account_by_name(name).await?,
            None => self.active_account().await?,
        };
        Ok(serde_json::to_string(&account)?)
    }

    /// Import a previously exported account
    ///
    /// The id is always regenerated so an import can never collide with
    /// or overwrite an existing account; a taken name gets a numeric
    /// suffix. Derived fields are discarded.
    pub async fn import_account(&self, exported: &str) -> StoreResult<Account> {
        let mut account: Account = serde_json::from_str(exported)
            .map_err(|error| StoreError::Validation(format!("malformed account export: {}", error)))?;
        if account.name.is_empty() {
            return Err(StoreError::Validation(
                "imported account has no name".to_string(),
            ));
        }
        if account.signer.private_key.is_empty() {
            return Err(StoreError::Validation(
                "imported account has no signer".to_string(),
            ));
        }

        account.id = Uuid::new_v4().to_string();
        account.karma = Karma::default();
        account.unread_notification_count = 0;
        {
            let mut state = self.inner.write().await;
            account.name = state.free_name(&account.name);
            state.order.push(account.id.clone());
            state.comments.insert(account.id.clone(), Vec::new());
            state.votes.insert(account.id.clone(), Vec::new());
            state.edits.insert(account.id.clone(), Vec::new());
            state.accounts.insert(account.id.clone(), account.clone());
        }
        self.persist_account(&account).await?;
        self.persist_metadata().await?;
        self.announce_accounts_changed();
        Ok(account)
    }

    // --- subscriptions and blocks ---

    pub async fn subscribe(&self, account_id: &str, address: &str) -> StoreResult<()> {
        self.mutate_account(account_id, |account| {
            if address.is_empty() {
                return Err(StoreError::Validation(
                    "subplebbit address must not be empty".to_string(),
                ));
            }
            if account.subscriptions.iter().any(|existing| existing == address) {
                return Err(StoreError::Validation(format!(
                    "already subscribed to {}",
                    address
                )));
            }
            account.subscriptions.push(address.to_string());
            Ok(())
        })
        .await
    }

    pub async fn unsubscribe(&self, account_id: &str, address: &str) -> StoreResult<()> {
        self.mutate_account(account_id, |account| {
            let before = account.subscriptions.len();
            account.subscriptions.retain(|existing| existing != address);
            if account.subscriptions.len() == before {
                return Err(StoreError::Validation(format!(
                    "not subscribed to {}",
                    address
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn block_address(&self, account_id: &str, address: &str) -> StoreResult<()> {
        self.mutate_account(account_id, |account| {
            if !account.blocked_addresses.insert(address.to_string()) {
                return Err(StoreError::Validation(format!(
                    "address {} is already blocked",
                    address
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn unblock_address(&self, account_id: &str, address: &str) -> StoreResult<()> {
        self.mutate_account(account_id, |account| {
            if !account.blocked_addresses.remove(address) {
                return Err(StoreError::Validation(format!(
                    "address {} is not blocked",
                    address
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn block_cid(&self, account_id: &str, cid: &str) -> StoreResult<()> {
        self.mutate_account(account_id, |account| {
            if !account.blocked_cids.insert(cid.to_string()) {
                return Err(StoreError::Validation(format!(
                    "cid {} is already blocked",
                    cid
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn unblock_cid(&self, account_id: &str, cid: &str) -> StoreResult<()> {
        self.mutate_account(account_id, |account| {
            if !account.blocked_cids.remove(cid) {
                return Err(StoreError::Validation(format!("cid {} is not blocked", cid)));
            }
            Ok(())
        })
        .await
    }

    async fn mutate_account(
        &self,
        account_id: &str,
        mutate: impl FnOnce(&mut Account) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let account = {
            let mut state = self.inner.write().await;
            let account = state
                .accounts
                .get_mut(account_id)
                .ok_or_else(|| StoreError::NotFound(format!("account id {}", account_id)))?;
            mutate(account)?;
            account.clone()
        };
        self.persist_account(&account).await?;
        self.announce_accounts_changed();
        Ok(())
    }

    // --- owned subplebbits ---

    /// Create a subplebbit owned by this node
    pub async fn create_subplebbit(
        &self,
        options: SubplebbitEditOptions,
    ) -> StoreResult<Subplebbit> {
        let subplebbit = self.client.create_subplebbit(options).await?;
        let mut state = self.inner.write().await;
        if !state.owned_subplebbits.contains(&subplebbit.address) {
            state.owned_subplebbits.push(subplebbit.address.clone());
        }
        Ok(subplebbit)
    }

    pub async fn delete_subplebbit(&self, address: &str) -> StoreResult<()> {
        self.client.delete_subplebbit(address).await?;
        self.inner
            .write()
            .await
            .owned_subplebbits
            .retain(|existing| existing != address);
        Ok(())
    }

    /// Addresses of owned subplebbits, refreshed by the polling loop
    pub async fn owned_subplebbits(&self) -> Vec<String> {
        self.inner.read().await.owned_subplebbits.clone()
    }

    // --- backend settings passthrough ---

    pub async fn rpc_settings(&self) -> StoreResult<Value> {
        self.client.rpc_call("getSettings", Value::Null).await
    }

    pub async fn set_rpc_settings(&self, settings: Value) -> StoreResult<Value> {
        self.client.rpc_call("setSettings", settings).await
    }

    // --- reconciliation ---

    /// Attach cids to pending account comments that match comments seen
    /// in fetched pages (same author, timestamp and subplebbit)
    pub async fn reconcile_comments(&self, seen: &[Comment]) -> StoreResult<()> {
        reconcile(
            &self.inner,
            &self.storage,
            &self.events,
            seen,
        )
        .await
    }

    /// Record the derived unread notification count for an account
    pub(crate) async fn set_unread_count(&self, account_id: &str, count: u64) {
        self.inner
            .write()
            .await
            .unread_counts
            .insert(account_id.to_string(), count);
    }

    // --- persistence ---

    async fn persist_account(&self, account: &Account) -> StoreResult<()> {
        set_typed(
            self.storage.as_ref(),
            partitions::ACCOUNTS,
            &account.id,
            account,
        )
        .await
    }

    async fn persist_metadata(&self) -> StoreResult<()> {
        let (active_id, order) = {
            let state = self.inner.read().await;
            (state.active_id.clone(), state.order.clone())
        };
        set_typed(
            self.storage.as_ref(),
            partitions::ACCOUNTS_METADATA,
            ACTIVE_ACCOUNT_KEY,
            &active_id,
        )
        .await?;
        set_typed(
            self.storage.as_ref(),
            partitions::ACCOUNTS_METADATA,
            ACCOUNT_IDS_KEY,
            &order,
        )
        .await
    }

    fn announce_accounts_changed(&self) {
        let _ = self.events.send(StoreEvent::AccountsChanged);
    }

    /// Stop background work (polling, reconciliation, publish drivers)
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    pub(crate) fn parts(
        &self,
    ) -> (
        Arc<RwLock<AccountsState>>,
        Arc<dyn Storage>,
        EventSender,
        Arc<dyn ProtocolClient>,
    ) {
        (
            self.inner.clone(),
            self.storage.clone(),
            self.events.clone(),
            self.client.clone(),
        )
    }

    pub(crate) async fn push_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }
}

/// Match pending account comments against seen page comments and patch
/// their cids in
pub(crate) async fn reconcile(
    inner: &Arc<RwLock<AccountsState>>,
    storage: &Arc<dyn Storage>,
    events: &EventSender,
    seen: &[Comment],
) -> StoreResult<()> {
    let mut changed: Vec<(String, Vec<AccountComment>)> = Vec::new();
    {
        let mut state = inner.write().await;
        for (account_id, comments) in state.comments.iter_mut() {
            let mut touched = false;
            for account_comment in comments.iter_mut() {
                if account_comment.comment.cid.is_some() {
                    continue;
                }
                let matched = seen.iter().find(|candidate| {
                    candidate.cid.is_some()
                        && candidate.author.address == account_comment.comment.author.address
                        && candidate.timestamp == account_comment.comment.timestamp
                        && candidate.subplebbit_address
                            == account_comment.comment.subplebbit_address
                });
                if let Some(candidate) = matched {
                    debug!(
                        "Reconciled pending comment {} of account {}",
                        account_comment.index, account_id
                    );
                    account_comment.comment.cid = candidate.cid.clone();
                    account_comment.state = crate::models::AccountPublicationState::Succeeded;
                    account_comment.publishing_state = crate::models::PublishingState::Succeeded;
                    touched = true;
                }
            }
            if touched {
                changed.push((account_id.clone(), comments.clone()));
            }
        }
    }

    for (account_id, comments) in changed {
        set_typed(
            storage.as_ref(),
            partitions::ACCOUNT_COMMENTS,
            &account_id,
            &comments,
        )
        .await?;
        let _ = events.send(StoreEvent::AccountCommentsChanged { account_id });
    }
    Ok(())
}

/// Periodic owned-subplebbit listing refresh
fn spawn_subplebbits_poll(
    client: Arc<dyn ProtocolClient>,
    inner: Arc<RwLock<AccountsState>>,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            match client.list_subplebbits().await {
                Ok(listing) => {
                    inner.write().await.owned_subplebbits = listing;
                }
                Err(error) => debug!("Owned subplebbit poll failed: {}", error),
            }
        }
    })
}

/// Reconcile pending comments whenever a cached comment updates
fn spawn_reconcile_listener(
    inner: Arc<RwLock<AccountsState>>,
    storage: Arc<dyn Storage>,
    cache: Arc<ContentCache>,
    events: EventSender,
) -> JoinHandle<()> {
    let mut receiver: EventReceiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(StoreEvent::CommentUpdated { cid }) => {
                    let Some(entry) = cache.comment(&cid).await else {
                        continue;
                    };
                    if let Err(error) =
                        reconcile(&inner, &storage, &events, std::slice::from_ref(&entry.comment))
                            .await
                    {
                        warn!("Comment reconciliation failed: {}", error);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
