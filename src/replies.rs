/// Replies Buffering Engine
///
/// One session per (account, parent comment, sort, filter). The machinery
/// mirrors the post feed: a buffered chain ahead of an append-only
/// window. Replies additionally expose an `updated_window`: the same
/// entries with any fresher cached versions substituted, with the
/// account's own not-yet-propagated replies in front.
use crate::accounts::AccountsStore;
use crate::cache::ContentCache;
use crate::config::FeedConfig;
use crate::error::{RecordedError, StoreError, StoreResult};
use crate::events::{EventReceiver, EventSender, StoreEvent};
use crate::feeds::engine::{self, Exclusions, SourceBuffer, WindowState};
use crate::feeds::FeedFilter;
use crate::freshness;
use crate::models::{Account, Comment, SortType, UpdatingState};
use crate::pages::PagesStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a consumer asks for when opening a reply listing
#[derive(Debug, Clone)]
pub struct RepliesOptions {
    pub account_id: String,
    pub comment_cid: String,
    pub sort: SortType,
    pub filter: Option<FeedFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RepliesKey {
    account_id: String,
    comment_cid: String,
    sort: SortType,
    filter: Option<FeedFilter>,
}

/// Observable state of one replies session
#[derive(Debug, Clone)]
pub struct RepliesSnapshot {
    /// Delivered entries, append-only across updates
    pub window: Vec<Comment>,
    /// Window entries with fresher cached versions substituted and the
    /// account's own pending replies prepended
    pub updated_window: Vec<Comment>,
    pub buffered_count: usize,
    pub has_more: bool,
    pub state: UpdatingState,
    pub errors: Vec<RecordedError>,
}

impl Default for RepliesSnapshot {
    fn default() -> Self {
        Self {
            window: Vec::new(),
            updated_window: Vec::new(),
            buffered_count: 0,
            has_more: true,
            state: UpdatingState::Fetching,
            errors: Vec::new(),
        }
    }
}

struct RepliesSession {
    key: RepliesKey,
    watch: watch::Sender<RepliesSnapshot>,
    state: Mutex<SessionState>,
    /// True while a requested page has not been delivered yet; only
    /// `load_more` sets it, whoever completes the delivery clears it
    advance_pending: AtomicBool,
}

impl RepliesSession {
    fn new(key: RepliesKey) -> Self {
        let (watch, _) = watch::channel(RepliesSnapshot::default());
        Self {
            key,
            watch,
            state: Mutex::new(SessionState::default()),
            advance_pending: AtomicBool::new(false),
        }
    }
}

#[derive(Default)]
struct SessionState {
    source: SourceBuffer,
    /// Subplebbit owning the parent comment, learned at head time
    owner_address: Option<String>,
    window: WindowState,
}

#[derive(Clone)]
struct RepliesCtx {
    cache: Arc<ContentCache>,
    pages: Arc<PagesStore>,
    accounts: Arc<AccountsStore>,
    config: FeedConfig,
}

type SessionMap = Arc<RwLock<HashMap<RepliesKey, Arc<RepliesSession>>>>;

pub struct RepliesStore {
    ctx: RepliesCtx,
    sessions: SessionMap,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RepliesStore {
    pub fn new(
        cache: Arc<ContentCache>,
        pages: Arc<PagesStore>,
        accounts: Arc<AccountsStore>,
        config: FeedConfig,
        events: &EventSender,
    ) -> Self {
        let ctx = RepliesCtx {
            cache,
            pages,
            accounts,
            config,
        };
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let listener = tokio::spawn(run_listener(
            ctx.clone(),
            sessions.clone(),
            events.subscribe(),
        ));
        Self {
            ctx,
            sessions,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Open (or reattach to) a replies session; the parent comment starts
    /// updating and the first page fills in the background
    pub async fn replies(
        &self,
        options: &RepliesOptions,
    ) -> StoreResult<watch::Receiver<RepliesSnapshot>> {
        let key = normalize(options)?;
        self.ctx.accounts.account_by_id(&key.account_id).await?;
        self.ctx
            .cache
            .get_or_create_comment(&key.comment_cid)
            .await?;

        let (session, created) = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&key) {
                Some(session) => (session.clone(), false),
                None => {
                    let session = Arc::new(RepliesSession::new(key.clone()));
                    sessions.insert(key.clone(), session.clone());
                    (session, true)
                }
            }
        };

        if created {
            let mut state = session.state.lock().await;
            state.window.pages_requested = 1;
            session.advance_pending.store(true, Ordering::SeqCst);
            drop(state);
            debug!("Opened replies session for comment {}", key.comment_cid);
            tokio::spawn(catch_up(self.ctx.clone(), session.clone()));
        }
        Ok(session.watch.subscribe())
    }

    /// Grow the window by one page
    ///
    /// A second call before the previous page was appended fails with
    /// `PendingOperation`; background refills share the session lock and
    /// never reject an admitted call.
    pub async fn load_more(&self, options: &RepliesOptions) -> StoreResult<()> {
        let key = normalize(options)?;
        let session = self
            .sessions
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("replies session for {}", key.comment_cid))
            })?;

        if session.advance_pending.swap(true, Ordering::SeqCst) {
            return Err(StoreError::PendingOperation(
                "previous page has not been delivered yet".to_string(),
            ));
        }

        let mut state = session.state.lock().await;
        if state.window.pages_delivered < state.window.pages_requested {
            return Err(StoreError::PendingOperation(
                "previous page has not been delivered yet".to_string(),
            ));
        }
        state.window.pages_requested += 1;
        fill(&self.ctx, &session.key, &mut state).await;
        if state.window.pages_delivered >= state.window.pages_requested {
            session.advance_pending.store(false, Ordering::SeqCst);
        }
        publish(&self.ctx, &session, &state).await;
        drop(state);

        tokio::spawn(catch_up(self.ctx.clone(), session.clone()));
        Ok(())
    }

    /// Current snapshot of a session, if it exists
    pub async fn snapshot(&self, options: &RepliesOptions) -> StoreResult<Option<RepliesSnapshot>> {
        let key = normalize(options)?;
        Ok(self
            .sessions
            .read()
            .await
            .get(&key)
            .map(|session| session.watch.borrow().clone()))
    }

    pub async fn reset(&self) {
        self.sessions.write().await.clear();
    }

    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        self.reset().await;
    }
}

fn normalize(options: &RepliesOptions) -> StoreResult<RepliesKey> {
    if options.comment_cid.is_empty() {
        return Err(StoreError::Validation(
            "replies require a parent comment cid".to_string(),
        ));
    }
    Ok(RepliesKey {
        account_id: options.account_id.clone(),
        comment_cid: options.comment_cid.clone(),
        sort: options.sort,
        filter: options.filter.clone(),
    })
}

fn merged(key: &RepliesKey, state: &SessionState, account: &Account) -> Vec<Comment> {
    let exclusions = Exclusions {
        blocked_addresses: &account.blocked_addresses,
        blocked_cids: &account.blocked_cids,
        filter: key.filter.as_ref(),
    };
    engine::merge_eligible(
        key.sort,
        std::iter::once(&state.source),
        &exclusions,
        &state.window.window_cids,
    )
}

async fn fill(ctx: &RepliesCtx, key: &RepliesKey, state: &mut SessionState) {
    while state.window.pages_delivered < state.window.pages_requested {
        let account = ctx
            .accounts
            .account_by_id(&key.account_id)
            .await
            .unwrap_or_default();
        let eligible = merged(key, state, &account);

        if eligible.len() >= ctx.config.page_size {
            state.window.take(eligible, ctx.config.page_size);
            state.window.pages_delivered += 1;
            continue;
        }
        if state.source.exhausted {
            state.window.take(eligible, ctx.config.page_size);
            state.window.pages_delivered = state.window.pages_requested;
            break;
        }
        if !advance_source(ctx, key, state).await {
            break;
        }
    }
}

async fn replenish(ctx: &RepliesCtx, key: &RepliesKey, state: &mut SessionState) {
    let account = ctx
        .accounts
        .account_by_id(&key.account_id)
        .await
        .unwrap_or_default();
    if merged(key, state, &account).len() >= ctx.config.refill_threshold {
        return;
    }
    while merged(key, state, &account).len() < ctx.config.readahead {
        if state.source.exhausted {
            return;
        }
        if !advance_source(ctx, key, state).await {
            return;
        }
    }
}

/// Load the next page of the reply chain; returns whether it advanced
async fn advance_source(ctx: &RepliesCtx, key: &RepliesKey, state: &mut SessionState) -> bool {
    if state.source.exhausted {
        return false;
    }

    if !state.source.started {
        let Some(entry) = ctx.cache.comment(&key.comment_cid).await else {
            return false;
        };
        let listing = entry.comment.replies.clone();
        if listing.is_empty() {
            // distinguish "no replies" from "parent not loaded yet"
            if entry.comment.updated_at.is_some() {
                state.source.started = true;
                state.source.exhausted = true;
                return true;
            }
            return false;
        }
        let owner_address = entry.comment.subplebbit_address.clone();
        match ctx.pages.head_page(&owner_address, &listing, key.sort).await {
            Ok(Some(resolved)) => {
                state.owner_address = Some(owner_address);
                state.source.resolved_sort = Some(resolved.sort);
                state.source.known_page_cids = listing.page_cids.clone();
                state.source.push_page(resolved.page);
                true
            }
            Ok(None) => {
                state.source.started = true;
                state.source.exhausted = true;
                true
            }
            Err(error) => {
                warn!(
                    "Replies head fetch failed for {}: {}",
                    key.comment_cid, error
                );
                state.source.errors.push(RecordedError::new(error.to_string()));
                false
            }
        }
    } else {
        let Some(tail) = state.source.tail.clone() else {
            return false;
        };
        let owner_address = state.owner_address.clone().unwrap_or_default();
        match ctx.pages.next_page(&owner_address, &tail, key.sort).await {
            Ok(Some(page)) => {
                state.source.push_page(page);
                true
            }
            Ok(None) => {
                state.source.exhausted = true;
                true
            }
            Err(error) => {
                warn!(
                    "Replies page fetch failed for {}: {}",
                    key.comment_cid, error
                );
                state.source.errors.push(RecordedError::new(error.to_string()));
                false
            }
        }
    }
}

async fn catch_up(ctx: RepliesCtx, session: Arc<RepliesSession>) {
    let mut state = session.state.lock().await;
    let owed = state.window.pages_delivered < state.window.pages_requested;
    fill(&ctx, &session.key, &mut state).await;
    if owed && state.window.pages_delivered >= state.window.pages_requested {
        session.advance_pending.store(false, Ordering::SeqCst);
    }
    replenish(&ctx, &session.key, &mut state).await;
    publish(&ctx, &session, &state).await;
}

/// Window entries with fresher cached versions substituted; the
/// account's own replies that have not yet appeared in pages go in front
async fn build_updated_window(
    ctx: &RepliesCtx,
    key: &RepliesKey,
    state: &SessionState,
) -> Vec<Comment> {
    let mut updated = Vec::with_capacity(state.window.window.len() + 1);

    if let Ok(account_comments) = ctx.accounts.account_comments(&key.account_id).await {
        for account_comment in account_comments {
            if account_comment.comment.parent_cid.as_deref() != Some(key.comment_cid.as_str()) {
                continue;
            }
            match &account_comment.comment.cid {
                Some(cid) if state.window.window_cids.contains(cid) => continue,
                _ => updated.push(account_comment.comment.clone()),
            }
        }
    }

    for comment in &state.window.window {
        let fresh = match &comment.cid {
            Some(cid) => ctx.cache.comment(cid).await,
            None => None,
        };
        match fresh {
            Some(entry)
                if freshness::is_newer(entry.comment.updated_at, comment.updated_at) =>
            {
                updated.push(entry.comment.clone());
            }
            _ => updated.push(comment.clone()),
        }
    }
    updated
}

async fn publish(ctx: &RepliesCtx, session: &RepliesSession, state: &SessionState) {
    let account = ctx
        .accounts
        .account_by_id(&session.key.account_id)
        .await
        .unwrap_or_default();
    let eligible = merged(&session.key, state, &account);
    let updated_window = build_updated_window(ctx, &session.key, state).await;

    session.watch.send_replace(RepliesSnapshot {
        window: state.window.window.clone(),
        updated_window,
        buffered_count: eligible.len(),
        has_more: !eligible.is_empty() || !state.source.exhausted,
        state: if state.source.started {
            UpdatingState::Succeeded
        } else if !state.source.errors.is_empty() {
            UpdatingState::Failed
        } else {
            UpdatingState::Fetching
        },
        errors: state.source.errors.clone(),
    });
}

async fn run_listener(ctx: RepliesCtx, sessions: SessionMap, mut receiver: EventReceiver) {
    loop {
        match receiver.recv().await {
            Ok(StoreEvent::CommentUpdated { cid }) => {
                let affected: Vec<Arc<RepliesSession>> = sessions
                    .read()
                    .await
                    .values()
                    .filter(|session| session.key.comment_cid == cid)
                    .cloned()
                    .collect();
                for session in affected {
                    refresh_parent(&ctx, &session).await;
                }

                // a windowed reply may have gotten fresher
                let watching: Vec<Arc<RepliesSession>> = sessions
                    .read()
                    .await
                    .values()
                    .filter(|session| session.key.comment_cid != cid)
                    .cloned()
                    .collect();
                for session in watching {
                    let contains = {
                        let state = session.state.lock().await;
                        state.window.window_cids.contains(&cid)
                    };
                    if contains {
                        let state = session.state.lock().await;
                        publish(&ctx, &session, &state).await;
                    }
                }
            }
            Ok(StoreEvent::AccountCommentsChanged { account_id })
            | Ok(StoreEvent::NotificationsChanged { account_id }) => {
                let affected: Vec<Arc<RepliesSession>> = sessions
                    .read()
                    .await
                    .values()
                    .filter(|session| session.key.account_id == account_id)
                    .cloned()
                    .collect();
                for session in affected {
                    let state = session.state.lock().await;
                    publish(&ctx, &session, &state).await;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Replies listener lagged by {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// The parent comment updated: restart the chain when its reply page
/// cids moved, then resume filling
async fn refresh_parent(ctx: &RepliesCtx, session: &Arc<RepliesSession>) {
    let Some(entry) = ctx.cache.comment(&session.key.comment_cid).await else {
        return;
    };
    {
        let mut state = session.state.lock().await;
        if state.source.started
            && state.source.known_page_cids != entry.comment.replies.page_cids
        {
            debug!(
                "Reply page cids changed for {}, restarting chain",
                session.key.comment_cid
            );
            state.source.reset();
        }
    }
    catch_up(ctx.clone(), session.clone()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_require_a_parent_cid() {
        assert!(normalize(&RepliesOptions {
            account_id: "a1".to_string(),
            comment_cid: String::new(),
            sort: SortType::Best,
            filter: None,
        })
        .is_err());

        let key = normalize(&RepliesOptions {
            account_id: "a1".to_string(),
            comment_cid: "comment cid 1".to_string(),
            sort: SortType::NewFlat,
            filter: None,
        })
        .unwrap();
        assert_eq!(key.sort, SortType::NewFlat);
    }
}
