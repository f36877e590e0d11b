/// Feed Buffering Engine
///
/// Merges pagination chains from many subplebbits into one sorted feed
/// per session. Each session keeps per-source buffers ahead of the
/// delivered window; the window itself is append-only, so entries a
/// consumer has seen never move or disappear. Sessions are identified by
/// account, sort, address set and filter identity.

pub mod engine;

use crate::accounts::AccountsStore;
use crate::cache::ContentCache;
use crate::config::FeedConfig;
use crate::error::{RecordedError, StoreError, StoreResult};
use crate::events::{EventReceiver, EventSender, StoreEvent};
use crate::models::{Account, Comment, Page, Pages, SortType, UpdatingState};
use crate::pages::PagesStore;
use engine::{Exclusions, SourceBuffer, WindowState};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Caller-supplied post predicate
///
/// Identity is the closure allocation: two filters are the same session
/// key only when they are clones of one `FeedFilter`. Logically equal
/// closures created separately are distinct keys.
#[derive(Clone)]
pub struct FeedFilter {
    inner: Arc<dyn Fn(&Comment) -> bool + Send + Sync>,
}

impl FeedFilter {
    pub fn new<F>(filter: F) -> Self
    where
        F: Fn(&Comment) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(filter),
        }
    }

    pub fn matches(&self, comment: &Comment) -> bool {
        (self.inner)(comment)
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl PartialEq for FeedFilter {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for FeedFilter {}

impl Hash for FeedFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.key());
    }
}

impl fmt::Debug for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FeedFilter").field(&self.key()).finish()
    }
}

/// What a consumer asks for when opening or advancing a feed
#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub account_id: String,
    pub subplebbit_addresses: Vec<String>,
    pub sort: SortType,
    pub filter: Option<FeedFilter>,
}

/// Session identity; addresses are sorted and deduplicated
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub account_id: String,
    pub sort: SortType,
    pub addresses: Vec<String>,
    pub filter: Option<FeedFilter>,
}

/// Observable state of one feed session
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    /// Delivered entries, append-only across updates
    pub window: Vec<Comment>,
    /// Eligible entries buffered beyond the window
    pub buffered_count: usize,
    pub has_more: bool,
    pub state: UpdatingState,
    pub errors: Vec<RecordedError>,
}

impl Default for FeedSnapshot {
    fn default() -> Self {
        Self {
            window: Vec::new(),
            buffered_count: 0,
            // unknown until the first source resolves
            has_more: true,
            state: UpdatingState::Fetching,
            errors: Vec::new(),
        }
    }
}

struct FeedSession {
    key: FeedKey,
    watch: watch::Sender<FeedSnapshot>,
    state: Mutex<SessionState>,
    /// True while a requested page has not been delivered yet; only
    /// `load_more` sets it, whoever completes the delivery clears it
    advance_pending: AtomicBool,
}

impl FeedSession {
    fn new(key: FeedKey) -> Self {
        let (watch, _) = watch::channel(FeedSnapshot::default());
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
    sources: BTreeMap<String, SourceBuffer>,
    window: WindowState,
}

#[derive(Clone)]
struct EngineCtx {
    cache: Arc<ContentCache>,
    pages: Arc<PagesStore>,
    accounts: Arc<AccountsStore>,
    config: FeedConfig,
}

type SessionMap = Arc<RwLock<HashMap<FeedKey, Arc<FeedSession>>>>;

pub struct FeedsStore {
    ctx: EngineCtx,
    sessions: SessionMap,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl FeedsStore {
    pub fn new(
        cache: Arc<ContentCache>,
        pages: Arc<PagesStore>,
        accounts: Arc<AccountsStore>,
        config: FeedConfig,
        events: &EventSender,
    ) -> Self {
        let ctx = EngineCtx {
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

    /// Open (or reattach to) a feed session and start filling its first
    /// page in the background
    pub async fn feed(&self, options: &FeedOptions) -> StoreResult<watch::Receiver<FeedSnapshot>> {
        let key = normalize(options)?;
        self.ctx.accounts.account_by_id(&key.account_id).await?;
        for address in &key.addresses {
            self.ctx.cache.get_or_create_subplebbit(address).await?;
        }

        let (session, created) = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&key) {
                Some(session) => (session.clone(), false),
                None => {
                    let session = Arc::new(FeedSession::new(key.clone()));
                    sessions.insert(key.clone(), session.clone());
                    (session, true)
                }
            }
        };

        if created {
            let mut state = session.state.lock().await;
            for address in &key.addresses {
                state.sources.insert(address.clone(), SourceBuffer::default());
            }
            state.window.pages_requested = 1;
            session.advance_pending.store(true, Ordering::SeqCst);
            drop(state);
            debug!("Opened feed session for {} sources", key.addresses.len());
            tokio::spawn(catch_up(self.ctx.clone(), session.clone()));
        }
        Ok(session.watch.subscribe())
    }

    /// Grow the window by one page
    ///
    /// A second call before the previous page was appended fails with
    /// `PendingOperation`; background refills never block an admitted
    /// call, they share the session lock.
    pub async fn load_more(&self, options: &FeedOptions) -> StoreResult<()> {
        let key = normalize(options)?;
        let session = self
            .sessions
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("feed session for sort {}", key.sort)))?;

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
    pub async fn snapshot(&self, options: &FeedOptions) -> StoreResult<Option<FeedSnapshot>> {
        let key = normalize(options)?;
        Ok(self
            .sessions
            .read()
            .await
            .get(&key)
            .map(|session| session.watch.borrow().clone()))
    }

    /// Drop every session; delivered windows are gone for good
    pub async fn reset(&self) {
        self.sessions.write().await.clear();
    }

    /// Stop reacting to store events
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        self.reset().await;
    }
}

fn normalize(options: &FeedOptions) -> StoreResult<FeedKey> {
    if options.subplebbit_addresses.is_empty() {
        return Err(StoreError::Validation(
            "feed requires at least one subplebbit address".to_string(),
        ));
    }
    let mut addresses = options.subplebbit_addresses.clone();
    addresses.sort();
    addresses.dedup();
    Ok(FeedKey {
        account_id: options.account_id.clone(),
        sort: options.sort,
        addresses,
        filter: options.filter.clone(),
    })
}

fn merged(key: &FeedKey, state: &SessionState, account: &Account) -> Vec<Comment> {
    let exclusions = Exclusions {
        blocked_addresses: &account.blocked_addresses,
        blocked_cids: &account.blocked_cids,
        filter: key.filter.as_ref(),
    };
    engine::merge_eligible(
        key.sort,
        state.sources.values(),
        &exclusions,
        &state.window.window_cids,
    )
}

/// Append pages to the window until the request is satisfied or no more
/// data can currently be produced
async fn fill(ctx: &EngineCtx, key: &FeedKey, state: &mut SessionState) {
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
        if state.sources.values().all(|source| source.exhausted) {
            // every chain ended: deliver the partial tail and settle
            state.window.take(eligible, ctx.config.page_size);
            state.window.pages_delivered = state.window.pages_requested;
            break;
        }
        if !fetch_round(ctx, key, state).await {
            // no source can advance right now; a later event resumes us
            break;
        }
    }
}

/// Keep the buffers ahead of the window
async fn replenish(ctx: &EngineCtx, key: &FeedKey, state: &mut SessionState) {
    let account = ctx
        .accounts
        .account_by_id(&key.account_id)
        .await
        .unwrap_or_default();
    if merged(key, state, &account).len() >= ctx.config.refill_threshold {
        return;
    }
    while merged(key, state, &account).len() < ctx.config.readahead {
        if state.sources.values().all(|source| source.exhausted) {
            return;
        }
        if !fetch_round(ctx, key, state).await {
            return;
        }
    }
}

struct Fetched {
    page: Page,
    resolved_sort: Option<SortType>,
    known_page_cids: Option<HashMap<SortType, String>>,
}

enum Plan {
    Head(Pages),
    Next(Page),
}

/// Advance every non-exhausted source by one page, concurrently
///
/// A failing source records its error and stays retryable; it never
/// aborts the round for the others. Returns whether any source advanced.
async fn fetch_round(ctx: &EngineCtx, key: &FeedKey, state: &mut SessionState) -> bool {
    let mut plans: Vec<(String, Plan)> = Vec::new();
    for (address, source) in state.sources.iter() {
        if source.exhausted {
            continue;
        }
        if !source.started {
            if let Some(entry) = ctx.cache.subplebbit(address).await {
                if !entry.subplebbit.posts.is_empty() {
                    plans.push((address.clone(), Plan::Head(entry.subplebbit.posts.clone())));
                }
            }
        } else if let Some(tail) = source.tail.clone() {
            if tail.next_cid.is_some() {
                plans.push((address.clone(), Plan::Next(tail)));
            }
        }
    }
    if plans.is_empty() {
        return false;
    }

    let sort = key.sort;
    let fetches = plans.into_iter().map(|(address, plan)| {
        let pages = ctx.pages.clone();
        async move {
            let outcome = match plan {
                Plan::Head(listing) => {
                    let known = listing.page_cids.clone();
                    pages.head_page(&address, &listing, sort).await.map(|head| {
                        head.map(|resolved| Fetched {
                            page: resolved.page,
                            resolved_sort: Some(resolved.sort),
                            known_page_cids: Some(known),
                        })
                    })
                }
                Plan::Next(tail) => {
                    pages.next_page(&address, &tail, sort).await.map(|next| {
                        next.map(|page| Fetched {
                            page,
                            resolved_sort: None,
                            known_page_cids: None,
                        })
                    })
                }
            };
            (address, outcome)
        }
    });

    let mut progressed = false;
    for (address, outcome) in futures::future::join_all(fetches).await {
        let Some(source) = state.sources.get_mut(&address) else {
            continue;
        };
        match outcome {
            Ok(Some(fetched)) => {
                if let Some(resolved) = fetched.resolved_sort {
                    source.resolved_sort = Some(resolved);
                }
                if let Some(known) = fetched.known_page_cids {
                    source.known_page_cids = known;
                }
                source.push_page(fetched.page);
                progressed = true;
            }
            Ok(None) => {
                source.started = true;
                source.exhausted = true;
                progressed = true;
            }
            Err(error) => {
                warn!("Feed source {} fetch failed: {}", address, error);
                source.errors.push(RecordedError::new(error.to_string()));
            }
        }
    }
    progressed
}

/// Fill any outstanding page requests, top the buffers up and publish
///
/// Serialized with `load_more` on the session lock; a delivery owed by
/// an earlier advance releases that advance once it lands.
async fn catch_up(ctx: EngineCtx, session: Arc<FeedSession>) {
    let mut state = session.state.lock().await;
    let owed = state.window.pages_delivered < state.window.pages_requested;
    fill(&ctx, &session.key, &mut state).await;
    if owed && state.window.pages_delivered >= state.window.pages_requested {
        session.advance_pending.store(false, Ordering::SeqCst);
    }
    replenish(&ctx, &session.key, &mut state).await;
    publish(&ctx, &session, &state).await;
}

async fn publish(ctx: &EngineCtx, session: &FeedSession, state: &SessionState) {
    let account = ctx
        .accounts
        .account_by_id(&session.key.account_id)
        .await
        .unwrap_or_default();
    let eligible = merged(&session.key, state, &account);
    let any_started = state.sources.values().any(|source| source.started);
    let any_errors = state.sources.values().any(|source| !source.errors.is_empty());
    let all_exhausted = state.sources.values().all(|source| source.exhausted);

    session.watch.send_replace(FeedSnapshot {
        window: state.window.window.clone(),
        buffered_count: eligible.len(),
        has_more: !eligible.is_empty() || !all_exhausted,
        state: if any_started {
            UpdatingState::Succeeded
        } else if any_errors {
            UpdatingState::Failed
        } else {
            UpdatingState::Fetching
        },
        errors: state
            .sources
            .values()
            .flat_map(|source| source.errors.iter().cloned())
            .collect(),
    });
}

async fn run_listener(ctx: EngineCtx, sessions: SessionMap, mut receiver: EventReceiver) {
    loop {
        match receiver.recv().await {
            Ok(StoreEvent::SubplebbitUpdated { address }) => {
                let affected: Vec<Arc<FeedSession>> = sessions
                    .read()
                    .await
                    .values()
                    .filter(|session| session.key.addresses.iter().any(|a| a == &address))
                    .cloned()
                    .collect();
                for session in affected {
                    refresh_source(&ctx, &session, &address).await;
                }
            }
            Ok(StoreEvent::AccountsChanged) => {
                let all: Vec<Arc<FeedSession>> =
                    sessions.read().await.values().cloned().collect();
                for session in all {
                    let state = session.state.lock().await;
                    publish(&ctx, &session, &state).await;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Feed listener lagged by {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// React to a subplebbit snapshot change: restart the source's chain when
/// its page cids moved, then resume filling
async fn refresh_source(ctx: &EngineCtx, session: &Arc<FeedSession>, address: &str) {
    let Some(entry) = ctx.cache.subplebbit(address).await else {
        return;
    };
    {
        let mut state = session.state.lock().await;
        if let Some(source) = state.sources.get_mut(address) {
            if source.started && source.known_page_cids != entry.subplebbit.posts.page_cids {
                debug!("Feed source {} page cids changed, restarting chain", address);
                source.reset();
            }
        }
    }
    catch_up(ctx.clone(), session.clone()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_identity_is_the_allocation() {
        let original = FeedFilter::new(|comment: &Comment| comment.title.is_some());
        let clone = original.clone();
        let lookalike = FeedFilter::new(|comment: &Comment| comment.title.is_some());

        assert_eq!(original, clone);
        assert_ne!(original, lookalike);
    }

    #[test]
    fn test_keys_normalize_address_order() {
        let first = normalize(&FeedOptions {
            account_id: "a1".to_string(),
            subplebbit_addresses: vec!["b.eth".to_string(), "a.eth".to_string()],
            sort: SortType::New,
            filter: None,
        })
        .unwrap();
        let second = normalize(&FeedOptions {
            account_id: "a1".to_string(),
            subplebbit_addresses: vec![
                "a.eth".to_string(),
                "b.eth".to_string(),
                "a.eth".to_string(),
            ],
            sort: SortType::New,
            filter: None,
        })
        .unwrap();

        assert_eq!(first, second);
        assert!(normalize(&FeedOptions {
            account_id: "a1".to_string(),
            subplebbit_addresses: vec![],
            sort: SortType::New,
            filter: None,
        })
        .is_err());
    }
}
