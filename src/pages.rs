/// Paginated Source Adapter
///
/// Uniform access to pagination chains regardless of how their data
/// arrived: preloaded inside an owner snapshot, persisted from an earlier
/// session, or fetched over the network. Every page cid is fetched at most
/// once per process; concurrent requests share the in-flight fetch and
/// failures leave the slot empty so the next request retries.
use crate::client::ProtocolClient;
use crate::error::{StoreError, StoreResult};
use crate::models::{Comment, Page, Pages, SortType};
use crate::sorts;
use crate::storage::{get_typed, partitions, set_typed, Storage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

/// Callback invoked with every batch of comments the adapter hands out;
/// used to reconcile pending account publications against seen cids
pub type PageCommentsHook = Arc<dyn Fn(Vec<Comment>) + Send + Sync>;

/// A page resolved through the sort fallback table
#[derive(Debug, Clone)]
pub struct ResolvedPage {
    /// Sort whose chain actually provided the data
    pub sort: SortType,
    pub page: Page,
}

pub struct PagesStore {
    client: Arc<dyn ProtocolClient>,
    storage: Arc<dyn Storage>,
    fetches: RwLock<HashMap<String, Arc<OnceCell<Page>>>>,
    comments_seen: RwLock<Option<PageCommentsHook>>,
}

impl PagesStore {
    pub fn new(client: Arc<dyn ProtocolClient>, storage: Arc<dyn Storage>) -> Self {
        Self {
            client,
            storage,
            fetches: RwLock::new(HashMap::new()),
            comments_seen: RwLock::new(None),
        }
    }

    /// Register the hook that observes every delivered page
    pub async fn on_comments_seen(&self, hook: PageCommentsHook) {
        *self.comments_seen.write().await = Some(hook);
    }

    /// Fetch one page by cid, deduplicating concurrent and repeated calls
    ///
    /// Persisted pages short-circuit the network. A successful result is
    /// pinned for the process lifetime; a failure is returned to every
    /// waiter and the next call starts over.
    pub async fn fetch_page(&self, page_cid: &str, subplebbit_address: &str) -> StoreResult<Page> {
        let cell = {
            let mut fetches = self.fetches.write().await;
            fetches
                .entry(page_cid.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let page = cell
            .get_or_try_init(|| async {
                if let Some(cached) =
                    get_typed::<Page>(self.storage.as_ref(), partitions::PAGES_CACHE, page_cid)
                        .await?
                {
                    debug!("Loaded page {} from storage", page_cid);
                    return Ok(cached);
                }
                let page = self.client.get_page(page_cid, subplebbit_address).await?;
                set_typed(self.storage.as_ref(), partitions::PAGES_CACHE, page_cid, &page)
                    .await?;
                debug!(
                    "Fetched page {} with {} comments",
                    page_cid,
                    page.comments.len()
                );
                Ok::<Page, StoreError>(page)
            })
            .await?;
        Ok(page.clone())
    }

    /// First page for a requested sort, walking the fallback table
    ///
    /// Returns `None` when the listing has no data for any sort. Flat
    /// requests inline nested reply trees into the delivered page.
    pub async fn head_page(
        &self,
        owner_address: &str,
        pages: &Pages,
        requested: SortType,
    ) -> StoreResult<Option<ResolvedPage>> {
        let Some(sort) = sorts::resolve_sort(pages, requested) else {
            return Ok(None);
        };

        let page = match pages.pages.get(&sort) {
            Some(preloaded) => preloaded.clone(),
            None => match pages.page_cids.get(&sort) {
                Some(page_cid) => self.fetch_page(page_cid, owner_address).await?,
                None => return Ok(None),
            },
        };

        let page = adapt_page(requested, page);
        self.notify_comments_seen(&page.comments).await;
        Ok(Some(ResolvedPage { sort, page }))
    }

    /// Page following `page` in its chain; `None` at the end
    pub async fn next_page(
        &self,
        owner_address: &str,
        page: &Page,
        requested: SortType,
    ) -> StoreResult<Option<Page>> {
        let Some(next_cid) = &page.next_cid else {
            return Ok(None);
        };
        let next = self.fetch_page(next_cid, owner_address).await?;
        let next = adapt_page(requested, next);
        self.notify_comments_seen(&next.comments).await;
        Ok(Some(next))
    }

    async fn notify_comments_seen(&self, comments: &[Comment]) {
        if comments.is_empty() {
            return;
        }
        let hook = self.comments_seen.read().await.clone();
        if let Some(hook) = hook {
            hook(comments.to_vec());
        }
    }
}

/// Inline reply trees when the requested sort is flat
fn adapt_page(requested: SortType, page: Page) -> Page {
    if !requested.is_flat() {
        return page;
    }
    Page {
        comments: sorts::flatten_replies(&page.comments),
        next_cid: page.next_cid,
    }
}
