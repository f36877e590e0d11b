/// In-memory protocol double
///
/// Deterministic backend for tests and offline development. Unknown
/// addresses resolve to synthesized communities with full pagination
/// chains; unknown cids resolve to synthesized comments. Fixtures can be
/// injected to override synthesis, and per-key fetch counters expose how
/// often the store actually hit the backend.
use crate::client::{
    CommentClient, ContentEvent, ProtocolClient, PublicationClient, PublishEvent, SubplebbitClient,
};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    now_timestamp, Author, Challenge, ChallengeItem, ChallengeVerification, Comment,
    CommentEditOptions, CommentOptions, Page, PublishingState, Signer, SortType, Subplebbit,
    SubplebbitEditOptions, UpdatingState, VoteOptions,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

const EVENT_BUFFER: usize = 64;

/// Question every synthesized community asks before accepting a publication
pub const CHALLENGE_QUESTION: &str = "2+2=?";
/// The only answer the synthesized challenge accepts
pub const CHALLENGE_ANSWER: &str = "4";

/// Sorts a synthesized community carries post chains for
const POST_SORTS: [SortType; 5] = [
    SortType::Hot,
    SortType::New,
    SortType::Active,
    SortType::TopAll,
    SortType::ControversialAll,
];

fn default_challenge() -> Challenge {
    Challenge {
        challenges: vec![ChallengeItem {
            challenge: CHALLENGE_QUESTION.to_string(),
            challenge_type: "text/plain".to_string(),
        }],
    }
}

struct MockCommentClient {
    state: RwLock<Comment>,
    updating: AtomicBool,
    events: broadcast::Sender<ContentEvent<Comment>>,
}

impl MockCommentClient {
    fn new(comment: Comment) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: RwLock::new(comment),
            updating: AtomicBool::new(false),
            events,
        }
    }

    async fn push(&self, comment: Comment) {
        *self.state.write().await = comment.clone();
        let _ = self.events.send(ContentEvent::Update(comment));
    }

    fn error(&self, message: &str) {
        let _ = self.events.send(ContentEvent::Error(message.to_string()));
    }
}

#[async_trait]
impl CommentClient for MockCommentClient {
    async fn snapshot(&self) -> Comment {
        self.state.read().await.clone()
    }

    async fn update(&self) -> StoreResult<()> {
        if self.updating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self
            .events
            .send(ContentEvent::StateChange(UpdatingState::Fetching));
        let snapshot = {
            let mut state = self.state.write().await;
            if state.updated_at.is_none() {
                state.updated_at = Some(now_timestamp());
            }
            state.clone()
        };
        let _ = self.events.send(ContentEvent::Update(snapshot));
        let _ = self
            .events
            .send(ContentEvent::StateChange(UpdatingState::Succeeded));
        Ok(())
    }

    async fn stop(&self) -> StoreResult<()> {
        self.updating.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(ContentEvent::StateChange(UpdatingState::Stopped));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ContentEvent<Comment>> {
        self.events.subscribe()
    }
}

struct MockSubplebbitClient {
    state: RwLock<Subplebbit>,
    updating: AtomicBool,
    events: broadcast::Sender<ContentEvent<Subplebbit>>,
}

impl MockSubplebbitClient {
    fn new(subplebbit: Subplebbit) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: RwLock::new(subplebbit),
            updating: AtomicBool::new(false),
            events,
        }
    }

    async fn push(&self, subplebbit: Subplebbit) {
        *self.state.write().await = subplebbit.clone();
        let _ = self.events.send(ContentEvent::Update(subplebbit));
    }
}

#[async_trait]
impl SubplebbitClient for MockSubplebbitClient {
    async fn snapshot(&self) -> Subplebbit {
        self.state.read().await.clone()
    }

    async fn update(&self) -> StoreResult<()> {
        if self.updating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self
            .events
            .send(ContentEvent::StateChange(UpdatingState::Fetching));
        let snapshot = {
            let mut state = self.state.write().await;
            if state.updated_at.is_none() {
                state.updated_at = Some(now_timestamp());
            }
            state.clone()
        };
        let _ = self.events.send(ContentEvent::Update(snapshot));
        let _ = self
            .events
            .send(ContentEvent::StateChange(UpdatingState::Succeeded));
        Ok(())
    }

    async fn stop(&self) -> StoreResult<()> {
        self.updating.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(ContentEvent::StateChange(UpdatingState::Stopped));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ContentEvent<Subplebbit>> {
        self.events.subscribe()
    }
}

struct MockPublicationClient {
    result_cid: Option<String>,
    challenges_enabled: bool,
    published: AtomicBool,
    events: broadcast::Sender<PublishEvent>,
}

impl MockPublicationClient {
    fn new(result_cid: Option<String>, challenges_enabled: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            result_cid,
            challenges_enabled,
            published: AtomicBool::new(false),
            events,
        }
    }

    fn emit(&self, event: PublishEvent) {
        let _ = self.events.send(event);
    }

    fn succeed(&self) {
        self.emit(PublishEvent::StateChange(
            PublishingState::WaitingChallengeVerification,
        ));
        self.emit(PublishEvent::ChallengeVerification(ChallengeVerification {
            challenge_success: true,
            reason: None,
            publication: self.result_cid.as_ref().map(|cid| json!({ "cid": cid })),
        }));
        self.emit(PublishEvent::StateChange(PublishingState::Succeeded));
    }
}

#[async_trait]
impl PublicationClient for MockPublicationClient {
    async fn publish(&self) -> StoreResult<()> {
        if self.published.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Conflict(
                "publication was already published".to_string(),
            ));
        }
        self.emit(PublishEvent::StateChange(PublishingState::Publishing));
        if self.challenges_enabled {
            self.emit(PublishEvent::StateChange(
                PublishingState::WaitingChallengeAnswers,
            ));
            self.emit(PublishEvent::Challenge(default_challenge()));
        } else {
            self.succeed();
        }
        Ok(())
    }

    async fn publish_challenge_answers(&self, answers: Vec<String>) -> StoreResult<()> {
        self.emit(PublishEvent::StateChange(
            PublishingState::PublishingChallengeAnswer,
        ));
        if answers.first().map(String::as_str) == Some(CHALLENGE_ANSWER) {
            self.succeed();
        } else {
            self.emit(PublishEvent::ChallengeVerification(ChallengeVerification {
                challenge_success: false,
                reason: Some("wrong answer".to_string()),
                publication: None,
            }));
            self.emit(PublishEvent::StateChange(PublishingState::Failed));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PublishEvent> {
        self.events.subscribe()
    }
}

/// Deterministic protocol backend used by the test suites
pub struct MockClient {
    comments: RwLock<HashMap<String, Arc<MockCommentClient>>>,
    subplebbits: RwLock<HashMap<String, Arc<MockSubplebbitClient>>>,
    pages: RwLock<HashMap<String, Page>>,
    owned_subplebbits: RwLock<Vec<String>>,
    rpc_settings: RwLock<Value>,
    comment_gets: RwLock<HashMap<String, u64>>,
    subplebbit_gets: RwLock<HashMap<String, u64>>,
    page_gets: RwLock<HashMap<String, u64>>,
    challenges_enabled: AtomicBool,
    posts_per_page: AtomicU64,
    pages_per_chain: AtomicU64,
    fail_next_publish: Mutex<Option<String>>,
    fail_next_page: Mutex<Option<String>>,
    created_count: AtomicU64,
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            comments: RwLock::new(HashMap::new()),
            subplebbits: RwLock::new(HashMap::new()),
            pages: RwLock::new(HashMap::new()),
            owned_subplebbits: RwLock::new(Vec::new()),
            rpc_settings: RwLock::new(Value::Null),
            comment_gets: RwLock::new(HashMap::new()),
            subplebbit_gets: RwLock::new(HashMap::new()),
            page_gets: RwLock::new(HashMap::new()),
            challenges_enabled: AtomicBool::new(true),
            posts_per_page: AtomicU64::new(100),
            pages_per_chain: AtomicU64::new(2),
            fail_next_publish: Mutex::new(None),
            fail_next_page: Mutex::new(None),
            created_count: AtomicU64::new(0),
        }
    }

    /// Turn the challenge exchange off: publications verify immediately
    pub fn set_challenges_enabled(&self, enabled: bool) {
        self.challenges_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Posts per synthesized page; applies to addresses not yet resolved
    pub fn set_posts_per_page(&self, count: u64) {
        self.posts_per_page.store(count, Ordering::SeqCst);
    }

    /// Pages per synthesized chain; applies to addresses not yet resolved
    pub fn set_pages_per_chain(&self, count: u64) {
        self.pages_per_chain.store(count, Ordering::SeqCst);
    }

    /// Make the next publication creation fail
    pub async fn set_fail_next_publish(&self, message: &str) {
        *self.fail_next_publish.lock().await = Some(message.to_string());
    }

    /// Make the next page fetch fail
    pub async fn set_fail_next_page(&self, message: &str) {
        *self.fail_next_page.lock().await = Some(message.to_string());
    }

    /// Register a comment fixture; later gets return it instead of synthesis
    pub async fn add_comment(&self, comment: Comment) {
        if let Some(cid) = comment.cid.clone() {
            let mut comments = self.comments.write().await;
            match comments.get(&cid) {
                Some(client) => client.push(comment).await,
                None => {
                    comments.insert(cid, Arc::new(MockCommentClient::new(comment)));
                }
            }
        }
    }

    /// Register a subplebbit fixture with whatever chains it carries
    pub async fn add_subplebbit(&self, subplebbit: Subplebbit) {
        let mut subplebbits = self.subplebbits.write().await;
        match subplebbits.get(&subplebbit.address) {
            Some(client) => client.push(subplebbit).await,
            None => {
                subplebbits.insert(
                    subplebbit.address.clone(),
                    Arc::new(MockSubplebbitClient::new(subplebbit)),
                );
            }
        }
    }

    /// Register a page under an explicit page cid
    pub async fn add_page(&self, page_cid: impl Into<String>, page: Page) {
        self.pages.write().await.insert(page_cid.into(), page);
    }

    /// Push a fresh comment snapshot and broadcast it to live subscribers
    pub async fn emit_comment_update(&self, cid: &str, comment: Comment) {
        let client = {
            let mut comments = self.comments.write().await;
            comments
                .entry(cid.to_string())
                .or_insert_with(|| Arc::new(MockCommentClient::new(comment.clone())))
                .clone()
        };
        client.push(comment).await;
    }

    /// Broadcast a fetch error to a comment's live subscribers
    pub async fn emit_comment_error(&self, cid: &str, message: &str) {
        if let Some(client) = self.comments.read().await.get(cid) {
            client.error(message);
        }
    }

    /// Push a fresh subplebbit snapshot and broadcast it to live subscribers
    pub async fn emit_subplebbit_update(&self, address: &str, subplebbit: Subplebbit) {
        let client = {
            let mut subplebbits = self.subplebbits.write().await;
            subplebbits
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(MockSubplebbitClient::new(subplebbit.clone())))
                .clone()
        };
        client.push(subplebbit).await;
    }

    pub async fn set_owned_subplebbits(&self, addresses: Vec<String>) {
        *self.owned_subplebbits.write().await = addresses;
    }

    /// How many times `get_comment` was called for a cid
    pub async fn comment_get_count(&self, cid: &str) -> u64 {
        self.comment_gets.read().await.get(cid).copied().unwrap_or(0)
    }

    /// How many times `get_subplebbit` was called for an address
    pub async fn subplebbit_get_count(&self, address: &str) -> u64 {
        self.subplebbit_gets
            .read()
            .await
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// How many times `get_page` was called for a page cid
    pub async fn page_get_count(&self, page_cid: &str) -> u64 {
        self.page_gets
            .read()
            .await
            .get(page_cid)
            .copied()
            .unwrap_or(0)
    }

    fn page_cid_for(address: &str, sort: SortType, index: u64) -> String {
        format!("{} {} page cid {}", address, sort, index)
    }

    fn make_post(address: &str, sort: SortType, number: u64) -> Comment {
        Comment {
            cid: Some(format!("{} {} comment cid {}", address, sort, number)),
            subplebbit_address: address.to_string(),
            author: Author {
                address: format!("author address {}", number),
                display_name: None,
            },
            timestamp: number,
            title: Some(format!("post {}", number)),
            content: Some(format!("content {}", number)),
            updated_at: Some(number),
            upvote_count: Some(number),
            downvote_count: Some(0),
            ..Default::default()
        }
    }

    /// Build a community with one preloaded hot page and chains per sort
    ///
    /// Posts are numbered per chain: page n carries timestamps
    /// `(n-1)*posts_per_page+1 ..= n*posts_per_page`.
    async fn synthesize_subplebbit(&self, address: &str) -> Subplebbit {
        let posts_per_page = self.posts_per_page.load(Ordering::SeqCst).max(1);
        let chain_len = self.pages_per_chain.load(Ordering::SeqCst).max(1);

        let mut registry = self.pages.write().await;
        let mut posts = crate::models::Pages::default();
        for sort in POST_SORTS {
            for index in 1..=chain_len {
                let start = (index - 1) * posts_per_page + 1;
                let comments = (start..start + posts_per_page)
                    .map(|number| Self::make_post(address, sort, number))
                    .collect();
                let next_cid = if index < chain_len {
                    Some(Self::page_cid_for(address, sort, index + 1))
                } else {
                    None
                };
                registry.insert(
                    Self::page_cid_for(address, sort, index),
                    Page { comments, next_cid },
                );
            }
            if sort == SortType::Hot {
                // hot arrives preloaded inside the snapshot
                if let Some(first) = registry.get(&Self::page_cid_for(address, sort, 1)) {
                    posts.pages.insert(sort, first.clone());
                }
            } else {
                posts
                    .page_cids
                    .insert(sort, Self::page_cid_for(address, sort, 1));
            }
        }

        Subplebbit {
            address: address.to_string(),
            title: Some(format!("{} title", address)),
            description: None,
            created_at: Some(1),
            updated_at: Some(now_timestamp()),
            posts,
        }
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn get_comment(&self, cid: &str) -> StoreResult<Arc<dyn CommentClient>> {
        *self
            .comment_gets
            .write()
            .await
            .entry(cid.to_string())
            .or_insert(0) += 1;

        let mut comments = self.comments.write().await;
        let client = comments.entry(cid.to_string()).or_insert_with(|| {
            Arc::new(MockCommentClient::new(Comment {
                cid: Some(cid.to_string()),
                subplebbit_address: format!("{} subplebbit address", cid),
                author: Author {
                    address: format!("{} author address", cid),
                    display_name: None,
                },
                timestamp: 1,
                content: Some(format!("{} content", cid)),
                ..Default::default()
            }))
        });
        Ok(client.clone())
    }

    async fn get_subplebbit(&self, address: &str) -> StoreResult<Arc<dyn SubplebbitClient>> {
        *self
            .subplebbit_gets
            .write()
            .await
            .entry(address.to_string())
            .or_insert(0) += 1;

        if let Some(client) = self.subplebbits.read().await.get(address) {
            return Ok(client.clone());
        }
        let snapshot = self.synthesize_subplebbit(address).await;
        let mut subplebbits = self.subplebbits.write().await;
        let client = subplebbits
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MockSubplebbitClient::new(snapshot)));
        Ok(client.clone())
    }

    async fn get_page(&self, page_cid: &str, _subplebbit_address: &str) -> StoreResult<Page> {
        *self
            .page_gets
            .write()
            .await
            .entry(page_cid.to_string())
            .or_insert(0) += 1;

        if let Some(message) = self.fail_next_page.lock().await.take() {
            return Err(StoreError::Fetch(message));
        }
        self.pages
            .read()
            .await
            .get(page_cid)
            .cloned()
            .ok_or_else(|| StoreError::Fetch(format!("page not found: {}", page_cid)))
    }

    async fn create_comment(
        &self,
        options: CommentOptions,
    ) -> StoreResult<Arc<dyn PublicationClient>> {
        if let Some(message) = self.fail_next_publish.lock().await.take() {
            return Err(StoreError::Fetch(message));
        }
        let content = options
            .content
            .clone()
            .or_else(|| options.title.clone())
            .unwrap_or_else(|| "comment".to_string());
        Ok(Arc::new(MockPublicationClient::new(
            Some(format!("{} cid", content)),
            self.challenges_enabled.load(Ordering::SeqCst),
        )))
    }

    async fn create_vote(&self, _options: VoteOptions) -> StoreResult<Arc<dyn PublicationClient>> {
        if let Some(message) = self.fail_next_publish.lock().await.take() {
            return Err(StoreError::Fetch(message));
        }
        Ok(Arc::new(MockPublicationClient::new(
            None,
            self.challenges_enabled.load(Ordering::SeqCst),
        )))
    }

    async fn create_comment_edit(
        &self,
        _options: CommentEditOptions,
    ) -> StoreResult<Arc<dyn PublicationClient>> {
        if let Some(message) = self.fail_next_publish.lock().await.take() {
            return Err(StoreError::Fetch(message));
        }
        Ok(Arc::new(MockPublicationClient::new(
            None,
            self.challenges_enabled.load(Ordering::SeqCst),
        )))
    }

    async fn create_subplebbit_edit(
        &self,
        _options: SubplebbitEditOptions,
    ) -> StoreResult<Arc<dyn PublicationClient>> {
        if let Some(message) = self.fail_next_publish.lock().await.take() {
            return Err(StoreError::Fetch(message));
        }
        Ok(Arc::new(MockPublicationClient::new(
            None,
            self.challenges_enabled.load(Ordering::SeqCst),
        )))
    }

    async fn create_subplebbit(&self, options: SubplebbitEditOptions) -> StoreResult<Subplebbit> {
        let address = if options.address.is_empty() {
            let number = self.created_count.fetch_add(1, Ordering::SeqCst) + 1;
            format!("created subplebbit address {}", number)
        } else {
            options.address.clone()
        };
        let subplebbit = Subplebbit {
            address: address.clone(),
            title: options.title.clone(),
            description: options.description.clone(),
            created_at: Some(now_timestamp()),
            updated_at: Some(now_timestamp()),
            posts: Default::default(),
        };
        self.subplebbits.write().await.insert(
            address.clone(),
            Arc::new(MockSubplebbitClient::new(subplebbit.clone())),
        );
        self.owned_subplebbits.write().await.push(address);
        Ok(subplebbit)
    }

    async fn delete_subplebbit(&self, address: &str) -> StoreResult<()> {
        let mut owned = self.owned_subplebbits.write().await;
        let Some(position) = owned.iter().position(|a| a == address) else {
            return Err(StoreError::NotFound(format!(
                "owned subplebbit {}",
                address
            )));
        };
        owned.remove(position);
        self.subplebbits.write().await.remove(address);
        Ok(())
    }

    async fn list_subplebbits(&self) -> StoreResult<Vec<String>> {
        Ok(self.owned_subplebbits.read().await.clone())
    }

    async fn create_signer(&self) -> StoreResult<Signer> {
        let key: [u8; 32] = rand::random();
        let digest = Sha256::digest(key);
        Ok(Signer {
            private_key: BASE64.encode(key),
            address: format!("12D3KooW{}", hex::encode(&digest[..8])),
            signer_type: "ed25519".to_string(),
        })
    }

    async fn rpc_call(&self, method: &str, params: Value) -> StoreResult<Value> {
        match method {
            "getSettings" => Ok(self.rpc_settings.read().await.clone()),
            "setSettings" => {
                *self.rpc_settings.write().await = params.clone();
                Ok(params)
            }
            other => Err(StoreError::Validation(format!(
                "unknown rpc method '{}'",
                other
            ))),
        }
    }
}
