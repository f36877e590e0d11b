/// Content Object Cache
///
/// Single shared entry per comment cid and subplebbit address. The first
/// caller constructs the protocol client handle, hydrates from storage and
/// starts background updating; every later caller observes the same entry.
/// Incoming snapshots pass the freshness arbiter before they replace
/// state, so stale network responses never clobber newer data.
use crate::client::{CommentClient, ContentEvent, ProtocolClient, SubplebbitClient};
use crate::config::CacheConfig;
use crate::error::{RecordedError, StoreError, StoreResult};
use crate::events::{EventSender, StoreEvent};
use crate::freshness;
use crate::models::{Comment, Subplebbit, UpdatingState};
use crate::storage::{get_typed, partitions, set_typed, Storage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Observable state of a cached comment
#[derive(Debug, Clone)]
pub struct CommentEntry {
    pub comment: Comment,
    pub state: UpdatingState,
    pub errors: Vec<RecordedError>,
}

impl CommentEntry {
    fn empty(cid: &str) -> Self {
        Self {
            comment: Comment {
                cid: Some(cid.to_string()),
                ..Default::default()
            },
            state: UpdatingState::Stopped,
            errors: Vec::new(),
        }
    }

    /// Most recent recorded failure, if any
    pub fn error(&self) -> Option<&RecordedError> {
        self.errors.last()
    }
}

/// Observable state of a cached subplebbit
#[derive(Debug, Clone)]
pub struct SubplebbitEntry {
    pub subplebbit: Subplebbit,
    pub state: UpdatingState,
    pub errors: Vec<RecordedError>,
}

impl SubplebbitEntry {
    fn empty(address: &str) -> Self {
        Self {
            subplebbit: Subplebbit {
                address: address.to_string(),
                ..Default::default()
            },
            state: UpdatingState::Stopped,
            errors: Vec::new(),
        }
    }

    pub fn error(&self) -> Option<&RecordedError> {
        self.errors.last()
    }
}

struct CommentSlot {
    watch: watch::Sender<CommentEntry>,
    started: AtomicBool,
    client: Mutex<Option<Arc<dyn CommentClient>>>,
    persist_lock: Mutex<()>,
}

impl CommentSlot {
    fn new(cid: &str) -> Self {
        let (watch, _) = watch::channel(CommentEntry::empty(cid));
        Self {
            watch,
            started: AtomicBool::new(false),
            client: Mutex::new(None),
            persist_lock: Mutex::new(()),
        }
    }
}

struct SubplebbitSlot {
    watch: watch::Sender<SubplebbitEntry>,
    started: AtomicBool,
    client: Mutex<Option<Arc<dyn SubplebbitClient>>>,
    persist_lock: Mutex<()>,
}

impl SubplebbitSlot {
    fn new(address: &str) -> Self {
        let (watch, _) = watch::channel(SubplebbitEntry::empty(address));
        Self {
            watch,
            started: AtomicBool::new(false),
            client: Mutex::new(None),
            persist_lock: Mutex::new(()),
        }
    }
}

/// Shared cache for comments and subplebbits
pub struct ContentCache {
    client: Arc<dyn ProtocolClient>,
    storage: Arc<dyn Storage>,
    config: CacheConfig,
    events: EventSender,
    comments: RwLock<HashMap<String, Arc<CommentSlot>>>,
    subplebbits: RwLock<HashMap<String, Arc<SubplebbitSlot>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ContentCache {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        storage: Arc<dyn Storage>,
        config: CacheConfig,
        events: EventSender,
    ) -> Self {
        Self {
            client,
            storage,
            config,
            events,
            comments: RwLock::new(HashMap::new()),
            subplebbits: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Entry for a comment, fetching and updating it if unknown
    ///
    /// The returned receiver always holds the latest entry; await
    /// `changed` to follow accepted updates.
    pub async fn get_or_create_comment(
        &self,
        cid: &str,
    ) -> StoreResult<watch::Receiver<CommentEntry>> {
        let slot = {
            let mut comments = self.comments.write().await;
            comments
                .entry(cid.to_string())
                .or_insert_with(|| Arc::new(CommentSlot::new(cid)))
                .clone()
        };

        if !slot.started.swap(true, Ordering::SeqCst) {
            if let Err(error) = self.start_comment(&slot, cid).await {
                warn!("Failed to start comment {}: {}", cid, error);
                record_comment_error(&slot, &error);
                // allow a later call to retry construction
                slot.started.store(false, Ordering::SeqCst);
            }
        }
        Ok(slot.watch.subscribe())
    }

    /// Entry for a subplebbit, fetching and updating it if unknown
    pub async fn get_or_create_subplebbit(
        &self,
        address: &str,
    ) -> StoreResult<watch::Receiver<SubplebbitEntry>> {
        let slot = {
            let mut subplebbits = self.subplebbits.write().await;
            subplebbits
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(SubplebbitSlot::new(address)))
                .clone()
        };

        if !slot.started.swap(true, Ordering::SeqCst) {
            if let Err(error) = self.start_subplebbit(&slot, address).await {
                warn!("Failed to start subplebbit {}: {}", address, error);
                record_subplebbit_error(&slot, &error);
                slot.started.store(false, Ordering::SeqCst);
            }
        }
        Ok(slot.watch.subscribe())
    }

    /// Current entry for an already-cached comment
    pub async fn comment(&self, cid: &str) -> Option<CommentEntry> {
        self.comments
            .read()
            .await
            .get(cid)
            .map(|slot| slot.watch.borrow().clone())
    }

    /// Current entry for an already-cached subplebbit
    pub async fn subplebbit(&self, address: &str) -> Option<SubplebbitEntry> {
        self.subplebbits
            .read()
            .await
            .get(address)
            .map(|slot| slot.watch.borrow().clone())
    }

    async fn start_comment(&self, slot: &Arc<CommentSlot>, cid: &str) -> StoreResult<()> {
        if self.config.hydrate_from_storage {
            if let Some(cached) =
                get_typed::<Comment>(self.storage.as_ref(), partitions::COMMENTS_CACHE, cid).await?
            {
                debug!("Hydrated comment {} from storage", cid);
                accept_comment(slot, &cached);
            }
        }

        let handle = self.client.get_comment(cid).await?;
        *slot.client.lock().await = Some(handle.clone());

        let receiver = handle.subscribe();
        let task = spawn_comment_pump(
            slot.clone(),
            self.storage.clone(),
            self.events.clone(),
            receiver,
            cid.to_string(),
        );
        self.tasks.lock().await.push(task);

        let snapshot = handle.snapshot().await;
        ingest_comment(slot, self.storage.as_ref(), &self.events, cid, snapshot).await;

        if let Err(error) = handle.update().await {
            warn!("Failed to start updating comment {}: {}", cid, error);
            record_comment_error(slot, &error);
        }
        Ok(())
    }

    async fn start_subplebbit(&self, slot: &Arc<SubplebbitSlot>, address: &str) -> StoreResult<()> {
        if self.config.hydrate_from_storage {
            if let Some(cached) = get_typed::<Subplebbit>(
                self.storage.as_ref(),
                partitions::SUBPLEBBITS_CACHE,
                address,
            )
            .await?
            {
                debug!("Hydrated subplebbit {} from storage", address);
                accept_subplebbit(slot, &cached);
            }
        }

        let handle = self.client.get_subplebbit(address).await?;
        *slot.client.lock().await = Some(handle.clone());

        let receiver = handle.subscribe();
        let task = spawn_subplebbit_pump(
            slot.clone(),
            self.storage.clone(),
            self.events.clone(),
            receiver,
            address.to_string(),
        );
        self.tasks.lock().await.push(task);

        let snapshot = handle.snapshot().await;
        ingest_subplebbit(slot, self.storage.as_ref(), &self.events, address, snapshot).await;

        if let Err(error) = handle.update().await {
            warn!("Failed to start updating subplebbit {}: {}", address, error);
            record_subplebbit_error(slot, &error);
        }
        Ok(())
    }

    /// Stop every background client and drop all entries
    pub async fn stop_all(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        for (_, slot) in self.comments.write().await.drain() {
            let client = slot.client.lock().await.take();
            if let Some(client) = client {
                let _ = client.stop().await;
            }
        }
        for (_, slot) in self.subplebbits.write().await.drain() {
            let client = slot.client.lock().await.take();
            if let Some(client) = client {
                let _ = client.stop().await;
            }
        }
    }
}

/// Replace the entry's comment when the candidate is fresher
fn accept_comment(slot: &CommentSlot, candidate: &Comment) -> bool {
    slot.watch.send_if_modified(|entry| {
        if freshness::is_newer(candidate.updated_at, entry.comment.updated_at) {
            entry.comment = candidate.clone();
            true
        } else {
            false
        }
    })
}

fn accept_subplebbit(slot: &SubplebbitSlot, candidate: &Subplebbit) -> bool {
    slot.watch.send_if_modified(|entry| {
        if freshness::is_newer(candidate.updated_at, entry.subplebbit.updated_at) {
            entry.subplebbit = candidate.clone();
            true
        } else {
            false
        }
    })
}

fn record_comment_error(slot: &CommentSlot, error: &StoreError) {
    slot.watch.send_modify(|entry| {
        entry.state = UpdatingState::Failed;
        entry.errors.push(RecordedError::new(error.to_string()));
    });
}

fn record_subplebbit_error(slot: &SubplebbitSlot, error: &StoreError) {
    slot.watch.send_modify(|entry| {
        entry.state = UpdatingState::Failed;
        entry.errors.push(RecordedError::new(error.to_string()));
    });
}

/// Arbitrate, persist and announce one incoming comment snapshot
///
/// Disk writes are serialized per slot and always store the arbitrated
/// entry; a stalled write of an older snapshot can never land after a
/// fresher one.
async fn ingest_comment(
    slot: &CommentSlot,
    storage: &dyn Storage,
    events: &EventSender,
    cid: &str,
    candidate: Comment,
) {
    if !accept_comment(slot, &candidate) {
        return;
    }
    let persisted = {
        let _guard = slot.persist_lock.lock().await;
        let accepted = slot.watch.borrow().comment.clone();
        set_typed(storage, partitions::COMMENTS_CACHE, cid, &accepted).await
    };
    if let Err(error) = persisted {
        warn!("Failed to persist comment {}: {}", cid, error);
        record_comment_error(slot, &error);
    }
    let _ = events.send(StoreEvent::CommentUpdated {
        cid: cid.to_string(),
    });
}

async fn ingest_subplebbit(
    slot: &SubplebbitSlot,
    storage: &dyn Storage,
    events: &EventSender,
    address: &str,
    candidate: Subplebbit,
) {
    if !accept_subplebbit(slot, &candidate) {
        return;
    }
    let persisted = {
        let _guard = slot.persist_lock.lock().await;
        let accepted = slot.watch.borrow().subplebbit.clone();
        set_typed(storage, partitions::SUBPLEBBITS_CACHE, address, &accepted).await
    };
    if let Err(error) = persisted {
        warn!("Failed to persist subplebbit {}: {}", address, error);
        record_subplebbit_error(slot, &error);
    }
    let _ = events.send(StoreEvent::SubplebbitUpdated {
        address: address.to_string(),
    });
}

fn spawn_comment_pump(
    slot: Arc<CommentSlot>,
    storage: Arc<dyn Storage>,
    events: EventSender,
    mut receiver: broadcast::Receiver<ContentEvent<Comment>>,
    cid: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(ContentEvent::Update(comment)) => {
                    ingest_comment(&slot, storage.as_ref(), &events, &cid, comment).await;
                }
                Ok(ContentEvent::StateChange(state)) => {
                    slot.watch.send_modify(|entry| entry.state = state);
                }
                Ok(ContentEvent::Error(message)) => {
                    slot.watch
                        .send_modify(|entry| entry.errors.push(RecordedError::new(&message)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Comment {} event stream lagged by {}", cid, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_subplebbit_pump(
    slot: Arc<SubplebbitSlot>,
    storage: Arc<dyn Storage>,
    events: EventSender,
    mut receiver: broadcast::Receiver<ContentEvent<Subplebbit>>,
    address: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(ContentEvent::Update(subplebbit)) => {
                    ingest_subplebbit(&slot, storage.as_ref(), &events, &address, subplebbit)
                        .await;
                }
                Ok(ContentEvent::StateChange(state)) => {
                    slot.watch.send_modify(|entry| entry.state = state);
                }
                Ok(ContentEvent::Error(message)) => {
                    slot.watch
                        .send_modify(|entry| entry.errors.push(RecordedError::new(&message)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subplebbit {} event stream lagged by {}", address, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
