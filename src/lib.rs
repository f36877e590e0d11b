/// Plebbit Store
///
/// A reactive client-side state layer over a plebbit-style decentralized
/// forum protocol. Feeds, reply threads, accounts, publications and
/// notifications are exposed as watchable snapshots backed by a
/// deduplicating content cache and a persistent key-value store; the
/// protocol itself (transport, crypto, challenge exchange) lives behind
/// the `ProtocolClient` trait.

pub mod accounts;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod feeds;
pub mod freshness;
pub mod models;
pub mod notifications;
pub mod pages;
pub mod replies;
pub mod sorts;
pub mod storage;
pub mod store;

pub use accounts::{
    edited_comment_state, AccountsStore, EditedCommentState, PublicationHandle, PublicationStatus,
};
pub use cache::{CommentEntry, ContentCache, SubplebbitEntry};
pub use client::{MockClient, ProtocolClient};
pub use config::{CacheConfig, FeedConfig, PollingConfig, StorageConfig, StoreConfig};
pub use error::{RecordedError, StoreError, StoreResult};
pub use events::{EventReceiver, EventSender, StoreEvent};
pub use feeds::{FeedFilter, FeedOptions, FeedSnapshot, FeedsStore};
pub use models::{
    Account, AccountComment, AccountEdit, AccountPublicationState, AccountVote, Author, Challenge,
    ChallengeItem, ChallengeVerification, Comment, CommentEditOptions, CommentOptions, Karma,
    Notification, Page, Pages, PublishingState, Signer, SortType, Subplebbit,
    SubplebbitEditOptions, UpdatingState, VoteOptions,
};
pub use notifications::NotificationsStore;
pub use pages::{PagesStore, ResolvedPage};
pub use replies::{RepliesOptions, RepliesSnapshot, RepliesStore};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use store::Store;

/// Install a process-wide tracing subscriber driven by `RUST_LOG`
///
/// Falls back to debug-level store logs. Repeated calls are harmless,
/// so embedding applications and test binaries can call it freely.
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plebbit_store=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
