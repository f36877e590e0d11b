/// Protocol Client Interface
///
/// Seam between the store and the underlying forum protocol. The store
/// talks to content and publications exclusively through these traits, so
/// backends are swappable (embedded node, remote RPC, test double).

pub mod mock;

pub use mock::MockClient;

use crate::error::StoreResult;
use crate::models::{
    Challenge, ChallengeVerification, Comment, CommentEditOptions, CommentOptions, Page,
    PublishingState, Signer, Subplebbit, SubplebbitEditOptions, UpdatingState, VoteOptions,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event emitted by an updating content object
#[derive(Debug, Clone)]
pub enum ContentEvent<T: Clone> {
    /// A fresh snapshot arrived from the network
    Update(T),
    StateChange(UpdatingState),
    Error(String),
}

/// Event emitted by an in-flight publication
#[derive(Debug, Clone)]
pub enum PublishEvent {
    StateChange(PublishingState),
    /// The destination community demands challenge answers
    Challenge(Challenge),
    ChallengeVerification(ChallengeVerification),
    Error(String),
}

/// A comment the client keeps updating in the background
///
/// `update` is idempotent: the first call starts the sync loop, later
/// calls are no-ops. Events survive only while at least one receiver from
/// `subscribe` is alive; snapshots are always readable.
#[async_trait]
pub trait CommentClient: Send + Sync {
    /// Latest locally-known state of the comment
    async fn snapshot(&self) -> Comment;

    /// Start background updating; safe to call more than once
    async fn update(&self) -> StoreResult<()>;

    /// Stop background updating and release network resources
    async fn stop(&self) -> StoreResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<ContentEvent<Comment>>;
}

/// A subplebbit the client keeps updating in the background
#[async_trait]
pub trait SubplebbitClient: Send + Sync {
    async fn snapshot(&self) -> Subplebbit;

    async fn update(&self) -> StoreResult<()>;

    async fn stop(&self) -> StoreResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<ContentEvent<Subplebbit>>;
}

/// An outgoing publication (comment, vote or edit)
///
/// Dropping the handle abandons the publication; the store keeps it alive
/// until a terminal state is reached.
#[async_trait]
pub trait PublicationClient: Send + Sync {
    /// Send the publication to its destination community
    async fn publish(&self) -> StoreResult<()>;

    /// Answer a previously received challenge
    async fn publish_challenge_answers(&self, answers: Vec<String>) -> StoreResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<PublishEvent>;
}

/// Protocol client backend
///
/// Constructors hand out live handles; `get_page` is a plain fetch with no
/// background behavior. All methods may touch the network and return
/// `StoreError::Fetch` on failure.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Handle for a comment by cid, not yet updating
    async fn get_comment(&self, cid: &str) -> StoreResult<Arc<dyn CommentClient>>;

    /// Handle for a subplebbit by address, not yet updating
    async fn get_subplebbit(&self, address: &str) -> StoreResult<Arc<dyn SubplebbitClient>>;

    /// Fetch one page of a pagination chain
    async fn get_page(&self, page_cid: &str, subplebbit_address: &str) -> StoreResult<Page>;

    /// Prepare a new comment publication
    async fn create_comment(&self, options: CommentOptions)
        -> StoreResult<Arc<dyn PublicationClient>>;

    /// Prepare a new vote publication
    async fn create_vote(&self, options: VoteOptions) -> StoreResult<Arc<dyn PublicationClient>>;

    /// Prepare a new comment edit publication
    async fn create_comment_edit(
        &self,
        options: CommentEditOptions,
    ) -> StoreResult<Arc<dyn PublicationClient>>;

    /// Edit a subplebbit over the publication path
    async fn create_subplebbit_edit(
        &self,
        options: SubplebbitEditOptions,
    ) -> StoreResult<Arc<dyn PublicationClient>>;

    /// Create a subplebbit owned by this node
    async fn create_subplebbit(&self, options: SubplebbitEditOptions) -> StoreResult<Subplebbit>;

    /// Delete a subplebbit owned by this node
    async fn delete_subplebbit(&self, address: &str) -> StoreResult<()>;

    /// Addresses of subplebbits owned by this node
    async fn list_subplebbits(&self) -> StoreResult<Vec<String>>;

    /// Generate a fresh signing key pair
    async fn create_signer(&self) -> StoreResult<Signer>;

    /// Raw passthrough for backend settings calls
    async fn rpc_call(&self, method: &str, params: Value) -> StoreResult<Value>;
}
