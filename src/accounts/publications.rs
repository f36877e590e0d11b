/// Publication lifecycle
///
/// Publishing is optimistic: the account record is appended and persisted
/// before the network round trip begins, so authored content survives a
/// crash mid-publish. A spawned driver consumes the publication client's
/// events and patches the record through to its terminal state; the
/// caller observes progress through a watch-backed handle and answers
/// challenges through the same handle.

use super::{AccountsState, AccountsStore};
use crate::client::{PublicationClient, PublishEvent};
use crate::error::{RecordedError, StoreError, StoreResult};
use crate::events::{EventSender, StoreEvent};
use crate::models::{
    now_timestamp, Account, AccountComment, AccountEdit, AccountPublicationState, AccountVote,
    Challenge, ChallengeVerification, Comment, CommentEditOptions, CommentOptions, PublishingState,
    SubplebbitEditOptions, VoteOptions,
};
use crate::storage::{partitions, set_typed, Storage};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Observable state of an in-flight publication
#[derive(Debug, Clone, Default)]
pub struct PublicationStatus {
    pub publishing_state: PublishingState,
    /// Challenge waiting to be answered, if the community issued one
    pub challenge: Option<Challenge>,
    pub verification: Option<ChallengeVerification>,
    pub errors: Vec<RecordedError>,
}

/// Handle to an in-flight publication
///
/// Dropping the handle does not cancel the publication; the driver keeps
/// patching the account record until a terminal state is reached.
pub struct PublicationHandle {
    /// Position of the optimistic account record, when one was written
    pub index: Option<u64>,
    client: Arc<dyn PublicationClient>,
    status: watch::Receiver<PublicationStatus>,
}

impl PublicationHandle {
    pub fn status(&self) -> PublicationStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublicationStatus> {
        self.status.clone()
    }

    /// Wait for the next status change
    pub async fn changed(&mut self) -> StoreResult<PublicationStatus> {
        self.status
            .changed()
            .await
            .map_err(|_| StoreError::Internal("publication driver stopped".to_string()))?;
        Ok(self.status.borrow().clone())
    }

    /// Wait until the publication succeeds or fails
    pub async fn wait_terminal(&mut self) -> StoreResult<PublicationStatus> {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current.publishing_state.is_terminal() {
                return Ok(current);
            }
            self.status
                .changed()
                .await
                .map_err(|_| StoreError::Internal("publication driver stopped".to_string()))?;
        }
    }

    /// Answer the pending challenge
    pub async fn publish_challenge_answers(&self, answers: Vec<String>) -> StoreResult<()> {
        self.client.publish_challenge_answers(answers).await
    }
}

impl AccountsStore {
    /// Publish a comment or reply as the given account
    ///
    /// The record is appended (and persisted) before publishing starts;
    /// its cid arrives with a successful challenge verification or later
    /// through page reconciliation.
    pub async fn publish_comment(
        &self,
        account_id: &str,
        mut options: CommentOptions,
    ) -> StoreResult<PublicationHandle> {
        let account = self.publishing_account(account_id).await?;
        if options.subplebbit_address.is_empty() {
            return Err(StoreError::Validation(
                "publication needs a subplebbit address".to_string(),
            ));
        }
        if options.content.is_none() && options.title.is_none() && options.link.is_none() {
            return Err(StoreError::Validation(
                "comment needs content, a title or a link".to_string(),
            ));
        }
        let timestamp = *options.timestamp.get_or_insert_with(now_timestamp);
        let author = options
            .author
            .get_or_insert_with(|| account.author.clone())
            .clone();
        options.signer.get_or_insert_with(|| account.signer.clone());

        let comment = Comment {
            subplebbit_address: options.subplebbit_address.clone(),
            author,
            timestamp,
            content: options.content.clone(),
            title: options.title.clone(),
            link: options.link.clone(),
            parent_cid: options.parent_cid.clone(),
            post_cid: options.post_cid.clone(),
            ..Default::default()
        };
        let index = self.append_comment_record(account_id, comment).await?;
        let target = RecordTarget::Comment {
            account_id: account_id.to_string(),
            index,
        };
        self.start_publication(self.client.create_comment(options).await, target, Some(index))
            .await
    }

    /// Publish a vote as the given account
    pub async fn publish_vote(
        &self,
        account_id: &str,
        mut options: VoteOptions,
    ) -> StoreResult<PublicationHandle> {
        let account = self.publishing_account(account_id).await?;
        if options.comment_cid.is_empty() {
            return Err(StoreError::Validation(
                "vote needs a comment cid".to_string(),
            ));
        }
        if !matches!(options.vote, -1 | 0 | 1) {
            return Err(StoreError::Validation(format!(
                "vote must be -1, 0 or 1, got {}",
                options.vote
            )));
        }
        let timestamp = *options.timestamp.get_or_insert_with(now_timestamp);
        options.author.get_or_insert_with(|| account.author.clone());
        options.signer.get_or_insert_with(|| account.signer.clone());

        let record = AccountVote {
            index: 0,
            account_id: account_id.to_string(),
            comment_cid: options.comment_cid.clone(),
            subplebbit_address: options.subplebbit_address.clone(),
            vote: options.vote,
            timestamp,
            state: AccountPublicationState::Pending,
            publishing_state: PublishingState::Initializing,
        };
        let index = self.append_vote_record(account_id, record).await?;
        let target = RecordTarget::Vote {
            account_id: account_id.to_string(),
            index,
        };
        self.start_publication(self.client.create_vote(options).await, target, Some(index))
            .await
    }

    /// Publish an edit of one of the account's comments
    pub async fn publish_comment_edit(
        &self,
        account_id: &str,
        mut options: CommentEditOptions,
    ) -> StoreResult<PublicationHandle> {
        let account = self.publishing_account(account_id).await?;
        if options.comment_cid.is_empty() {
            return Err(StoreError::Validation(
                "comment edit needs a comment cid".to_string(),
            ));
        }
        if options.content.is_none()
            && options.deleted.is_none()
            && options.spoiler.is_none()
            && options.reason.is_none()
        {
            return Err(StoreError::Validation(
                "comment edit changes nothing".to_string(),
            ));
        }
        let timestamp = *options.timestamp.get_or_insert_with(now_timestamp);
        options.author.get_or_insert_with(|| account.author.clone());
        options.signer.get_or_insert_with(|| account.signer.clone());

        let record = AccountEdit {
            index: 0,
            account_id: account_id.to_string(),
            comment_cid: options.comment_cid.clone(),
            subplebbit_address: options.subplebbit_address.clone(),
            timestamp,
            content: options.content.clone(),
            deleted: options.deleted,
            spoiler: options.spoiler,
            reason: options.reason.clone(),
            state: AccountPublicationState::Pending,
            publishing_state: PublishingState::Initializing,
        };
        let index = self.append_edit_record(account_id, record).await?;
        let target = RecordTarget::Edit {
            account_id: account_id.to_string(),
            index,
        };
        self.start_publication(
            self.client.create_comment_edit(options).await,
            target,
            Some(index),
        )
        .await
    }

    /// Publish an edit of a subplebbit the account owns
    ///
    /// No account record is kept; the result shows up in the subplebbit
    /// itself on its next update.
    pub async fn publish_subplebbit_edit(
        &self,
        account_id: &str,
        mut options: SubplebbitEditOptions,
    ) -> StoreResult<PublicationHandle> {
        let account = self.publishing_account(account_id).await?;
        if options.address.is_empty() {
            return Err(StoreError::Validation(
                "subplebbit edit needs an address".to_string(),
            ));
        }
        options.signer.get_or_insert_with(|| account.signer.clone());
        self.start_publication(
            self.client.create_subplebbit_edit(options).await,
            RecordTarget::None,
            None,
        )
        .await
    }

    /// Submission fails fast while no account is resolved; an empty id
    /// means initialization has not finished
    async fn publishing_account(&self, account_id: &str) -> StoreResult<Account> {
        if account_id.is_empty() {
            return Err(StoreError::NotReady(
                "no account is loaded yet".to_string(),
            ));
        }
        self.account_by_id(account_id).await
    }

    async fn start_publication(
        &self,
        created: StoreResult<Arc<dyn PublicationClient>>,
        target: RecordTarget,
        index: Option<u64>,
    ) -> StoreResult<PublicationHandle> {
        let (inner, storage, events, _) = self.parts();
        let publication = match created {
            Ok(publication) => publication,
            Err(error) => {
                apply_patch(&inner, &storage, &events, &target, &RecordPatch::Failed).await;
                return Err(error);
            }
        };

        let (status_tx, status_rx) = watch::channel(PublicationStatus::default());
        let publish_events = publication.subscribe();
        let driver = spawn_publication_driver(
            inner.clone(),
            storage.clone(),
            events.clone(),
            target.clone(),
            status_tx,
            publish_events,
        );
        self.push_task(driver).await;

        if let Err(error) = publication.publish().await {
            apply_patch(&inner, &storage, &events, &target, &RecordPatch::Failed).await;
            return Err(error);
        }
        Ok(PublicationHandle {
            index,
            client: publication,
            status: status_rx,
        })
    }

    async fn append_comment_record(
        &self,
        account_id: &str,
        comment: Comment,
    ) -> StoreResult<u64> {
        let (snapshot, index) = {
            let mut state = self.inner.write().await;
            let records = state.comments.entry(account_id.to_string()).or_default();
            let index = records.len() as u64;
            records.push(AccountComment {
                comment,
                index,
                account_id: account_id.to_string(),
                state: AccountPublicationState::Pending,
                publishing_state: PublishingState::Initializing,
            });
            (records.clone(), index)
        };
        set_typed(
            self.storage.as_ref(),
            partitions::ACCOUNT_COMMENTS,
            account_id,
            &snapshot,
        )
        .await?;
        let _ = self.events.send(StoreEvent::AccountCommentsChanged {
            account_id: account_id.to_string(),
        });
        Ok(index)
    }

    async fn append_vote_record(&self, account_id: &str, record: AccountVote) -> StoreResult<u64> {
        let (snapshot, index) = {
            let mut state = self.inner.write().await;
            let records = state.votes.entry(account_id.to_string()).or_default();
            let index = records.len() as u64;
            let mut record = record;
            record.index = index;
            records.push(record);
            (records.clone(), index)
        };
        set_typed(
            self.storage.as_ref(),
            partitions::ACCOUNT_VOTES,
            account_id,
            &snapshot,
        )
        .await?;
        let _ = self.events.send(StoreEvent::AccountsChanged);
        Ok(index)
    }

    async fn append_edit_record(&self, account_id: &str, record: AccountEdit) -> StoreResult<u64> {
        let (snapshot, index) = {
            let mut state = self.inner.write().await;
            let records = state.edits.entry(account_id.to_string()).or_default();
            let index = records.len() as u64;
            let mut record = record;
            record.index = index;
            records.push(record);
            (records.clone(), index)
        };
        set_typed(
            self.storage.as_ref(),
            partitions::ACCOUNT_EDITS,
            account_id,
            &snapshot,
        )
        .await?;
        let _ = self.events.send(StoreEvent::AccountsChanged);
        Ok(index)
    }
}

#[derive(Clone)]
enum RecordTarget {
    Comment { account_id: String, index: u64 },
    Vote { account_id: String, index: u64 },
    Edit { account_id: String, index: u64 },
    /// Publication with no account record (subplebbit edits)
    None,
}

enum RecordPatch {
    Publishing(PublishingState),
    Verified { success: bool, cid: Option<String> },
    Failed,
}

trait PublicationRecord {
    fn index(&self) -> u64;
    fn set_publishing_state(&mut self, state: PublishingState);
    fn set_state(&mut self, state: AccountPublicationState);
    fn attach_cid(&mut self, _cid: String) {}
}

impl PublicationRecord for AccountComment {
    fn index(&self) -> u64 {
        self.index
    }
    fn set_publishing_state(&mut self, state: PublishingState) {
        self.publishing_state = state;
    }
    fn set_state(&mut self, state: AccountPublicationState) {
        self.state = state;
    }
    fn attach_cid(&mut self, cid: String) {
        self.comment.cid = Some(cid);
    }
}

impl PublicationRecord for AccountVote {
    fn index(&self) -> u64 {
        self.index
    }
    fn set_publishing_state(&mut self, state: PublishingState) {
        self.publishing_state = state;
    }
    fn set_state(&mut self, state: AccountPublicationState) {
        self.state = state;
    }
}

impl PublicationRecord for AccountEdit {
    fn index(&self) -> u64 {
        self.index
    }
    fn set_publishing_state(&mut self, state: PublishingState) {
        self.publishing_state = state;
    }
    fn set_state(&mut self, state: AccountPublicationState) {
        self.state = state;
    }
}

fn apply_to_record<R: PublicationRecord>(record: &mut R, patch: &RecordPatch) {
    match patch {
        RecordPatch::Publishing(state) => {
            record.set_publishing_state(*state);
            match state {
                PublishingState::Succeeded => record.set_state(AccountPublicationState::Succeeded),
                PublishingState::Failed => record.set_state(AccountPublicationState::Failed),
                _ => {}
            }
        }
        RecordPatch::Verified { success, cid } => {
            if *success {
                record.set_publishing_state(PublishingState::Succeeded);
                record.set_state(AccountPublicationState::Succeeded);
                if let Some(cid) = cid {
                    record.attach_cid(cid.clone());
                }
            } else {
                record.set_publishing_state(PublishingState::Failed);
                record.set_state(AccountPublicationState::Failed);
            }
        }
        RecordPatch::Failed => {
            record.set_publishing_state(PublishingState::Failed);
            record.set_state(AccountPublicationState::Failed);
        }
    }
}

async fn apply_patch(
    inner: &Arc<RwLock<AccountsState>>,
    storage: &Arc<dyn Storage>,
    events: &EventSender,
    target: &RecordTarget,
    patch: &RecordPatch,
) {
    match target {
        RecordTarget::Comment { account_id, index } => {
            patch_record(
                inner,
                storage,
                partitions::ACCOUNT_COMMENTS,
                account_id,
                *index,
                patch,
                |state: &mut AccountsState| state.comments.get_mut(account_id),
            )
            .await;
            let _ = events.send(StoreEvent::AccountCommentsChanged {
                account_id: account_id.clone(),
            });
        }
        RecordTarget::Vote { account_id, index } => {
            patch_record(
                inner,
                storage,
                partitions::ACCOUNT_VOTES,
                account_id,
                *index,
                patch,
                |state: &mut AccountsState| state.votes.get_mut(account_id),
            )
            .await;
            let _ = events.send(StoreEvent::AccountsChanged);
        }
        RecordTarget::Edit { account_id, index } => {
            patch_record(
                inner,
                storage,
                partitions::ACCOUNT_EDITS,
                account_id,
                *index,
                patch,
                |state: &mut AccountsState| state.edits.get_mut(account_id),
            )
            .await;
            let _ = events.send(StoreEvent::AccountsChanged);
        }
        RecordTarget::None => {}
    }
}

async fn patch_record<R, F>(
    inner: &Arc<RwLock<AccountsState>>,
    storage: &Arc<dyn Storage>,
    partition: &'static str,
    account_id: &str,
    index: u64,
    patch: &RecordPatch,
    select: F,
) where
    R: PublicationRecord + Clone + Serialize,
    F: FnOnce(&mut AccountsState) -> Option<&mut Vec<R>>,
{
    let snapshot = {
        let mut state = inner.write().await;
        let Some(records) = select(&mut state) else {
            return;
        };
        let Some(record) = records.iter_mut().find(|record| record.index() == index) else {
            return;
        };
        apply_to_record(record, patch);
        records.clone()
    };
    if let Err(error) = set_typed(storage.as_ref(), partition, account_id, &snapshot).await {
        warn!("Failed to persist publication record: {}", error);
    }
}

/// Consume publication events, mirroring them into the account record
/// and the status channel until a terminal state
fn spawn_publication_driver(
    inner: Arc<RwLock<AccountsState>>,
    storage: Arc<dyn Storage>,
    events: EventSender,
    target: RecordTarget,
    status: watch::Sender<PublicationStatus>,
    mut publish_events: broadcast::Receiver<PublishEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match publish_events.recv().await {
                Ok(PublishEvent::StateChange(state)) => {
                    apply_patch(
                        &inner,
                        &storage,
                        &events,
                        &target,
                        &RecordPatch::Publishing(state),
                    )
                    .await;
                    status.send_modify(|current| current.publishing_state = state);
                    if state.is_terminal() {
                        break;
                    }
                }
                Ok(PublishEvent::Challenge(challenge)) => {
                    debug!("Publication received a challenge");
                    status.send_modify(move |current| current.challenge = Some(challenge));
                }
                Ok(PublishEvent::ChallengeVerification(verification)) => {
                    apply_patch(
                        &inner,
                        &storage,
                        &events,
                        &target,
                        &RecordPatch::Verified {
                            success: verification.challenge_success,
                            cid: verification.publication_cid(),
                        },
                    )
                    .await;
                    status.send_modify(move |current| current.verification = Some(verification));
                }
                Ok(PublishEvent::Error(message)) => {
                    status.send_modify(move |current| {
                        current.errors.push(RecordedError::new(message))
                    });
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Publication event stream lagged by {}", count);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// How a comment relates to the account's edits of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditedCommentState {
    Unedited,
    /// Edit published but not yet visible in the comment
    Pending,
    /// Latest edit is reflected in the comment
    Succeeded,
    /// Latest edit failed its challenge or never took effect
    Failed,
}

/// Classify a comment against the account's edits of it
///
/// The comment reflects an edit once it has updated past the edit's
/// timestamp with the edited fields visible; until then the edit is
/// pending. A comment that updated past the edit without showing it
/// means the edit was dropped. Fields the comment cannot carry
/// (spoiler, reason) are trusted once the update timestamp passes.
pub fn edited_comment_state(comment: &Comment, edits: &[AccountEdit]) -> EditedCommentState {
    let Some(cid) = comment.cid.as_deref() else {
        return EditedCommentState::Unedited;
    };
    let latest = edits
        .iter()
        .filter(|edit| edit.comment_cid == cid)
        .max_by_key(|edit| (edit.timestamp, edit.index));
    let Some(latest) = latest else {
        return EditedCommentState::Unedited;
    };
    if latest.state == AccountPublicationState::Failed {
        return EditedCommentState::Failed;
    }
    match comment.updated_at {
        Some(updated_at) if updated_at >= latest.timestamp => {
            if edit_reflected(comment, latest) {
                EditedCommentState::Succeeded
            } else {
                EditedCommentState::Failed
            }
        }
        _ => EditedCommentState::Pending,
    }
}

fn edit_reflected(comment: &Comment, edit: &AccountEdit) -> bool {
    if let Some(content) = &edit.content {
        if comment.content.as_ref() != Some(content) {
            return false;
        }
    }
    if let Some(deleted) = edit.deleted {
        if comment.deleted != Some(deleted) {
            return false;
        }
    }
    true
}
