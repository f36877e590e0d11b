/// Protocol and account data model
///
/// Plain serde types shared across the store: content objects fetched from
/// the network (comments, subplebbits, pages) and locally-authored account
/// records. Fields crossing the protocol boundary are camelCase.
use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Current wall-clock time in whole seconds (protocol timestamp unit)
pub fn now_timestamp() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Comment or post author
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Signing key material owned by an account
///
/// Key generation and signing are delegated to the protocol client; the
/// store only carries the material around and strips nothing on export
/// (it is already plain data).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signer {
    /// Private key, base64-encoded
    pub private_key: String,
    /// Address derived from the key by the client
    pub address: String,
    #[serde(rename = "type", default = "default_signer_type")]
    pub signer_type: String,
}

fn default_signer_type() -> String {
    "ed25519".to_string()
}

/// Sort orders understood by the feed and replies engines
///
/// Parsing an unknown sort is a validation error; the set is closed.
/// Flat variants exist for comment replies only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortType {
    Hot,
    New,
    Old,
    Active,
    TopAll,
    ControversialAll,
    Best,
    NewFlat,
    OldFlat,
}

impl SortType {
    /// All known sorts, in fallback-preference order
    pub const ALL: [SortType; 9] = [
        SortType::Hot,
        SortType::New,
        SortType::Old,
        SortType::Active,
        SortType::TopAll,
        SortType::ControversialAll,
        SortType::Best,
        SortType::NewFlat,
        SortType::OldFlat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortType::Hot => "hot",
            SortType::New => "new",
            SortType::Old => "old",
            SortType::Active => "active",
            SortType::TopAll => "topAll",
            SortType::ControversialAll => "controversialAll",
            SortType::Best => "best",
            SortType::NewFlat => "newFlat",
            SortType::OldFlat => "oldFlat",
        }
    }

    /// Whether this sort inlines nested reply trees into one flat sequence
    pub fn is_flat(&self) -> bool {
        matches!(self, SortType::NewFlat | SortType::OldFlat)
    }
}

impl fmt::Display for SortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortType {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        SortType::ALL
            .into_iter()
            .find(|sort| sort.as_str() == s)
            .ok_or_else(|| StoreError::Validation(format!("unknown sort type '{}'", s)))
    }
}

/// A batch of comments plus the continuation pointer of its chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub comments: Vec<Comment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cid: Option<String>,
}

/// Paginated listing owned by a subplebbit (posts) or a comment (replies)
///
/// `pages` holds preloaded first pages embedded in the owner's snapshot;
/// `page_cids` holds the head pointers of chains that require a fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pages {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pages: HashMap<SortType, Page>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub page_cids: HashMap<SortType, String>,
}

impl Pages {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.page_cids.is_empty()
    }
}

/// A piece of content: a post (no parent) or a reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub subplebbit_address: String,
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    /// Freshness timestamp: larger wins when the same cid is seen twice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upvote_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downvote_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reply_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Pages::is_empty")]
    pub replies: Pages,
}

impl Comment {
    pub fn is_reply(&self) -> bool {
        self.parent_cid.is_some()
    }

    /// Upvotes minus downvotes
    pub fn score(&self) -> i64 {
        self.upvote_count.unwrap_or(0) as i64 - self.downvote_count.unwrap_or(0) as i64
    }

    /// Removed by a mod or deleted by its author; excluded from feeds
    pub fn is_hidden(&self) -> bool {
        self.deleted.unwrap_or(false) || self.removed.unwrap_or(false)
    }
}

/// A content community, identified by its address
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subplebbit {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Pages::is_empty")]
    pub posts: Pages,
}

/// Live-sync state of an updating content object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatingState {
    #[default]
    Stopped,
    Fetching,
    Succeeded,
    Failed,
}

/// Lifecycle of an outgoing publication, driven by client events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishingState {
    #[default]
    Initializing,
    Ready,
    Publishing,
    WaitingChallengeAnswers,
    PublishingChallengeAnswer,
    WaitingChallengeVerification,
    Succeeded,
    Failed,
}

impl PublishingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PublishingState::Succeeded | PublishingState::Failed)
    }
}

/// Terminal summary of an account publication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountPublicationState {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

/// A challenge request sent by the destination community before accepting
/// a publication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub challenges: Vec<ChallengeItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeItem {
    pub challenge: String,
    #[serde(rename = "type")]
    pub challenge_type: String,
}

/// Outcome of the challenge exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeVerification {
    pub challenge_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Canonical publication as accepted by the community, cid attached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication: Option<Value>,
}

impl ChallengeVerification {
    /// Cid of the accepted publication, if the verification carried one
    pub fn publication_cid(&self) -> Option<String> {
        self.publication
            .as_ref()
            .and_then(|p| p.get("cid"))
            .and_then(|c| c.as_str())
            .map(|c| c.to_string())
    }
}

/// Karma breakdown derived from an account's publications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karma {
    pub score: i64,
    pub upvote_count: u64,
    pub downvote_count: u64,
    pub post_score: i64,
    pub post_upvote_count: u64,
    pub post_downvote_count: u64,
    pub reply_score: i64,
    pub reply_upvote_count: u64,
    pub reply_downvote_count: u64,
}

/// A local identity under which content is authored and viewed
///
/// Identity is `id` (immutable, regenerated on import); `name` is a mutable
/// unique-per-store label. `karma` and `unread_notification_count` are
/// derived on read and carry no authority when imported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    pub author: Author,
    pub signer: Signer,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub plebbit_options: Value,
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub blocked_addresses: BTreeSet<String>,
    #[serde(default)]
    pub blocked_cids: BTreeSet<String>,
    #[serde(default)]
    pub karma: Karma,
    #[serde(default)]
    pub unread_notification_count: u64,
}

/// A locally-authored comment, tracked from submission to verification
///
/// `index` is the append-only position in the owning account's comment
/// list, immutable once assigned. `cid` arrives asynchronously after a
/// successful challenge verification or via page reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountComment {
    #[serde(flatten)]
    pub comment: Comment,
    pub index: u64,
    pub account_id: String,
    #[serde(default)]
    pub state: AccountPublicationState,
    #[serde(default)]
    pub publishing_state: PublishingState,
}

/// A locally-authored vote
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountVote {
    pub index: u64,
    pub account_id: String,
    pub comment_cid: String,
    pub subplebbit_address: String,
    /// 1, 0 (retract) or -1
    pub vote: i8,
    pub timestamp: u64,
    #[serde(default)]
    pub state: AccountPublicationState,
    #[serde(default)]
    pub publishing_state: PublishingState,
}

/// A locally-authored comment edit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEdit {
    pub index: u64,
    pub account_id: String,
    pub comment_cid: String,
    pub subplebbit_address: String,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoiler: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub state: AccountPublicationState,
    #[serde(default)]
    pub publishing_state: PublishingState,
}

/// A reply to one of the account's comments, annotated with read state
///
/// Derived, never stored as an entity; only the set of read cids persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(flatten)]
    pub comment: Comment,
    pub marked_as_read: bool,
}

/// Options for publishing a new comment or reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentOptions {
    pub subplebbit_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_cid: Option<String>,
    /// Defaults to now; filled by the account store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Filled from the publishing account
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<Signer>,
}

/// Options for publishing a vote
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteOptions {
    pub subplebbit_address: String,
    pub comment_cid: String,
    pub vote: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<Signer>,
}

/// Options for publishing a comment edit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentEditOptions {
    pub subplebbit_address: String,
    pub comment_cid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoiler: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<Signer>,
}

/// Options for editing a subplebbit the account owns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubplebbitEditOptions {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<Signer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_type_parse() {
        assert_eq!("topAll".parse::<SortType>().unwrap(), SortType::TopAll);
        assert_eq!("newFlat".parse::<SortType>().unwrap(), SortType::NewFlat);
        assert!("bestest".parse::<SortType>().is_err());
    }

    #[test]
    fn test_comment_serde_camel_case() {
        let comment = Comment {
            cid: Some("cid 1".to_string()),
            subplebbit_address: "sub.eth".to_string(),
            timestamp: 100,
            upvote_count: Some(3),
            ..Default::default()
        };

        let json = serde_json::to_value(&comment).unwrap();
        assert_eq!(json["subplebbitAddress"], "sub.eth");
        assert_eq!(json["upvoteCount"], 3);
        assert!(json.get("parentCid").is_none());

        let back: Comment = serde_json::from_value(json).unwrap();
        assert_eq!(back.cid.as_deref(), Some("cid 1"));
        assert_eq!(back.score(), 3);
    }

    #[test]
    fn test_account_comment_flattens() {
        let account_comment = AccountComment {
            comment: Comment {
                subplebbit_address: "sub.eth".to_string(),
                content: Some("content 1".to_string()),
                timestamp: 42,
                ..Default::default()
            },
            index: 0,
            account_id: "a1".to_string(),
            state: AccountPublicationState::Pending,
            publishing_state: PublishingState::Publishing,
        };

        let json = serde_json::to_value(&account_comment).unwrap();
        assert_eq!(json["content"], "content 1");
        assert_eq!(json["index"], 0);
        assert_eq!(json["state"], "pending");
        assert_eq!(json["publishingState"], "publishing");
    }

    #[test]
    fn test_challenge_verification_cid() {
        let verification = ChallengeVerification {
            challenge_success: true,
            reason: None,
            publication: Some(serde_json::json!({"cid": "content 1 cid"})),
        };
        assert_eq!(
            verification.publication_cid().as_deref(),
            Some("content 1 cid")
        );

        let empty = ChallengeVerification::default();
        assert_eq!(empty.publication_cid(), None);
    }

    #[test]
    fn test_hidden_comments() {
        let mut comment = Comment::default();
        assert!(!comment.is_hidden());
        comment.removed = Some(true);
        assert!(comment.is_hidden());
    }
}
