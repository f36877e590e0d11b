/// Store-wide change notifications
///
/// One broadcast channel fans these out to every interested component:
/// feeds recompute when a subplebbit changes, notification derivation
/// re-runs when replies or read state change. Events carry keys, never
/// payloads; consumers read current state from the owning store.
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A cached comment accepted a fresher snapshot
    CommentUpdated { cid: String },
    /// A cached subplebbit accepted a fresher snapshot
    SubplebbitUpdated { address: String },
    /// Account list, order or active account changed
    AccountsChanged,
    /// An account's authored comments changed (new, state, or cid)
    AccountCommentsChanged { account_id: String },
    /// An account's notification set or read state changed
    NotificationsChanged { account_id: String },
}

pub type EventSender = broadcast::Sender<StoreEvent>;
pub type EventReceiver = broadcast::Receiver<StoreEvent>;
