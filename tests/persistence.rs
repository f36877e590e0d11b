/// Durability across store restarts, on both storage backends
use plebbit_store::{
    Author, Comment, CommentOptions, MemoryStorage, MockClient, Page, Pages, SortType,
    SqliteStorage, Store, StoreConfig,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

async fn wait_until<T, F>(rx: &mut watch::Receiver<T>, mut check: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    loop {
        {
            let current = rx.borrow_and_update();
            if check(&current) {
                return current.clone();
            }
        }
        rx.changed().await.expect("snapshot channel closed");
    }
}

#[tokio::test]
async fn sqlite_round_trip_preserves_accounts_and_publications() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("store.db");
    let client = Arc::new(MockClient::new());
    client.set_challenges_enabled(false);

    let storage = Arc::new(SqliteStorage::open(&path).await.unwrap());
    let store = Store::open(StoreConfig::default(), client.clone(), storage)
        .await
        .unwrap();
    let accounts = store.accounts();
    accounts.create_account(Some("alice")).await.unwrap();
    let alice = accounts.account_by_name("alice").await.unwrap();
    accounts.subscribe(&alice.id, "memes.eth").await.unwrap();
    let mut handle = accounts
        .publish_comment(
            &alice.id,
            CommentOptions {
                subplebbit_address: "memes.eth".to_string(),
                content: Some("durable".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    handle.wait_terminal().await.unwrap();
    store.shutdown().await;
    drop(store);

    let storage = Arc::new(SqliteStorage::open(&path).await.unwrap());
    let store = Store::open(StoreConfig::default(), client, storage)
        .await
        .unwrap();
    let alice = store.accounts().account_by_name("alice").await.unwrap();
    assert_eq!(alice.subscriptions, vec!["memes.eth".to_string()]);
    let comments = store.accounts().account_comments(&alice.id).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].comment.cid.as_deref(), Some("durable cid"));
}

#[tokio::test]
async fn persisted_pages_short_circuit_refetching_after_restart() {
    let client = Arc::new(MockClient::new());
    let storage = Arc::new(MemoryStorage::new());

    let store = Store::open(StoreConfig::default(), client.clone(), storage.clone())
        .await
        .unwrap();
    let account = store.accounts().active_account().await.unwrap();
    let options = plebbit_store::FeedOptions {
        account_id: account.id.clone(),
        subplebbit_addresses: vec!["memes.eth".to_string()],
        sort: SortType::New,
        filter: None,
    };
    let mut rx = store.feeds().feed(&options).await.unwrap();
    wait_until(&mut rx, |s| s.window.len() == 25).await;
    assert_eq!(client.page_get_count("memes.eth new page cid 1").await, 1);
    store.shutdown().await;
    drop(store);

    let store = Store::open(StoreConfig::default(), client.clone(), storage)
        .await
        .unwrap();
    let mut rx = store.feeds().feed(&options).await.unwrap();
    wait_until(&mut rx, |s| s.window.len() == 25).await;
    assert_eq!(client.page_get_count("memes.eth new page cid 1").await, 1);
}

fn fixture_reply(cid: &str, timestamp: u64) -> Comment {
    Comment {
        cid: Some(cid.to_string()),
        parent_cid: Some("hello cid".to_string()),
        post_cid: Some("hello cid".to_string()),
        subplebbit_address: "memes.eth".to_string(),
        author: Author {
            address: format!("{} author", cid),
            display_name: None,
        },
        timestamp,
        content: Some(format!("{} content", cid)),
        ..Default::default()
    }
}

async fn hydrate_replies(store: &Store) {
    let mut entry = store
        .cache()
        .get_or_create_comment("hello cid")
        .await
        .unwrap();
    while entry.borrow().comment.replies.is_empty() {
        entry.changed().await.unwrap();
    }
}

#[tokio::test]
async fn notifications_read_state_survives_reopen() {
    let client = Arc::new(MockClient::new());
    client.set_challenges_enabled(false);
    let storage = Arc::new(MemoryStorage::new());

    let store = Store::open(StoreConfig::default(), client.clone(), storage.clone())
        .await
        .unwrap();
    let account = store.accounts().active_account().await.unwrap();
    let mut handle = store
        .accounts()
        .publish_comment(
            &account.id,
            CommentOptions {
                subplebbit_address: "memes.eth".to_string(),
                content: Some("hello".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    handle.wait_terminal().await.unwrap();

    client
        .add_comment(Comment {
            cid: Some("hello cid".to_string()),
            subplebbit_address: "memes.eth".to_string(),
            author: account.author.clone(),
            timestamp: 1,
            content: Some("hello".to_string()),
            updated_at: Some(10_000),
            replies: Pages {
                pages: HashMap::from([(
                    SortType::New,
                    Page {
                        comments: vec![
                            fixture_reply("n1", 300),
                            fixture_reply("n2", 200),
                            fixture_reply("n3", 100),
                        ],
                        next_cid: None,
                    },
                )]),
                page_cids: HashMap::new(),
            },
            ..Default::default()
        })
        .await;
    hydrate_replies(&store).await;

    let list = store.notifications().notifications(&account.id).await.unwrap();
    assert_eq!(list.len(), 3);
    assert!(list.iter().all(|n| !n.marked_as_read));
    assert_eq!(
        store.notifications().unread_count(&account.id).await.unwrap(),
        3
    );

    store
        .notifications()
        .mark_notifications_read(&account.id)
        .await
        .unwrap();
    assert_eq!(
        store.notifications().unread_count(&account.id).await.unwrap(),
        0
    );
    store.shutdown().await;
    drop(store);

    let store = Store::open(StoreConfig::default(), client, storage)
        .await
        .unwrap();
    hydrate_replies(&store).await;
    let list = store.notifications().notifications(&account.id).await.unwrap();
    assert_eq!(list.len(), 3);
    assert!(list.iter().all(|n| n.marked_as_read));
    assert_eq!(
        store.notifications().unread_count(&account.id).await.unwrap(),
        0
    );
}
