/// Feed and reply pagination scenarios over a full store
use plebbit_store::{
    Author, Comment, CommentOptions, FeedOptions, MemoryStorage, MockClient, Page, Pages,
    RepliesOptions, SortType, Store, StoreConfig, StoreError, Subplebbit,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

async fn open_with_client(client: Arc<MockClient>) -> Store {
    Store::open(
        StoreConfig::default(),
        client,
        Arc::new(MemoryStorage::new()),
    )
    .await
    .expect("store should open")
}

async fn active_id(store: &Store) -> String {
    store
        .accounts()
        .active_account()
        .await
        .expect("store has a default account")
        .id
}

fn new_feed(account_id: &str, address: &str) -> FeedOptions {
    FeedOptions {
        account_id: account_id.to_string(),
        subplebbit_addresses: vec![address.to_string()],
        sort: SortType::New,
        filter: None,
    }
}

/// Wait until a watched snapshot satisfies the condition
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
async fn scenario_c_feed_paginates_and_fetches_each_page_once() {
    let client = Arc::new(MockClient::new());
    let store = open_with_client(client.clone()).await;
    let options = new_feed(&active_id(&store).await, "memes.eth");

    let mut rx = store.feeds().feed(&options).await.unwrap();
    let snapshot = wait_until(&mut rx, |s| s.window.len() == 25).await;
    assert_eq!(snapshot.window[0].timestamp, 100);
    assert_eq!(snapshot.window[24].timestamp, 76);
    assert_eq!(snapshot.buffered_count, 75);
    assert!(snapshot.has_more);

    store.feeds().load_more(&options).await.unwrap();
    let snapshot = wait_until(&mut rx, |s| s.window.len() == 50).await;
    assert_eq!(snapshot.window[25].timestamp, 75);
    assert_eq!(snapshot.window[49].timestamp, 51);

    store.feeds().load_more(&options).await.unwrap();
    let snapshot = wait_until(&mut rx, |s| s.window.len() == 75).await;
    assert_eq!(snapshot.window[74].timestamp, 26);

    // the drained buffer is topped back up from the second page chain
    wait_until(&mut rx, |s| s.buffered_count >= 100).await;

    store.feeds().load_more(&options).await.unwrap();
    let snapshot = wait_until(&mut rx, |s| s.window.len() == 100).await;
    assert_eq!(snapshot.window[75].timestamp, 200);
    assert_eq!(snapshot.window[99].timestamp, 176);
    assert!(snapshot.has_more);

    assert_eq!(client.page_get_count("memes.eth new page cid 1").await, 1);
    assert_eq!(client.page_get_count("memes.eth new page cid 2").await, 1);
    assert_eq!(client.subplebbit_get_count("memes.eth").await, 1);
}

#[tokio::test]
async fn scenario_d_blocking_an_author_shrinks_the_buffer_without_refetching() {
    let client = Arc::new(MockClient::new());
    let store = open_with_client(client.clone()).await;
    let account_id = active_id(&store).await;
    let options = new_feed(&account_id, "memes.eth");

    let mut rx = store.feeds().feed(&options).await.unwrap();
    wait_until(&mut rx, |s| s.window.len() == 25 && s.buffered_count == 75).await;

    // the blocked author's post sits in the buffer, not the window
    store
        .accounts()
        .block_address(&account_id, "author address 60")
        .await
        .unwrap();
    let snapshot = wait_until(&mut rx, |s| s.buffered_count == 74).await;
    assert_eq!(snapshot.window.len(), 25);
    assert_eq!(client.page_get_count("memes.eth new page cid 1").await, 1);

    store
        .accounts()
        .unblock_address(&account_id, "author address 60")
        .await
        .unwrap();
    let snapshot = wait_until(&mut rx, |s| s.buffered_count == 75).await;
    assert_eq!(snapshot.window.len(), 25);
    assert_eq!(client.page_get_count("memes.eth new page cid 1").await, 1);
}

#[tokio::test]
async fn load_more_before_first_delivery_is_rejected() {
    let client = Arc::new(MockClient::new());
    client
        .add_subplebbit(Subplebbit {
            address: "empty.eth".to_string(),
            updated_at: Some(1),
            ..Default::default()
        })
        .await;
    let store = open_with_client(client).await;
    let options = new_feed(&active_id(&store).await, "empty.eth");

    // a listing without pages can never deliver the first window
    let _rx = store.feeds().feed(&options).await.unwrap();
    let err = store.feeds().load_more(&options).await.unwrap_err();
    assert!(matches!(err, StoreError::PendingOperation(_)));
}

#[tokio::test]
async fn transient_page_failure_is_recorded_and_retried() {
    let client = Arc::new(MockClient::new());
    let store = open_with_client(client.clone()).await;
    let options = new_feed(&active_id(&store).await, "memes.eth");

    let mut rx = store.feeds().feed(&options).await.unwrap();
    wait_until(&mut rx, |s| s.window.len() == 25).await;
    store.feeds().load_more(&options).await.unwrap();
    wait_until(&mut rx, |s| s.window.len() == 50).await;

    // the next buffer top-up hits the injected failure
    client.set_fail_next_page("page service hiccup").await;
    store.feeds().load_more(&options).await.unwrap();
    let snapshot = wait_until(&mut rx, |s| !s.errors.is_empty()).await;
    assert_eq!(snapshot.window.len(), 75);
    assert!(snapshot.has_more);

    // the source stays retryable: the following advance recovers
    store.feeds().load_more(&options).await.unwrap();
    let snapshot = wait_until(&mut rx, |s| s.window.len() == 100).await;
    assert!(!snapshot.errors.is_empty());
    wait_until(&mut rx, |s| s.buffered_count == 100).await;
    assert_eq!(client.page_get_count("memes.eth new page cid 2").await, 2);
}

#[tokio::test]
async fn exhausted_feed_reports_no_more_data() {
    let client = Arc::new(MockClient::new());
    client.set_posts_per_page(10);
    client.set_pages_per_chain(1);
    let store = open_with_client(client).await;
    let options = new_feed(&active_id(&store).await, "tiny.eth");

    let mut rx = store.feeds().feed(&options).await.unwrap();
    let snapshot = wait_until(&mut rx, |s| s.window.len() == 10).await;
    assert!(!snapshot.has_more);
    assert_eq!(snapshot.window[0].timestamp, 10);
    assert_eq!(snapshot.window[9].timestamp, 1);
    assert_eq!(snapshot.buffered_count, 0);

    // advancing past the end delivers nothing and stays settled
    store.feeds().load_more(&options).await.unwrap();
    let snapshot = store.feeds().snapshot(&options).await.unwrap().unwrap();
    assert_eq!(snapshot.window.len(), 10);
    assert!(!snapshot.has_more);
}

#[tokio::test]
async fn load_more_is_accepted_once_growth_is_observed() {
    let client = Arc::new(MockClient::new());
    let store = open_with_client(client).await;
    let options = new_feed(&active_id(&store).await, "memes.eth");

    let mut rx = store.feeds().feed(&options).await.unwrap();
    wait_until(&mut rx, |s| s.window.len() == 25).await;

    // every advance follows an observed delivery, so each must be
    // accepted first try even while a background top-up is running
    for expected in [50, 75, 100] {
        store.feeds().load_more(&options).await.unwrap();
        wait_until(&mut rx, |s| s.window.len() == expected).await;
    }
}

#[tokio::test]
async fn sessions_share_a_single_subplebbit_fetch() {
    let client = Arc::new(MockClient::new());
    let store = open_with_client(client.clone()).await;
    let account_id = active_id(&store).await;

    let hot = FeedOptions {
        sort: SortType::Hot,
        ..new_feed(&account_id, "dedup.eth")
    };
    let new = new_feed(&account_id, "dedup.eth");

    let mut hot_rx = store.feeds().feed(&hot).await.unwrap();
    let mut new_rx = store.feeds().feed(&new).await.unwrap();
    wait_until(&mut hot_rx, |s| s.window.len() == 25).await;
    wait_until(&mut new_rx, |s| s.window.len() == 25).await;

    assert_eq!(client.subplebbit_get_count("dedup.eth").await, 1);
    // hot arrives preloaded inside the snapshot; only new needs a fetch
    assert_eq!(client.page_get_count("dedup.eth hot page cid 1").await, 0);
    assert_eq!(client.page_get_count("dedup.eth new page cid 1").await, 1);
}

fn reply(cid: &str, timestamp: u64) -> Comment {
    Comment {
        cid: Some(cid.to_string()),
        parent_cid: Some("parent cid".to_string()),
        post_cid: Some("parent cid".to_string()),
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

#[tokio::test]
async fn replies_window_prepends_own_pending_reply() {
    let client = Arc::new(MockClient::new());
    client
        .add_comment(Comment {
            cid: Some("parent cid".to_string()),
            subplebbit_address: "memes.eth".to_string(),
            author: Author {
                address: "op address".to_string(),
                display_name: None,
            },
            timestamp: 50,
            content: Some("parent".to_string()),
            updated_at: Some(10_000),
            replies: Pages {
                pages: HashMap::from([(
                    SortType::New,
                    Page {
                        comments: vec![reply("r1", 300), reply("r2", 200), reply("r3", 100)],
                        next_cid: None,
                    },
                )]),
                page_cids: HashMap::new(),
            },
            ..Default::default()
        })
        .await;
    let store = open_with_client(client).await;
    let account_id = active_id(&store).await;
    let options = RepliesOptions {
        account_id: account_id.clone(),
        comment_cid: "parent cid".to_string(),
        sort: SortType::New,
        filter: None,
    };

    let mut rx = store.replies().replies(&options).await.unwrap();
    let snapshot = wait_until(&mut rx, |s| s.window.len() == 3).await;
    assert!(!snapshot.has_more);
    assert_eq!(snapshot.window[0].cid.as_deref(), Some("r1"));
    assert_eq!(snapshot.window[2].cid.as_deref(), Some("r3"));

    // an unanswered challenge keeps the reply pending and cid-less
    let _handle = store
        .accounts()
        .publish_comment(
            &account_id,
            CommentOptions {
                subplebbit_address: "memes.eth".to_string(),
                content: Some("my reply".to_string()),
                parent_cid: Some("parent cid".to_string()),
                post_cid: Some("parent cid".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let snapshot = wait_until(&mut rx, |s| s.updated_window.len() == 4).await;
    assert_eq!(
        snapshot.updated_window[0].content.as_deref(),
        Some("my reply")
    );
    assert!(snapshot.updated_window[0].cid.is_none());
    assert_eq!(snapshot.window.len(), 3);
}

#[tokio::test]
async fn replies_load_more_before_first_delivery_is_rejected() {
    let client = Arc::new(MockClient::new());
    client
        .add_comment(Comment {
            cid: Some("orphan cid".to_string()),
            subplebbit_address: "memes.eth".to_string(),
            author: Author {
                address: "op address".to_string(),
                display_name: None,
            },
            timestamp: 50,
            updated_at: Some(10_000),
            replies: Pages {
                pages: HashMap::new(),
                page_cids: HashMap::from([(SortType::New, "unresolvable page cid".to_string())]),
            },
            ..Default::default()
        })
        .await;
    let store = open_with_client(client).await;
    let options = RepliesOptions {
        account_id: active_id(&store).await,
        comment_cid: "orphan cid".to_string(),
        sort: SortType::New,
        filter: None,
    };

    let mut rx = store.replies().replies(&options).await.unwrap();
    wait_until(&mut rx, |s| !s.errors.is_empty()).await;

    let err = store.replies().load_more(&options).await.unwrap_err();
    assert!(matches!(err, StoreError::PendingOperation(_)));
}
