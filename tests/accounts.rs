/// Account lifecycle scenarios over a full store
use plebbit_store::storage::{get_typed, partitions};
use plebbit_store::{
    AccountPublicationState, CommentOptions, MemoryStorage, MockClient, PublicationHandle, Store,
    StoreConfig, StoreError, VoteOptions,
};
use std::sync::Arc;

async fn open_shared() -> (Store, Arc<MockClient>, Arc<MemoryStorage>) {
    let client = Arc::new(MockClient::new());
    let storage = Arc::new(MemoryStorage::new());
    let store = Store::open(StoreConfig::default(), client.clone(), storage.clone())
        .await
        .expect("store should open");
    (store, client, storage)
}

async fn reopen(client: Arc<MockClient>, storage: Arc<MemoryStorage>) -> Store {
    Store::open(StoreConfig::default(), client, storage)
        .await
        .expect("store should reopen")
}

async fn wait_for_challenge(handle: &mut PublicationHandle) {
    loop {
        if handle.status().challenge.is_some() {
            return;
        }
        handle.changed().await.expect("publication should progress");
    }
}

#[tokio::test]
async fn scenario_a_account_names_survive_restart() {
    let (store, client, storage) = open_shared().await;
    let accounts = store.accounts();

    assert_eq!(accounts.active_account().await.unwrap().name, "Account 1");
    assert_eq!(accounts.create_account(None).await.unwrap().name, "Account 2");
    assert_eq!(accounts.create_account(None).await.unwrap().name, "Account 3");
    accounts.create_account(Some("custom name")).await.unwrap();

    store.shutdown().await;
    let store = reopen(client, storage).await;
    for name in ["Account 1", "Account 2", "Account 3", "custom name"] {
        let account = store.accounts().account_by_name(name).await.unwrap();
        assert_eq!(account.name, name);
    }
}

#[tokio::test]
async fn scenario_b_challenge_verified_comment_gets_cid() {
    let (store, client, storage) = open_shared().await;
    let account = store.accounts().active_account().await.unwrap();

    let mut handle = store
        .accounts()
        .publish_comment(
            &account.id,
            CommentOptions {
                subplebbit_address: "memes.eth".to_string(),
                content: Some("content 1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(handle.index, Some(0));

    wait_for_challenge(&mut handle).await;
    handle
        .publish_challenge_answers(vec!["4".to_string()])
        .await
        .unwrap();
    let terminal = handle.wait_terminal().await.unwrap();
    assert!(terminal.verification.unwrap().challenge_success);

    let comments = store.accounts().account_comments(&account.id).await.unwrap();
    assert_eq!(comments[0].index, 0);
    assert_eq!(comments[0].comment.cid.as_deref(), Some("content 1 cid"));

    // the attached cid is persisted, not only in memory
    store.shutdown().await;
    let store = reopen(client, storage).await;
    let comments = store.accounts().account_comments(&account.id).await.unwrap();
    assert_eq!(comments[0].comment.cid.as_deref(), Some("content 1 cid"));
    assert_eq!(comments[0].state, AccountPublicationState::Succeeded);
}

#[tokio::test]
async fn scenario_e_deleting_active_account_promotes_next_in_order() {
    let (store, client, _) = open_shared().await;
    client.set_challenges_enabled(false);
    let accounts = store.accounts();

    accounts.create_account(Some("alice")).await.unwrap();
    accounts.create_account(Some("bob")).await.unwrap();
    let first = accounts.active_account().await.unwrap();

    // give the doomed account a publication
    let mut handle = accounts
        .publish_comment(
            &first.id,
            CommentOptions {
                subplebbit_address: "memes.eth".to_string(),
                content: Some("gone soon".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    handle.wait_terminal().await.unwrap();

    accounts.delete_account(Some(first.name.as_str())).await.unwrap();
    let promoted = accounts.active_account().await.unwrap();
    assert_eq!(promoted.name, "alice");

    let unreachable = accounts.account_comments(&first.id).await;
    assert!(matches!(unreachable, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn scenario_f_import_collision_appends_suffix_and_regenerates_id() {
    let (store, _, _) = open_shared().await;
    let accounts = store.accounts();
    let original = accounts.active_account().await.unwrap();

    let exported = accounts.export_account(Some("Account 1")).await.unwrap();
    let imported = accounts.import_account(&exported).await.unwrap();
    assert_eq!(imported.name, "Account 1 2");
    assert_ne!(imported.id, original.id);

    // importing under a free name still regenerates the id
    accounts.delete_account(Some("Account 1")).await.unwrap();
    let reimported = accounts.import_account(&exported).await.unwrap();
    assert_ne!(reimported.id, original.id);
    assert_ne!(reimported.id, imported.id);
}

#[tokio::test]
async fn round_trip_reproduces_observable_account_state() {
    let (store, client, storage) = open_shared().await;
    client.set_challenges_enabled(false);
    let accounts = store.accounts();

    accounts.create_account(Some("alice")).await.unwrap();
    accounts.create_account(Some("bob")).await.unwrap();
    accounts
        .set_accounts_order(&[
            "bob".to_string(),
            "Account 1".to_string(),
            "alice".to_string(),
        ])
        .await
        .unwrap();
    accounts.set_active_account("bob").await.unwrap();

    let bob = accounts.account_by_name("bob").await.unwrap();
    accounts.subscribe(&bob.id, "memes.eth").await.unwrap();
    accounts.subscribe(&bob.id, "news.eth").await.unwrap();
    accounts.block_address(&bob.id, "spam.eth").await.unwrap();
    accounts.block_cid(&bob.id, "awful cid").await.unwrap();

    let mut first = accounts
        .publish_comment(
            &bob.id,
            CommentOptions {
                subplebbit_address: "memes.eth".to_string(),
                content: Some("first".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    first.wait_terminal().await.unwrap();
    let mut second = accounts
        .publish_comment(
            &bob.id,
            CommentOptions {
                subplebbit_address: "memes.eth".to_string(),
                content: Some("second".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    second.wait_terminal().await.unwrap();
    let mut vote = accounts
        .publish_vote(
            &bob.id,
            VoteOptions {
                subplebbit_address: "memes.eth".to_string(),
                comment_cid: "first cid".to_string(),
                vote: -1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    vote.wait_terminal().await.unwrap();

    store.shutdown().await;
    let store = reopen(client, storage).await;
    let accounts = store.accounts();

    let names: Vec<String> = accounts
        .accounts()
        .await
        .unwrap()
        .into_iter()
        .map(|account| account.name)
        .collect();
    assert_eq!(
        names,
        vec!["bob".to_string(), "Account 1".to_string(), "alice".to_string()]
    );
    let active = accounts.active_account().await.unwrap();
    assert_eq!(active.name, "bob");
    assert_eq!(
        active.subscriptions,
        vec!["memes.eth".to_string(), "news.eth".to_string()]
    );
    assert!(active.blocked_addresses.contains("spam.eth"));
    assert!(active.blocked_cids.contains("awful cid"));

    let comments = accounts.account_comments(&active.id).await.unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].index, 0);
    assert_eq!(comments[0].comment.cid.as_deref(), Some("first cid"));
    assert_eq!(comments[1].index, 1);
    assert_eq!(comments[1].comment.cid.as_deref(), Some("second cid"));

    let votes = accounts.account_votes(&active.id).await.unwrap();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].vote, -1);
    assert_eq!(votes[0].comment_cid, "first cid");
}

#[tokio::test]
async fn pending_publication_reconciles_from_page_content() {
    let (store, _, _) = open_shared().await;
    let account = store.accounts().active_account().await.unwrap();

    // challenge never answered: the comment stays pending without a cid
    let mut handle = store
        .accounts()
        .publish_comment(
            &account.id,
            CommentOptions {
                subplebbit_address: "memes.eth".to_string(),
                content: Some("eventually found".to_string()),
                timestamp: Some(123_456),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_for_challenge(&mut handle).await;
    let comments = store.accounts().account_comments(&account.id).await.unwrap();
    assert!(comments[0].comment.cid.is_none());

    // the same publication surfaces in a fetched page
    let seen = plebbit_store::Comment {
        cid: Some("eventually found cid".to_string()),
        subplebbit_address: "memes.eth".to_string(),
        author: account.author.clone(),
        timestamp: 123_456,
        content: Some("eventually found".to_string()),
        ..Default::default()
    };
    store.accounts().reconcile_comments(&[seen]).await.unwrap();

    let comments = store.accounts().account_comments(&account.id).await.unwrap();
    assert_eq!(
        comments[0].comment.cid.as_deref(),
        Some("eventually found cid")
    );
    assert_eq!(comments[0].state, AccountPublicationState::Succeeded);
}

#[tokio::test]
async fn storage_partitions_hold_account_records() {
    let (store, _, storage) = open_shared().await;
    let account = store.accounts().active_account().await.unwrap();

    let stored: Option<plebbit_store::Account> =
        get_typed(storage.as_ref(), partitions::ACCOUNTS, &account.id)
            .await
            .unwrap();
    assert_eq!(stored.unwrap().name, "Account 1");

    let active_id: Option<String> =
        get_typed(storage.as_ref(), partitions::ACCOUNTS_METADATA, "activeAccountId")
            .await
            .unwrap();
    assert_eq!(active_id.as_deref(), Some(account.id.as_str()));
}
