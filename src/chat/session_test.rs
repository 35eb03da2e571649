use std::future::Future;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Notify;

use super::*;
use crate::backend::Row;
use crate::model::AuthUser;

const GROUP: &str = "g1";
const MESSAGES: &str = "group_messages";

// =============================================================================
// FIXTURES
// =============================================================================

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn message_row(id: &str, group_id: &str, user_id: &str, content: &str, created_at: &str) -> Row {
    row(json!({
        "id": id,
        "group_id": group_id,
        "user_id": user_id,
        "content": content,
        "created_at": created_at,
    }))
}

fn ann() -> AuthUser {
    AuthUser { id: "u1".into(), email: Some("ann@example.com".into()), full_name: Some("Ann Lee".into()) }
}

async fn seeded_backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_current_user(Some(ann())).await;
    backend
        .seed("group_members", vec![row(json!({"group_id": GROUP, "user_id": "u1", "is_admin": false}))])
        .await;
    backend
        .seed(
            "users",
            vec![
                row(json!({"id": "u1", "email": "ann@example.com", "username": "ann"})),
                row(json!({"id": "u2", "email": "bob@example.com", "username": null})),
            ],
        )
        .await;
    backend
}

async fn open(backend: &Arc<MemoryBackend>) -> ChatSession {
    let config = ChatConfig::default();
    ChatSession::open(GROUP, ChatDeps::in_memory(backend, &config), config).await.unwrap()
}

fn event(record: Row) -> InsertEvent {
    InsertEvent { table: MESSAGES.into(), record }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Holds every insert until `proceed` is notified; nothing is stored or
/// broadcast meanwhile.
struct SlowInsert {
    inner: Arc<MemoryBackend>,
    proceed: Arc<Notify>,
}

#[async_trait::async_trait]
impl DataAccess for SlowInsert {
    async fn query(&self, table: &str, filter: &Filter, order: Option<&Order>) -> Result<Vec<Row>, BackendError> {
        self.inner.query(table, filter, order).await
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, BackendError> {
        self.proceed.notified().await;
        self.inner.insert(table, row).await
    }

    async fn current_user(&self) -> Result<Option<AuthUser>, BackendError> {
        self.inner.current_user().await
    }
}

fn ids(messages: &[ChatMessage]) -> Vec<String> {
    messages.iter().map(|m| m.id.to_string()).collect()
}

// =============================================================================
// open / load_initial
// =============================================================================

#[tokio::test]
async fn open_subscribes_once() {
    let backend = seeded_backend().await;
    let _session = open(&backend).await;
    assert_eq!(backend.subscriber_count().await, 1);
}

#[tokio::test]
async fn open_reports_subscribe_failure() {
    let backend = seeded_backend().await;
    backend.fail_next_subscribe("realtime down").await;
    let config = ChatConfig::default();
    let result = ChatSession::open(GROUP, ChatDeps::in_memory(&backend, &config), config).await;
    assert!(matches!(result, Err(LoadError::Backend(BackendError::Subscribe(_)))));
}

#[tokio::test]
async fn load_initial_orders_history_and_resolves_names() {
    let backend = seeded_backend().await;
    backend
        .seed(
            MESSAGES,
            vec![
                message_row("2", GROUP, "u2", "second", "2024-01-01T10:05:00Z"),
                message_row("x", "g2", "u2", "elsewhere", "2024-01-01T10:01:00Z"),
                message_row("1", GROUP, "u1", "first", "2024-01-01T10:00:00Z"),
                message_row("3", GROUP, "ghost", "third", "2024-01-01T10:10:00Z"),
            ],
        )
        .await;
    let session = open(&backend).await;

    let loaded = session.load_initial().await.unwrap();
    assert_eq!(ids(&loaded), vec!["1", "2", "3"]);
    let names: Vec<_> = loaded.iter().map(|m| m.author_display_name.as_str()).collect();
    assert_eq!(names, vec!["ann", "bob", "Unknown"]);
    assert_eq!(session.messages().await, loaded);
}

#[tokio::test]
async fn load_initial_skips_malformed_rows() {
    let backend = seeded_backend().await;
    backend
        .seed(
            MESSAGES,
            vec![
                message_row("1", GROUP, "u1", "ok", "2024-01-01T10:00:00Z"),
                row(json!({"id": "2", "group_id": GROUP, "content": "no author"})),
            ],
        )
        .await;
    let session = open(&backend).await;
    assert_eq!(ids(&session.load_initial().await.unwrap()), vec!["1"]);
}

#[tokio::test]
async fn load_failure_is_reported_and_leaves_list() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    backend.fail_next_query("storage down").await;

    let err = session.load_initial().await.unwrap_err();
    assert!(matches!(err, LoadError::Backend(BackendError::Unavailable(_))));
    assert!(session.messages().await.is_empty());
    assert_eq!(backend.query_calls(), 1);
}

#[tokio::test]
async fn newer_load_supersedes_older() {
    let backend = seeded_backend().await;
    backend.seed(MESSAGES, vec![message_row("1", GROUP, "u1", "hi", "2024-01-01T10:00:00Z")]).await;
    let session = open(&backend).await;
    let b = &backend;
    backend.hold_query_replies();

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.load_initial().await }
    });
    wait_until(|| async move { b.query_calls() == 1 }).await;
    let second = tokio::spawn({
        let session = session.clone();
        async move { session.load_initial().await }
    });
    wait_until(|| async move { b.query_calls() == 2 }).await;
    backend.release_query_replies();

    assert_eq!(first.await.unwrap(), Err(LoadError::Superseded));
    assert_eq!(ids(&second.await.unwrap().unwrap()), vec!["1"]);
}

#[tokio::test]
async fn load_keeps_notification_that_raced_it() {
    let backend = seeded_backend().await;
    backend.seed(MESSAGES, vec![message_row("1", GROUP, "u1", "hi", "2024-01-01T10:00:00Z")]).await;
    // Directory on its own backend so author lookups are not held with the load.
    let users = seeded_backend().await;
    let config = ChatConfig::default();
    let deps = ChatDeps {
        data: backend.clone(),
        live: backend.clone(),
        directory: ChatDeps::in_memory(&users, &config).directory,
    };
    let session = ChatSession::open(GROUP, deps, config).await.unwrap();
    let b = &backend;
    let s = &session;
    backend.hold_query_replies();

    let load = tokio::spawn({
        let session = session.clone();
        async move { session.load_initial().await }
    });
    wait_until(|| async move { b.query_calls() == 1 }).await;
    backend.broadcast(MESSAGES, &message_row("2", GROUP, "u1", "late", "2024-01-01T10:01:00Z")).await;
    wait_until(|| async move { s.messages().await.len() == 1 }).await;
    backend.release_query_replies();

    assert_eq!(ids(&load.await.unwrap().unwrap()), vec!["1", "2"]);
}

// =============================================================================
// send_message
// =============================================================================

#[tokio::test]
async fn send_shows_provisional_then_reconciles_without_duplicate() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    let s = &session;
    session.load_initial().await.unwrap();
    backend.hold_insert_replies();

    let send = tokio::spawn({
        let session = session.clone();
        async move { session.send_message("  hello  ").await }
    });
    wait_until(|| async move { s.messages().await.iter().any(ChatMessage::is_provisional) }).await;
    let provisional = session.messages().await.into_iter().find(ChatMessage::is_provisional).unwrap();
    assert_eq!(provisional.content, "hello");
    assert_eq!(provisional.author_display_name, "Ann Lee");
    assert_eq!(backend.insert_calls(), 1);

    backend.release_insert_replies();
    let confirmed = send.await.unwrap().unwrap();
    assert!(!confirmed.is_provisional());

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, confirmed.id);
    assert_eq!(messages[0].content, "hello");
}

#[tokio::test]
async fn send_failure_removes_provisional_and_keeps_draft() {
    let backend = seeded_backend().await;
    backend.seed(MESSAGES, vec![message_row("1", GROUP, "u1", "hi", "2024-01-01T10:00:00Z")]).await;
    let session = open(&backend).await;
    session.load_initial().await.unwrap();
    backend.fail_next_insert("write refused").await;

    let err = session.send_message(" retry me ").await.unwrap_err();
    assert!(matches!(err, SendError::Rejected { source: BackendError::Unavailable(_), .. }));
    assert_eq!(err.draft(), Some(" retry me "));
    assert_eq!(ids(&session.messages().await), vec!["1"]);
}

#[tokio::test]
async fn reload_during_send_keeps_provisional_entry() {
    let backend = seeded_backend().await;
    backend.seed(MESSAGES, vec![message_row("1", GROUP, "u2", "hi", "2024-01-01T10:00:00Z")]).await;
    let config = ChatConfig::default();
    let proceed = Arc::new(Notify::new());
    let mut deps = ChatDeps::in_memory(&backend, &config);
    deps.data = Arc::new(SlowInsert { inner: backend.clone(), proceed: proceed.clone() });
    let session = ChatSession::open(GROUP, deps, config).await.unwrap();
    let s = &session;
    session.load_initial().await.unwrap();

    let send = tokio::spawn({
        let session = session.clone();
        async move { session.send_message("hello").await }
    });
    wait_until(|| async move { s.messages().await.iter().any(ChatMessage::is_provisional) }).await;

    let reloaded = session.load_initial().await.unwrap();
    assert_eq!(reloaded.len(), 2);
    assert_eq!(ids(&reloaded)[0], "1");
    assert!(reloaded[1].is_provisional());
    assert_eq!(reloaded[1].content, "hello");

    proceed.notify_one();
    let confirmed = send.await.unwrap().unwrap();
    let messages = session.messages().await;
    assert_eq!(ids(&messages), vec!["1".to_owned(), confirmed.id.to_string()]);
    assert!(messages.iter().all(|m| !m.is_provisional()));
}

#[tokio::test]
async fn own_message_keeps_its_label_when_notification_wins() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    let s = &session;
    backend.hold_insert_replies();

    let send = tokio::spawn({
        let session = session.clone();
        async move { session.send_message("hello").await }
    });
    // The in-memory insert broadcasts before its held reply.
    wait_until(|| async move { s.messages().await.len() == 2 }).await;
    backend.release_insert_replies();
    let confirmed = send.await.unwrap().unwrap();

    let messages = session.messages().await;
    assert_eq!(ids(&messages), vec![confirmed.id.to_string()]);
    assert_eq!(messages[0].author_display_name, "Ann Lee");
}

#[tokio::test]
async fn empty_send_contacts_nothing() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    let before = session.revision();

    assert_eq!(session.send_message(" \n\t ").await, Err(SendError::EmptyContent));
    assert_eq!(backend.insert_calls(), 0);
    assert_eq!(backend.query_calls(), 0);
    assert_eq!(session.revision(), before);
}

#[tokio::test]
async fn signed_out_send_requires_auth() {
    let backend = seeded_backend().await;
    backend.set_current_user(None).await;
    let session = open(&backend).await;

    let err = session.send_message("hello").await.unwrap_err();
    assert_eq!(err, SendError::AuthRequired { content: "hello".into() });
    assert_eq!(backend.insert_calls(), 0);
    assert!(session.messages().await.is_empty());
}

#[tokio::test]
async fn auth_lookup_failure_requires_auth() {
    let backend = seeded_backend().await;
    backend.fail_next_current_user("auth down").await;
    let session = open(&backend).await;

    let err = session.send_message("hello").await.unwrap_err();
    assert!(matches!(err, SendError::AuthRequired { .. }));
    assert_eq!(backend.insert_calls(), 0);
}

#[tokio::test]
async fn non_member_cannot_send() {
    let backend = seeded_backend().await;
    backend.set_current_user(Some(AuthUser { id: "u9".into(), email: None, full_name: None })).await;
    let session = open(&backend).await;

    let err = session.send_message("hello").await.unwrap_err();
    assert_eq!(err, SendError::NotMember { group_id: GROUP.into(), content: "hello".into() });
    assert_eq!(backend.insert_calls(), 0);
}

#[tokio::test]
async fn membership_check_can_be_disabled() {
    let backend = seeded_backend().await;
    backend.set_current_user(Some(AuthUser { id: "u9".into(), email: None, full_name: None })).await;
    let config = ChatConfig { verify_membership: false, ..ChatConfig::default() };
    let session = ChatSession::open(GROUP, ChatDeps::in_memory(&backend, &config), config).await.unwrap();

    let sent = session.send_message("hello").await.unwrap();
    assert_eq!(sent.author_display_name, "You");
    assert_eq!(backend.query_calls(), 0);
}

#[tokio::test]
async fn send_after_teardown_is_closed() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    session.teardown().await;

    let err = session.send_message("hello").await.unwrap_err();
    assert_eq!(err, SendError::Closed { content: "hello".into() });
    assert_eq!(backend.insert_calls(), 0);
}

// =============================================================================
// on_remote_insert
// =============================================================================

#[tokio::test]
async fn remote_insert_merges_once() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    let record = message_row("9", GROUP, "u2", "yo", "2024-01-01T10:00:00Z");

    assert!(session.on_remote_insert(event(record.clone())).await);
    assert!(!session.on_remote_insert(event(record)).await);
    let messages = session.messages().await;
    assert_eq!(ids(&messages), vec!["9"]);
    assert_eq!(messages[0].author_display_name, "bob");
}

#[tokio::test]
async fn remote_insert_ignores_other_groups_and_bad_rows() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;

    assert!(!session.on_remote_insert(event(message_row("9", "g2", "u2", "yo", "2024-01-01T10:00:00Z"))).await);
    assert!(!session.on_remote_insert(event(row(json!({"id": "10"})))).await);
    let wrong_table = InsertEvent { table: "users".into(), record: message_row("11", GROUP, "u2", "x", "2024-01-01T10:00:00Z") };
    assert!(!session.on_remote_insert(wrong_table).await);
    assert!(session.messages().await.is_empty());
}

#[tokio::test]
async fn directory_failure_uses_placeholder() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    backend.fail_next_query("directory down").await;

    assert!(session.on_remote_insert(event(message_row("9", GROUP, "u2", "yo", "2024-01-01T10:00:00Z"))).await);
    assert_eq!(session.messages().await[0].author_display_name, "Unknown");
}

#[tokio::test]
async fn resolved_authors_are_cached() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;

    session.on_remote_insert(event(message_row("9", GROUP, "u2", "a", "2024-01-01T10:00:00Z"))).await;
    let lookups = backend.query_calls();
    session.on_remote_insert(event(message_row("10", GROUP, "u2", "b", "2024-01-01T10:01:00Z"))).await;
    assert_eq!(backend.query_calls(), lookups);
    assert_eq!(session.messages().await[1].author_display_name, "bob");
}

#[tokio::test]
async fn listener_merges_inserts_from_other_clients() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    let mut watch = session.watch();

    backend
        .insert(MESSAGES, row(json!({"group_id": GROUP, "user_id": "u2", "content": "from bob"})))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), watch.changed()).await.unwrap().unwrap();

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "from bob");
    assert!(session.revision() >= 1);
}

// =============================================================================
// teardown
// =============================================================================

#[tokio::test]
async fn teardown_is_idempotent_and_unsubscribes() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;

    session.teardown().await;
    session.teardown().await;
    assert!(session.is_closed().await);
    assert_eq!(backend.subscriber_count().await, 0);
    assert_eq!(session.load_initial().await, Err(LoadError::Closed));
    assert!(!session.on_remote_insert(event(message_row("9", GROUP, "u2", "yo", "2024-01-01T10:00:00Z"))).await);
}

#[tokio::test]
async fn load_completing_after_teardown_is_discarded() {
    let backend = seeded_backend().await;
    backend.seed(MESSAGES, vec![message_row("1", GROUP, "u1", "hi", "2024-01-01T10:00:00Z")]).await;
    let session = open(&backend).await;
    let b = &backend;
    backend.hold_query_replies();

    let load = tokio::spawn({
        let session = session.clone();
        async move { session.load_initial().await }
    });
    wait_until(|| async move { b.query_calls() == 1 }).await;
    session.teardown().await;
    backend.release_query_replies();

    assert_eq!(load.await.unwrap(), Err(LoadError::Closed));
    assert!(session.messages().await.is_empty());
}

#[tokio::test]
async fn send_completing_after_teardown_leaves_list() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    let b = &backend;
    backend.hold_insert_replies();

    let send = tokio::spawn({
        let session = session.clone();
        async move { session.send_message("hello").await }
    });
    wait_until(|| async move { b.insert_calls() == 1 }).await;
    session.teardown().await;
    let before = session.messages().await;
    backend.release_insert_replies();

    let confirmed = send.await.unwrap().unwrap();
    assert!(!confirmed.is_provisional());
    assert_eq!(session.messages().await, before);
}

#[tokio::test]
async fn dropping_session_releases_subscription() {
    let backend = seeded_backend().await;
    let session = open(&backend).await;
    let b = &backend;
    drop(session);
    wait_until(|| async move { b.subscriber_count().await == 0 }).await;
}
