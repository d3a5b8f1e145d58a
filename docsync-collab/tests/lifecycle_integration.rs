//! Document lifecycle tests.
//!
//! Drive the registry directly on a paused clock: activation, debounced
//! saves, draining, eviction and shutdown, all against an in-memory store
//! that records when each save happened.

use docsync_collab::auth::Role;
use docsync_collab::connection::ConnectionHandle;
use docsync_collab::crdt::CrdtSession;
use docsync_collab::document::DocumentState;
use docsync_collab::persistence::{PersistenceError, PersistenceScheduler};
use docsync_collab::protocol::{Frame, SyncMessage};
use docsync_collab::registry::{Connection, DocumentRegistry, RegistryConfig, RegistryError};
use docsync_collab::storage::MemoryStore;

use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use yrs::{Doc, ReadTxn, Text, Transact, WriteTxn};

const DEBOUNCE: Duration = Duration::from_secs(2);
const GRACE: Duration = Duration::from_secs(30);

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn setup() -> (Arc<DocumentRegistry>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let persistence = Arc::new(PersistenceScheduler::new(
        store.clone(),
        DEBOUNCE,
        Duration::from_secs(10),
    ));
    let registry = DocumentRegistry::new(
        persistence,
        RegistryConfig {
            outbound_capacity: 64,
            eviction_grace: GRACE,
        },
    );
    (registry, store)
}

async fn join(registry: &DocumentRegistry, user: &str, doc: &str) -> Connection {
    registry
        .connect(ConnectionHandle::new(user, doc, Role::Editor))
        .await
        .unwrap()
}

async fn leave(registry: &Arc<DocumentRegistry>, conn: &Connection) {
    registry.disconnect(&conn.document, &conn.id()).await;
}

/// Append `chunk` to the replica and send the resulting update.
async fn type_text(conn: &Connection, replica: &Doc, chunk: &str) {
    let before = replica.transact().state_vector();
    {
        let mut txn = replica.transact_mut();
        let text = txn.get_or_insert_text("content");
        let end = text.len(&txn);
        text.insert(&mut txn, end, chunk);
    }
    let update = replica.transact().encode_diff_v1(&before);
    let frame = Frame::Sync(SyncMessage::Update(update)).encode();
    let outcome = conn.document.receive(&conn.handle, &frame).await;
    assert!(outcome.content_changed);
}

fn stored_text(store: &MemoryStore, doc: &str) -> Option<String> {
    store
        .get(doc)
        .map(|snapshot| CrdtSession::from_snapshot(&snapshot).unwrap().text("content"))
}

// ─── Debounced saves ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_edit_burst_saves_once() {
    let (registry, store) = setup();
    let conn = join(&registry, "alice", "doc-42").await;
    let replica = Doc::new();

    let mut last_edit = Instant::now();
    for i in 0..10 {
        type_text(&conn, &replica, &i.to_string()).await;
        last_edit = Instant::now();
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(store.save_count(), 0);

    sleep(Duration::from_secs(3)).await;
    let saves = store.save_times("doc-42");
    assert_eq!(saves.len(), 1);
    let delay = saves[0] - last_edit;
    assert!(delay >= DEBOUNCE && delay < DEBOUNCE + Duration::from_millis(50), "{delay:?}");
    assert_eq!(stored_text(&store, "doc-42").as_deref(), Some("0123456789"));
    assert!(!conn.document.lock().await.is_dirty());
}

#[tokio::test(start_paused = true)]
async fn test_separate_bursts_save_separately() {
    let (registry, store) = setup();
    let conn = join(&registry, "alice", "doc-42").await;
    let replica = Doc::new();

    type_text(&conn, &replica, "first").await;
    sleep(Duration::from_secs(5)).await;
    type_text(&conn, &replica, " second").await;
    sleep(Duration::from_secs(5)).await;

    assert_eq!(store.save_count(), 2);
    assert_eq!(stored_text(&store, "doc-42").as_deref(), Some("first second"));
}

#[tokio::test(start_paused = true)]
async fn test_idle_document_not_saved() {
    let (registry, store) = setup();
    let conn = join(&registry, "alice", "doc-42").await;
    sleep(Duration::from_secs(10)).await;
    leave(&registry, &conn).await;
    sleep(GRACE + Duration::from_secs(1)).await;
    assert_eq!(store.save_count(), 0);
}

// ─── Activation ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_connections_load_once() {
    let (registry, store) = setup();
    store.set_load_delay(Some(Duration::from_millis(200)));

    let attempts = (0..5).map(|i| {
        registry.connect(ConnectionHandle::new(format!("user-{i}"), "doc-42", Role::Editor))
    });
    let connections: Vec<Connection> = futures_util::future::join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(store.load_count(), 1);
    let first = &connections[0].document;
    assert!(connections.iter().all(|c| Arc::ptr_eq(&c.document, first)));
    assert_eq!(first.connection_count().await, 5);
}

#[tokio::test(start_paused = true)]
async fn test_existing_content_loaded() {
    let (registry, store) = setup();
    let seed = Doc::new();
    {
        let mut txn = seed.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, "from storage");
    }
    store.insert(
        "doc-42",
        seed.transact().encode_state_as_update_v1(&yrs::StateVector::default()),
    );

    let conn = join(&registry, "alice", "doc-42").await;
    assert_eq!(conn.document.text("content").await, "from storage");
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_snapshot_refuses_activation() {
    let (registry, store) = setup();
    store.insert("doc-42", vec![0xFF, 0xFF, 0xFF, 0xFF]);

    let result = registry
        .connect(ConnectionHandle::new("alice", "doc-42", Role::Editor))
        .await;
    match result {
        Err(RegistryError::Activation {
            source: PersistenceError::CorruptSnapshot { .. },
            ..
        }) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("corrupt snapshot was accepted"),
    }
    assert_eq!(registry.state("doc-42").await, DocumentState::Unloaded);
    // The snapshot is left alone.
    assert_eq!(store.save_count(), 0);
}

// ─── Draining and eviction ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_last_disconnect_flushes_immediately() {
    let (registry, store) = setup();
    let conn = join(&registry, "alice", "doc-42").await;
    type_text(&conn, &Doc::new(), "bye").await;

    leave(&registry, &conn).await;
    assert_eq!(store.save_count(), 1);
    assert_eq!(stored_text(&store, "doc-42").as_deref(), Some("bye"));
    assert_eq!(registry.state("doc-42").await, DocumentState::Draining);

    // The debounce timer was cancelled, so nothing saves again.
    sleep(DEBOUNCE * 2).await;
    assert_eq!(store.save_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_quick_reconnect_reuses_document() {
    let (registry, store) = setup();
    let conn = join(&registry, "alice", "doc-42").await;
    let first = Arc::clone(&conn.document);
    leave(&registry, &conn).await;

    sleep(Duration::from_secs(5)).await;
    let again = join(&registry, "alice", "doc-42").await;
    assert!(Arc::ptr_eq(&first, &again.document));
    assert_eq!(store.load_count(), 1);
    assert_eq!(registry.state("doc-42").await, DocumentState::Active);

    // The cancelled eviction never fires.
    sleep(GRACE * 2).await;
    assert_eq!(registry.state("doc-42").await, DocumentState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_unused_document_evicted() {
    let (registry, store) = setup();
    let conn = join(&registry, "alice", "doc-42").await;
    type_text(&conn, &Doc::new(), "kept").await;
    leave(&registry, &conn).await;

    sleep(GRACE - Duration::from_secs(1)).await;
    assert_eq!(registry.state("doc-42").await, DocumentState::Draining);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(registry.state("doc-42").await, DocumentState::Unloaded);
    assert!(registry.active_documents().await.is_empty());
    assert_eq!(conn.document.state().await, DocumentState::Destroyed);

    // Coming back loads the saved content.
    let again = join(&registry, "bob", "doc-42").await;
    assert!(!Arc::ptr_eq(&conn.document, &again.document));
    assert_eq!(store.load_count(), 2);
    assert_eq!(again.document.text("content").await, "kept");
}

#[tokio::test(start_paused = true)]
async fn test_failed_drain_flush_retried_on_eviction() {
    let (registry, store) = setup();
    let conn = join(&registry, "alice", "doc-42").await;
    type_text(&conn, &Doc::new(), "precious").await;

    store.set_fail_saves(true);
    leave(&registry, &conn).await;
    assert_eq!(store.save_count(), 0);
    assert!(conn.document.lock().await.is_dirty());

    store.set_fail_saves(false);
    sleep(GRACE + Duration::from_secs(1)).await;
    assert_eq!(store.save_count(), 1);
    assert_eq!(stored_text(&store, "doc-42").as_deref(), Some("precious"));
    assert_eq!(registry.state("doc-42").await, DocumentState::Unloaded);
}

#[tokio::test(start_paused = true)]
async fn test_remaining_connection_keeps_document() {
    let (registry, _store) = setup();
    let alice = join(&registry, "alice", "doc-42").await;
    let bob = join(&registry, "bob", "doc-42").await;

    leave(&registry, &alice).await;
    sleep(GRACE * 2).await;
    assert_eq!(registry.state("doc-42").await, DocumentState::Active);
    assert_eq!(bob.document.connection_count().await, 1);
}

// ─── Shutdown ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_pending_edits() {
    let (registry, store) = setup();
    let a = join(&registry, "alice", "doc-a").await;
    let b = join(&registry, "bob", "doc-b").await;
    let _idle = join(&registry, "carol", "doc-c").await;
    type_text(&a, &Doc::new(), "alpha").await;
    type_text(&b, &Doc::new(), "beta").await;

    let report = registry.shutdown().await;
    assert_eq!(report.saved, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(stored_text(&store, "doc-a").as_deref(), Some("alpha"));
    assert_eq!(stored_text(&store, "doc-b").as_deref(), Some("beta"));
    assert!(!store.contains("doc-c"));

    // Cancelled debounce timers stay quiet.
    sleep(DEBOUNCE * 2).await;
    assert_eq!(store.save_count(), 2);

    let refused = registry
        .connect(ConnectionHandle::new("dave", "doc-a", Role::Editor))
        .await;
    assert!(matches!(refused, Err(RegistryError::ShuttingDown)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_reports_failures() {
    let (registry, store) = setup();
    let conn = join(&registry, "alice", "doc-42").await;
    type_text(&conn, &Doc::new(), "lost?").await;

    store.set_fail_saves(true);
    let report = registry.shutdown().await;
    assert_eq!(report.saved, 0);
    assert_eq!(report.failed, 1);
}
