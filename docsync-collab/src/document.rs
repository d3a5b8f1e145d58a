//! Server-side state of one active document.
//!
//! A [`DocumentHandle`] is shared by the registry, every connection task and
//! the timers of that document. All mutable state sits in [`DocumentSession`]
//! behind a single async mutex.

use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::awareness::AwarenessTracker;
use crate::broadcast::{BroadcastGroup, BroadcastStats};
use crate::connection::{ConnectionHandle, FrameOutcome};
use crate::crdt::CrdtSession;
use crate::persistence::PersistenceScheduler;

/// Lifecycle of a document name.
///
/// ```text
/// Unloaded ──connect──► Loading ──load ok──► Active ◄──reconnect──┐
///     ▲                    │                   │                  │
///     │                 load err          last disconnect         │
///     └────────────────────┘                   ▼                  │
///     ▲                                    Draining ──────────────┘
///     │                                        │ grace elapsed
///     └────────────── Destroyed ◄──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentState {
    Unloaded,
    Loading,
    Active,
    Draining,
    Destroyed,
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentState::Unloaded => "unloaded",
            DocumentState::Loading => "loading",
            DocumentState::Active => "active",
            DocumentState::Draining => "draining",
            DocumentState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Mutable state of one document. Only reachable through the session lock.
pub struct DocumentSession {
    pub(crate) name: String,
    pub(crate) crdt: CrdtSession,
    pub(crate) peers: BroadcastGroup,
    pub(crate) awareness: AwarenessTracker,
    /// Pending debounced save.
    pub(crate) save_timer: Option<JoinHandle<()>>,
    /// Pending eviction countdown.
    pub(crate) eviction: Option<JoinHandle<()>>,
    pub(crate) lifecycle: DocumentState,
    /// Bumped every time the document starts draining; stale eviction timers
    /// compare against it.
    pub(crate) generation: u64,
    /// Count of applied content changes.
    pub(crate) version: u64,
    /// Highest `version` known to be persisted.
    pub(crate) saved_version: u64,
    pub(crate) last_activity: Instant,
}

impl DocumentSession {
    pub fn new(name: impl Into<String>, crdt: CrdtSession, outbound_capacity: usize) -> Self {
        Self {
            name: name.into(),
            crdt,
            peers: BroadcastGroup::new(outbound_capacity),
            awareness: AwarenessTracker::new(),
            save_timer: None,
            eviction: None,
            lifecycle: DocumentState::Active,
            generation: 0,
            version: 0,
            saved_version: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crdt(&self) -> &CrdtSession {
        &self.crdt
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn lifecycle(&self) -> DocumentState {
        self.lifecycle
    }

    pub fn peer_count(&self) -> usize {
        self.peers.peer_count()
    }

    pub fn peers(&self) -> Vec<ConnectionHandle> {
        self.peers.peers()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.peers.stats()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether content changed since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.version != self.saved_version
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn has_pending_save(&self) -> bool {
        self.save_timer.is_some()
    }

    /// Abort both timers. Used when the document is retired.
    pub(crate) fn cancel_timers(&mut self) {
        if let Some(timer) = self.save_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.eviction.take() {
            timer.abort();
        }
    }
}

/// Shared handle to an active document.
pub struct DocumentHandle {
    name: String,
    pub(crate) session: Mutex<DocumentSession>,
    /// Serializes saves of this document.
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) persistence: Arc<PersistenceScheduler>,
}

impl DocumentHandle {
    pub fn new(session: DocumentSession, persistence: Arc<PersistenceScheduler>) -> Self {
        Self {
            name: session.name.clone(),
            session: Mutex::new(session),
            flush_lock: Mutex::new(()),
            persistence,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the session for inspection.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, DocumentSession> {
        self.session.lock().await
    }

    /// Handle one inbound frame and schedule a save if content changed.
    pub async fn receive(self: &Arc<Self>, conn: &ConnectionHandle, bytes: &[u8]) -> FrameOutcome {
        let mut session = self.session.lock().await;
        let outcome = session.handle_frame(conn, bytes);
        if outcome.content_changed {
            self.schedule_save(&mut session);
        }
        outcome
    }

    pub async fn state(&self) -> DocumentState {
        self.session.lock().await.lifecycle
    }

    pub async fn connection_count(&self) -> usize {
        self.session.lock().await.peer_count()
    }

    /// Materialized text of a root type, for diagnostics.
    pub async fn text(&self, root: &str) -> String {
        self.session.lock().await.crdt.text(root)
    }
}

impl fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
