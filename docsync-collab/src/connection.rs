//! Per-document connection handling: registration, frame dispatch, fan-out.
//!
//! Every method here runs with the document's session lock held, so frames of
//! one document are applied strictly one after another and never concurrently.

use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::Role;
use crate::broadcast::Outbound;
use crate::document::DocumentSession;
use crate::protocol::{Frame, SyncMessage};

/// Identifier of one live socket.
pub type ConnectionId = Uuid;

/// One authenticated connection to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user: String,
    pub role: Role,
    pub document: String,
}

impl ConnectionHandle {
    pub fn new(user: impl Into<String>, document: impl Into<String>, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: user.into(),
            role,
            document: document.into(),
        }
    }

    pub fn can_edit(&self) -> bool {
        self.role == Role::Editor
    }
}

/// What handling one inbound frame did to the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    /// Document content changed; a save must be scheduled.
    pub content_changed: bool,
    /// A content frame from a read-only connection was dropped.
    pub refused: bool,
}

impl DocumentSession {
    /// Add a connection and queue the initial handshake for it.
    ///
    /// The new connection receives sync step 1 (the server state vector) and,
    /// when anyone is present, the full awareness snapshot.
    pub fn register(&mut self, handle: ConnectionHandle) -> Outbound {
        let id = handle.id;
        log::info!(
            "Document '{}': {} joined as {} ({})",
            self.name,
            handle.user,
            handle.role,
            id
        );
        let outbound = self.peers.add_peer(handle);
        self.last_activity = Instant::now();

        let step1 = Frame::Sync(SyncMessage::Step1(self.crdt.state_vector()));
        self.peers.send_to(&id, Arc::new(step1.encode()));

        if !self.awareness.is_empty() {
            let snapshot = Frame::Awareness(self.awareness.encode_full());
            self.peers.send_to(&id, Arc::new(snapshot.encode()));
        }
        outbound
    }

    /// Decode and apply one inbound frame from `conn`.
    ///
    /// Malformed frames are logged and dropped; the connection stays open.
    pub fn handle_frame(&mut self, conn: &ConnectionHandle, bytes: &[u8]) -> FrameOutcome {
        self.last_activity = Instant::now();
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!(
                    "Document '{}': dropping frame from {}: {}",
                    self.name,
                    conn.id,
                    e
                );
                return FrameOutcome::default();
            }
        };

        match frame {
            Frame::Sync(SyncMessage::Step1(state_vector)) => {
                self.reply_step2(conn, &state_vector);
                FrameOutcome::default()
            }
            Frame::Sync(SyncMessage::Step2(update)) | Frame::Sync(SyncMessage::Update(update)) => {
                self.apply_content(conn, &update)
            }
            Frame::Awareness(update) => {
                self.apply_awareness(conn, &update);
                FrameOutcome::default()
            }
            Frame::QueryAwareness => {
                let snapshot = Frame::Awareness(self.awareness.encode_full());
                self.peers.send_to(&conn.id, Arc::new(snapshot.encode()));
                FrameOutcome::default()
            }
        }
    }

    /// Remove a connection, clear the presence it controlled and tell the
    /// others. Returns the number of connections left.
    pub fn unregister(&mut self, conn: &ConnectionId) -> usize {
        let Some(handle) = self.peers.remove_peer(conn) else {
            return self.peers.peer_count();
        };

        let owned = self.awareness.clients_of(*conn);
        let changes = self.awareness.remove_clients(&owned);
        if !changes.is_empty() {
            let frame = Frame::Awareness(self.awareness.encode_changes(&changes));
            self.peers.broadcast_except(None, Arc::new(frame.encode()));
        }
        self.awareness.prune(*conn);

        let remaining = self.peers.peer_count();
        log::info!(
            "Document '{}': {} left ({} remaining)",
            self.name,
            handle.user,
            remaining
        );
        remaining
    }

    fn reply_step2(&mut self, conn: &ConnectionHandle, state_vector: &[u8]) {
        match self.crdt.diff_since(state_vector) {
            Ok(diff) => {
                let frame = Frame::Sync(SyncMessage::Step2(diff));
                self.peers.send_to(&conn.id, Arc::new(frame.encode()));
            }
            Err(e) => log::warn!(
                "Document '{}': bad state vector from {}: {}",
                self.name,
                conn.id,
                e
            ),
        }
    }

    fn apply_content(&mut self, conn: &ConnectionHandle, update: &[u8]) -> FrameOutcome {
        if !conn.can_edit() {
            // Readers answer the server's step 1 like anyone else.
            if crate::crdt::is_empty_update(update) {
                log::trace!("Document '{}': empty sync reply from reader {}", self.name, conn.id);
                return FrameOutcome::default();
            }
            log::warn!(
                "Document '{}': refused update from read-only connection {} ({})",
                self.name,
                conn.id,
                conn.user
            );
            return FrameOutcome {
                content_changed: false,
                refused: true,
            };
        }

        let applied = match self.crdt.apply_update(update) {
            Ok(applied) => applied,
            Err(e) => {
                log::warn!(
                    "Document '{}': dropping update from {}: {}",
                    self.name,
                    conn.id,
                    e
                );
                return FrameOutcome::default();
            }
        };
        if applied.redundant {
            log::trace!(
                "Document '{}': update from {} already integrated",
                self.name,
                conn.id
            );
            return FrameOutcome::default();
        }

        self.version += 1;
        let frame = Frame::Sync(SyncMessage::Update(applied.delta));
        let delivered = self
            .peers
            .broadcast_except(Some(&conn.id), Arc::new(frame.encode()));
        log::debug!(
            "Document '{}': update from {} ({} bytes) forwarded to {} peers",
            self.name,
            conn.id,
            update.len(),
            delivered
        );
        FrameOutcome {
            content_changed: true,
            refused: false,
        }
    }

    fn apply_awareness(&mut self, conn: &ConnectionHandle, update: &[u8]) {
        match self.awareness.apply_update(update, conn.id) {
            Ok(changes) if changes.is_empty() => {}
            Ok(changes) => {
                let frame = Frame::Awareness(self.awareness.encode_changes(&changes));
                self.peers
                    .broadcast_except(Some(&conn.id), Arc::new(frame.encode()));
            }
            Err(e) => log::warn!(
                "Document '{}': dropping awareness update from {}: {}",
                self.name,
                conn.id,
                e
            ),
        }
    }
}
