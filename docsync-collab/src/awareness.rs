//! Per-document presence ("awareness") tracking.
//!
//! ```text
//! Connection A ── update {client 7} ──► AwarenessTracker ──► changes {7}
//!                                          │                    │
//!                                          │ owners: 7 → A      ▼
//!                                          │           encode_changes()
//!                                          ▼                    │
//!                                   states: 7 → {clock, json}   ▼
//!                                                      Connections B, C
//! ```
//!
//! Entries merge per client id; a higher clock wins, and an equal clock
//! carrying `null` removes a live entry. Every client id is controlled by the
//! connection that first announced it, and only that connection may update
//! or remove it. The departing connection's ids are cleared on close, and
//! once that removal is out its tombstones are dropped.

use std::collections::HashMap;

use crate::connection::ConnectionId;
use crate::protocol::{decode_entries, encode_entries, PresenceEntry, ProtocolError};

#[derive(Debug, Clone)]
struct ClientPresence {
    clock: u32,
    state: Option<String>,
    /// Connection that wrote this entry last.
    writer: ConnectionId,
}

/// Client ids changed by an awareness operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All changed ids, in added, updated, removed order.
    pub fn changed(&self) -> impl Iterator<Item = u64> + '_ {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// Presence map for one document.
#[derive(Debug, Default)]
pub struct AwarenessTracker {
    /// Known clients; removed clients keep their clock so stale updates lose
    /// until their writer disconnects.
    states: HashMap<u64, ClientPresence>,
    /// Which connection controls which client id.
    owners: HashMap<u64, ConnectionId>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an encoded awareness update sent by `origin`.
    pub fn apply_update(
        &mut self,
        update: &[u8],
        origin: ConnectionId,
    ) -> Result<AwarenessChanges, ProtocolError> {
        let entries = decode_entries(update)?;
        let mut changes = AwarenessChanges::default();

        for entry in entries {
            match self.owners.get(&entry.client_id) {
                Some(owner) if *owner != origin => {
                    log::warn!(
                        "Awareness: connection {origin} tried to update client {} owned by {owner}",
                        entry.client_id
                    );
                    continue;
                }
                _ => {}
            }

            let current = self.states.get(&entry.client_id);
            let accepted = match current {
                None => true,
                Some(prev) => {
                    prev.clock < entry.clock
                        || (prev.clock == entry.clock
                            && entry.state.is_none()
                            && prev.state.is_some())
                }
            };
            if !accepted {
                log::trace!("Awareness: stale entry for client {}", entry.client_id);
                continue;
            }

            let was_present = current.is_some_and(|p| p.state.is_some());
            match (&entry.state, was_present) {
                (Some(_), false) => changes.added.push(entry.client_id),
                (Some(_), true) => changes.updated.push(entry.client_id),
                (None, true) => changes.removed.push(entry.client_id),
                // Removal of a client we never saw: record the clock only.
                (None, false) => {}
            }

            if entry.state.is_some() {
                self.owners.insert(entry.client_id, origin);
            } else {
                self.owners.remove(&entry.client_id);
            }
            self.states.insert(
                entry.client_id,
                ClientPresence {
                    clock: entry.clock,
                    state: entry.state,
                    writer: origin,
                },
            );
        }

        Ok(changes)
    }

    /// Clear the given clients (used when their connection closes).
    pub fn remove_clients(&mut self, client_ids: &[u64]) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();
        for id in client_ids {
            self.owners.remove(id);
            if let Some(presence) = self.states.get_mut(id) {
                if presence.state.take().is_some() {
                    // At the ceiling, peers still accept `null` at an equal clock.
                    presence.clock = presence.clock.saturating_add(1);
                    changes.removed.push(*id);
                }
            }
        }
        changes
    }

    /// Forget the tombstones last written by `connection`. Call after its
    /// removals have been broadcast. Returns how many were dropped.
    pub fn prune(&mut self, connection: ConnectionId) -> usize {
        let before = self.states.len();
        self.states
            .retain(|_, p| p.state.is_some() || p.writer != connection);
        before - self.states.len()
    }

    /// Client ids controlled by a connection.
    pub fn clients_of(&self, connection: ConnectionId) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == connection)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Encode every live client, for connections that just joined.
    pub fn encode_full(&self) -> Vec<u8> {
        let mut entries: Vec<PresenceEntry> = self
            .states
            .iter()
            .filter_map(|(id, p)| {
                p.state.as_ref().map(|state| PresenceEntry {
                    client_id: *id,
                    clock: p.clock,
                    state: Some(state.clone()),
                })
            })
            .collect();
        entries.sort_unstable_by_key(|e| e.client_id);
        encode_entries(&entries)
    }

    /// Encode only the changed clients.
    pub fn encode_changes(&self, changes: &AwarenessChanges) -> Vec<u8> {
        let entries: Vec<PresenceEntry> = changes
            .changed()
            .filter_map(|id| {
                self.states.get(&id).map(|p| PresenceEntry {
                    client_id: id,
                    clock: p.clock,
                    state: p.state.clone(),
                })
            })
            .collect();
        encode_entries(&entries)
    }

    /// Presence blob of a live client.
    pub fn state(&self, client_id: u64) -> Option<&str> {
        self.states.get(&client_id).and_then(|p| p.state.as_deref())
    }

    /// Number of live clients.
    pub fn len(&self) -> usize {
        self.states.values().filter(|p| p.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
