//! Fan-out to the live connections of one document.
//!
//! Each connection owns a bounded outbound buffer drained by its socket task.
//! Sending is a non-blocking `try_send`, so a stalled client never holds up the
//! document or its other peers. A peer whose buffer overflows is detached: its
//! sender is dropped, the socket task sees the channel close and terminates the
//! connection, and the client resynchronizes from scratch when it reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Encoded frame shared between all receivers.
pub type OutboundFrame = Arc<Vec<u8>>;

/// Receiving half handed to a connection's socket task.
pub type Outbound = mpsc::Receiver<OutboundFrame>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub detached_peers: u64,
    pub active_peers: usize,
}

struct Peer {
    handle: ConnectionHandle,
    /// `None` once the peer has been detached.
    sender: Option<mpsc::Sender<OutboundFrame>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Queued,
    /// Peer was already detached.
    Dropped,
    /// This attempt detached the peer.
    Detached,
}

impl Peer {
    fn deliver(&mut self, frame: OutboundFrame) -> Delivery {
        let Some(sender) = self.sender.as_ref() else {
            return Delivery::Dropped;
        };
        match sender.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "Outbound buffer full for connection {} ({}), detaching",
                    self.handle.id,
                    self.handle.user
                );
                self.sender = None;
                Delivery::Detached
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Connection {} stopped reading, detaching", self.handle.id);
                self.sender = None;
                Delivery::Detached
            }
        }
    }
}

/// Connection set of a single document.
///
/// Owned by the document session, so it is only touched under the session lock.
pub struct BroadcastGroup {
    peers: HashMap<ConnectionId, Peer>,
    /// Frames buffered per connection before it is detached.
    capacity: usize,
    frames_sent: u64,
    frames_dropped: u64,
    detached_peers: u64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            capacity: capacity.max(1),
            frames_sent: 0,
            frames_dropped: 0,
            detached_peers: 0,
        }
    }

    /// Add a peer and return the receiver its socket task drains.
    pub fn add_peer(&mut self, handle: ConnectionHandle) -> Outbound {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.peers.insert(
            handle.id,
            Peer {
                handle,
                sender: Some(sender),
            },
        );
        receiver
    }

    pub fn remove_peer(&mut self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.peers.remove(id).map(|peer| peer.handle)
    }

    /// Queue a frame for one peer. Returns whether it was queued.
    pub fn send_to(&mut self, id: &ConnectionId, frame: OutboundFrame) -> bool {
        let Some(peer) = self.peers.get_mut(id) else {
            return false;
        };
        let delivery = peer.deliver(frame);
        self.record(delivery);
        delivery == Delivery::Queued
    }

    /// Queue a frame for every peer except `origin`.
    ///
    /// Returns the number of peers the frame was queued for.
    pub fn broadcast_except(&mut self, origin: Option<&ConnectionId>, frame: OutboundFrame) -> usize {
        let outcomes: Vec<Delivery> = self
            .peers
            .iter_mut()
            .filter(|(id, _)| Some(*id) != origin)
            .map(|(_, peer)| peer.deliver(frame.clone()))
            .collect();

        let mut queued = 0;
        for delivery in outcomes {
            if delivery == Delivery::Queued {
                queued += 1;
            }
            self.record(delivery);
        }
        queued
    }

    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Queued => self.frames_sent += 1,
            Delivery::Dropped => self.frames_dropped += 1,
            Delivery::Detached => {
                self.frames_dropped += 1;
                self.detached_peers += 1;
            }
        }
    }

    /// Number of registered peers, detached ones included until they unregister.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn has_peer(&self, id: &ConnectionId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn peer(&self, id: &ConnectionId) -> Option<&ConnectionHandle> {
        self.peers.get(id).map(|p| &p.handle)
    }

    pub fn peers(&self) -> Vec<ConnectionHandle> {
        self.peers.values().map(|p| p.handle.clone()).collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent,
            frames_dropped: self.frames_dropped,
            detached_peers: self.detached_peers,
            active_peers: self.peers.len(),
        }
    }
}
