//! # docsync-collab: Real-time collaborative document synchronization
//!
//! Lets any number of editors change the same document concurrently and
//! converge on identical content, relays presence between them, and persists
//! each document without losing edits or hammering the store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ y-websocket │ ◄─────────────────► │ SyncServer  │
//! │ client      │  lib0 binary frames │ (AuthGate)  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ connect / disconnect
//!                                            ▼
//!                                   ┌──────────────────┐
//!                                   │ DocumentRegistry │── one handle per name
//!                                   └────────┬─────────┘
//!                                            ▼
//!                     ┌───────────────────────────────────────────┐
//!                     │ DocumentSession (behind one async mutex)  │
//!                     │  CrdtSession · AwarenessTracker ·         │
//!                     │  BroadcastGroup · save / eviction timers  │
//!                     └──────────────────────┬────────────────────┘
//!                                            ▼
//!                              PersistenceScheduler ── ContentStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire format (sync, awareness, close codes)
//! - [`awareness`]: per-document presence map with per-connection ownership
//! - [`crdt`]: replicated document state (Yrs)
//! - [`connection`] / [`broadcast`]: dispatch and bounded fan-out
//! - [`document`]: session state and lifecycle
//! - [`persistence`] / [`storage`]: debounced saves, memory and RocksDB stores
//! - [`registry`]: activation, reuse, eviction, shutdown
//! - [`auth`]: JWT verification
//! - [`config`] / [`server`]: configuration and the WebSocket server

pub mod auth;
pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod crdt;
pub mod document;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, AuthGate, Claims, Grant, Role};
pub use awareness::{AwarenessChanges, AwarenessTracker};
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound, OutboundFrame};
pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnectionHandle, ConnectionId, FrameOutcome};
pub use crdt::{AppliedUpdate, CrdtError, CrdtSession};
pub use document::{DocumentHandle, DocumentSession, DocumentState};
pub use persistence::{PersistenceError, PersistenceScheduler};
pub use protocol::{
    decode_entries, encode_entries, CloseReason, Frame, MessageKind, PresenceEntry,
    ProtocolError, SyncMessage,
};
pub use registry::{Connection, DocumentRegistry, RegistryConfig, RegistryError, ShutdownReport};
pub use server::{ConnectParams, ServerError, ServerStats, SyncServer};
pub use storage::{
    ContentStore, DocumentMetadata, DocumentStore, MemoryStore, StoreConfig, StoreError,
};
