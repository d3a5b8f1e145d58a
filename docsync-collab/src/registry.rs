//! Single authority over which documents are loaded.
//!
//! Every document name maps to at most one [`DocumentHandle`]. The first
//! connection to a name loads it; concurrent first connections wait on the
//! same load. When the last connection leaves, the document is flushed and
//! kept for a grace period so a quick reconnect finds it warm. After the grace
//! period it is flushed once more and dropped.
//!
//! Lock order: registry map, then document session.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use crate::broadcast::Outbound;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::document::{DocumentHandle, DocumentSession, DocumentState};
use crate::persistence::{PersistenceError, PersistenceScheduler};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to activate '{document}': {source}")]
    Activation {
        document: String,
        #[source]
        source: PersistenceError,
    },
    #[error("registry is shutting down")]
    ShuttingDown,
}

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub outbound_capacity: usize,
    pub eviction_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            eviction_grace: Duration::from_secs(30),
        }
    }
}

/// A registered connection: the handle, its document and its outbound queue.
pub struct Connection {
    pub handle: ConnectionHandle,
    pub document: Arc<DocumentHandle>,
    pub outbound: Outbound,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }
}

/// Placeholder for a name whose document may still be loading.
#[derive(Default)]
struct DocumentSlot {
    cell: OnceCell<Arc<DocumentHandle>>,
}

/// Outcome of [`DocumentRegistry::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub saved: usize,
    pub failed: usize,
}

pub struct DocumentRegistry {
    documents: Mutex<HashMap<String, Arc<DocumentSlot>>>,
    persistence: Arc<PersistenceScheduler>,
    config: RegistryConfig,
    closing: std::sync::atomic::AtomicBool,
}

impl DocumentRegistry {
    pub fn new(persistence: Arc<PersistenceScheduler>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            documents: Mutex::new(HashMap::new()),
            persistence,
            config,
            closing: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn persistence(&self) -> &Arc<PersistenceScheduler> {
        &self.persistence
    }

    /// Attach a connection to its document, loading the document if needed.
    pub async fn connect(&self, handle: ConnectionHandle) -> Result<Connection, RegistryError> {
        let name = handle.document.clone();
        loop {
            if self.is_closing() {
                return Err(RegistryError::ShuttingDown);
            }

            let slot = {
                let mut documents = self.documents.lock().await;
                Arc::clone(documents.entry(name.clone()).or_default())
            };

            let document = match slot.cell.get_or_try_init(|| self.activate(&name)).await {
                Ok(document) => Arc::clone(document),
                Err(e) => {
                    self.discard_slot(&name, &slot).await;
                    return Err(e);
                }
            };

            let mut session = document.session.lock().await;
            match session.lifecycle {
                // Lost the race with eviction; the slot is already gone.
                DocumentState::Destroyed => continue,
                DocumentState::Draining => {
                    if let Some(eviction) = session.eviction.take() {
                        eviction.abort();
                    }
                    session.lifecycle = DocumentState::Active;
                    log::info!("Document '{}' reactivated", name);
                }
                _ => {}
            }

            let outbound = session.register(handle.clone());
            drop(session);
            return Ok(Connection {
                handle,
                document,
                outbound,
            });
        }
    }

    async fn activate(&self, name: &str) -> Result<Arc<DocumentHandle>, RegistryError> {
        let crdt = self
            .persistence
            .load_session(name)
            .await
            .map_err(|source| RegistryError::Activation {
                document: name.to_string(),
                source,
            })?;
        let session = DocumentSession::new(name, crdt, self.config.outbound_capacity);
        log::info!("Document '{}' activated", name);
        Ok(Arc::new(DocumentHandle::new(
            session,
            Arc::clone(&self.persistence),
        )))
    }

    /// Drop a slot whose load failed, unless someone replaced or filled it.
    async fn discard_slot(&self, name: &str, slot: &Arc<DocumentSlot>) {
        let mut documents = self.documents.lock().await;
        let unchanged = documents
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && current.cell.get().is_none());
        if unchanged {
            documents.remove(name);
        }
    }

    /// Detach a connection. The last one out flushes the document and starts
    /// its eviction countdown.
    pub async fn disconnect(self: &Arc<Self>, document: &Arc<DocumentHandle>, connection: &ConnectionId) {
        let generation = {
            let mut session = document.session.lock().await;
            let remaining = session.unregister(connection);
            if remaining > 0 || session.lifecycle != DocumentState::Active {
                return;
            }
            session.lifecycle = DocumentState::Draining;
            session.generation += 1;
            if let Some(timer) = session.save_timer.take() {
                timer.abort();
            }
            session.generation
        };
        log::info!("Document '{}' draining", document.name());

        // Own task: a cancelled caller must not leave the document without
        // an eviction timer.
        let registry = Arc::clone(self);
        let document = Arc::clone(document);
        let drain = tokio::spawn(async move { registry.drain(document, generation).await });
        if let Err(e) = drain.await {
            log::error!("Drain task failed: {}", e);
        }
    }

    async fn drain(self: Arc<Self>, document: Arc<DocumentHandle>, generation: u64) {
        if let Err(e) = document.flush().await {
            log::error!("Flush of '{}' on last disconnect failed: {}", document.name(), e);
        }

        let mut session = document.session.lock().await;
        if session.lifecycle != DocumentState::Draining || session.generation != generation {
            return;
        }
        let registry = Arc::downgrade(&self);
        let name = document.name().to_string();
        let grace = self.config.eviction_grace;
        session.eviction = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = Weak::upgrade(&registry) {
                registry.evict(&name, generation).await;
            }
        }));
    }

    /// Retire a document that stayed unused through its grace period.
    async fn evict(&self, name: &str, generation: u64) {
        let Some(document) = self.get(name).await else {
            return;
        };
        let still_draining = |session: &DocumentSession| {
            session.lifecycle == DocumentState::Draining
                && session.generation == generation
                && session.peer_count() == 0
        };
        if !still_draining(&*document.session.lock().await) {
            return;
        }

        if let Err(e) = document.flush().await {
            log::error!("Final flush of '{}' failed: {}", name, e);
        }

        let mut documents = self.documents.lock().await;
        let mut session = document.session.lock().await;
        if !still_draining(&*session) {
            return;
        }
        session.lifecycle = DocumentState::Destroyed;
        if let Some(timer) = session.save_timer.take() {
            timer.abort();
        }
        // This task is the eviction timer; dropping its handle does not abort it.
        session.eviction.take();

        let owned = documents.get(name).is_some_and(|slot| {
            slot.cell
                .get()
                .is_some_and(|current| Arc::ptr_eq(current, &document))
        });
        if owned {
            documents.remove(name);
        }
        log::info!("Document '{}' evicted", name);
    }

    /// Loaded document by name.
    pub async fn get(&self, name: &str) -> Option<Arc<DocumentHandle>> {
        let documents = self.documents.lock().await;
        documents.get(name).and_then(|slot| slot.cell.get().cloned())
    }

    pub async fn state(&self, name: &str) -> DocumentState {
        let slot = {
            let documents = self.documents.lock().await;
            match documents.get(name) {
                Some(slot) => Arc::clone(slot),
                None => return DocumentState::Unloaded,
            }
        };
        match slot.cell.get() {
            Some(document) => document.state().await,
            None => DocumentState::Loading,
        }
    }

    /// Names of loaded documents, sorted.
    pub async fn active_documents(&self) -> Vec<String> {
        let documents = self.documents.lock().await;
        let mut names: Vec<String> = documents
            .iter()
            .filter(|(_, slot)| slot.cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Number of names with a slot, loading ones included.
    pub async fn document_count(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Stop accepting connections, cancel timers and flush every document.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.closing.store(true, std::sync::atomic::Ordering::SeqCst);
        let documents: Vec<Arc<DocumentHandle>> = {
            let documents = self.documents.lock().await;
            documents
                .values()
                .filter_map(|slot| slot.cell.get().cloned())
                .collect()
        };

        let mut report = ShutdownReport::default();
        for document in documents {
            document.session.lock().await.cancel_timers();
            match document.flush().await {
                Ok(true) => report.saved += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Shutdown flush of '{}' failed: {}", document.name(), e);
                    report.failed += 1;
                }
            }
        }
        log::info!(
            "Registry shut down: {} saved, {} failed",
            report.saved,
            report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::storage::MemoryStore;

    fn registry(store: Arc<MemoryStore>) -> Arc<DocumentRegistry> {
        let persistence = Arc::new(PersistenceScheduler::new(
            store,
            Duration::from_secs(2),
            Duration::from_secs(5),
        ));
        DocumentRegistry::new(
            persistence,
            RegistryConfig {
                outbound_capacity: 16,
                eviction_grace: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_is_unloaded() {
        let registry = registry(Arc::new(MemoryStore::new()));
        assert_eq!(registry.state("nothing").await, DocumentState::Unloaded);
        assert!(registry.get("nothing").await.is_none());
        assert_eq!(registry.document_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_activates() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let conn = registry
            .connect(ConnectionHandle::new("alice", "doc-1", Role::Editor))
            .await
            .unwrap();

        assert_eq!(registry.state("doc-1").await, DocumentState::Active);
        assert_eq!(registry.active_documents().await, vec!["doc-1"]);
        assert_eq!(conn.document.connection_count().await, 1);
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_leaves_nothing_behind() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_loads(true);
        let registry = registry(store.clone());

        let result = registry
            .connect(ConnectionHandle::new("alice", "doc-1", Role::Editor))
            .await;
        assert!(matches!(result, Err(RegistryError::Activation { .. })));
        assert_eq!(registry.state("doc-1").await, DocumentState::Unloaded);

        // The next attempt retries the load.
        store.set_fail_loads(false);
        registry
            .connect(ConnectionHandle::new("alice", "doc-1", Role::Editor))
            .await
            .unwrap();
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_disconnect_drains() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let conn = registry
            .connect(ConnectionHandle::new("alice", "doc-1", Role::Editor))
            .await
            .unwrap();

        registry.disconnect(&conn.document, &conn.id()).await;
        assert_eq!(registry.state("doc-1").await, DocumentState::Draining);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.state("doc-1").await, DocumentState::Unloaded);
        assert_eq!(conn.document.state().await, DocumentState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_connections() {
        let registry = registry(Arc::new(MemoryStore::new()));
        assert_eq!(registry.shutdown().await, ShutdownReport::default());
        let result = registry
            .connect(ConnectionHandle::new("alice", "doc-1", Role::Editor))
            .await;
        assert!(matches!(result, Err(RegistryError::ShuttingDown)));
    }
}
