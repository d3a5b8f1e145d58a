//! Loading and saving documents through the content store.
//!
//! Every store call runs under its own timeout. Saves are debounced per
//! document: each applied edit re-arms a single timer, so a burst of edits
//! produces one save `debounce` after the last of them. Flushes of one document
//! never overlap, and each runs in its own task so that dropping a caller
//! (a closing socket, an aborted timer) never interrupts a save in flight.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::crdt::{CrdtError, CrdtSession};
use crate::document::{DocumentHandle, DocumentSession};
use crate::storage::{ContentStore, StoreError};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{operation} of '{document}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        document: String,
        timeout: Duration,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored snapshot of '{document}' is corrupt: {source}")]
    CorruptSnapshot {
        document: String,
        #[source]
        source: CrdtError,
    },
    #[error("flush task failed: {0}")]
    Task(String),
}

/// Store access policy shared by all documents.
pub struct PersistenceScheduler {
    store: Arc<dyn ContentStore>,
    debounce: Duration,
    io_timeout: Duration,
}

impl PersistenceScheduler {
    pub fn new(store: Arc<dyn ContentStore>, debounce: Duration, io_timeout: Duration) -> Self {
        Self {
            store,
            debounce,
            io_timeout,
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Fetch the stored snapshot of `document`.
    pub async fn load(&self, document: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match tokio::time::timeout(self.io_timeout, self.store.load(document)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(self.timeout("load", document)),
        }
    }

    /// Replace the stored snapshot of `document`.
    pub async fn save(&self, document: &str, snapshot: &[u8]) -> Result<(), PersistenceError> {
        match tokio::time::timeout(self.io_timeout, self.store.save(document, snapshot)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(self.timeout("save", document)),
        }
    }

    /// Build the replica of `document` from its stored snapshot, or an empty
    /// one if it was never saved.
    pub async fn load_session(&self, document: &str) -> Result<CrdtSession, PersistenceError> {
        match self.load(document).await? {
            Some(snapshot) => {
                let session = CrdtSession::from_snapshot(&snapshot).map_err(|source| {
                    PersistenceError::CorruptSnapshot {
                        document: document.to_string(),
                        source,
                    }
                })?;
                log::info!("Loaded '{}' ({} bytes)", document, snapshot.len());
                Ok(session)
            }
            None => {
                log::info!("'{}' not in store, starting empty", document);
                Ok(CrdtSession::new())
            }
        }
    }

    fn timeout(&self, operation: &'static str, document: &str) -> PersistenceError {
        PersistenceError::Timeout {
            operation,
            document: document.to_string(),
            timeout: self.io_timeout,
        }
    }
}

impl DocumentHandle {
    /// (Re)arm the debounced save. Must be called with the session locked.
    pub(crate) fn schedule_save(self: &Arc<Self>, session: &mut DocumentSession) {
        if let Some(previous) = session.save_timer.take() {
            previous.abort();
        }

        let handle = Arc::clone(self);
        let delay = self.persistence.debounce();
        session.save_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Past this point the timer can no longer be aborted by a re-arm.
            handle.session.lock().await.save_timer.take();
            if let Err(e) = handle.flush_now().await {
                log::error!("Debounced save of '{}' failed: {}", handle.name(), e);
            }
        }));
    }

    /// Save pending changes, if any. Returns whether a save happened.
    ///
    /// The save runs in a separate task; cancelling the returned future does
    /// not cancel it.
    pub async fn flush(self: &Arc<Self>) -> Result<bool, PersistenceError> {
        let handle = Arc::clone(self);
        tokio::spawn(async move { handle.flush_now().await })
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }

    async fn flush_now(&self) -> Result<bool, PersistenceError> {
        let _serial = self.flush_lock.lock().await;

        let (snapshot, version) = {
            let session = self.session.lock().await;
            if !session.is_dirty() {
                return Ok(false);
            }
            (session.crdt.encode_state_as_update(), session.version)
        };

        self.persistence.save(self.name(), &snapshot).await?;

        let mut session = self.session.lock().await;
        session.saved_version = session.saved_version.max(version);
        log::debug!(
            "Saved '{}' at version {} ({} bytes)",
            self.name(),
            version,
            snapshot.len()
        );
        Ok(true)
    }
}
