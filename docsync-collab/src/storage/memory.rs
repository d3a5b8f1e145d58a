//! In-process content store.
//!
//! Used when no storage path is configured, and by tests: it counts calls,
//! records when each save happened and can be told to fail or stall.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::{ContentStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Vec<u8>>>,
    save_log: Mutex<Vec<(String, Instant)>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    load_delay: Mutex<Option<Duration>>,
    save_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a snapshot without counting it as a save.
    pub fn insert(&self, document: &str, snapshot: Vec<u8>) {
        lock(&self.documents).insert(document.to_string(), snapshot);
    }

    pub fn get(&self, document: &str) -> Option<Vec<u8>> {
        lock(&self.documents).get(document).cloned()
    }

    pub fn contains(&self, document: &str) -> bool {
        lock(&self.documents).contains_key(document)
    }

    /// Number of `load` calls, failed ones included.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Completion time of every successful save of `document`.
    pub fn save_times(&self, document: &str) -> Vec<Instant> {
        lock(&self.save_log)
            .iter()
            .filter(|(name, _)| name == document)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every load take `delay` before answering.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *lock(&self.load_delay) = delay;
    }

    /// Make every save take `delay` before completing.
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        *lock(&self.save_delay) = delay;
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn load(&self, document: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.load_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("load of '{document}' failed")));
        }
        Ok(self.get(document))
    }

    async fn save(&self, document: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let delay = *lock(&self.save_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("save of '{document}' failed")));
        }
        lock(&self.documents).insert(document.to_string(), snapshot.to_vec());
        lock(&self.save_log).push((document.to_string(), Instant::now()));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let store = MemoryStore::new();
        assert_eq!(store.load("nothing").await.unwrap(), None);
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryStore::new();
        store.save("doc", b"snapshot").await.unwrap();
        assert_eq!(store.load("doc").await.unwrap(), Some(b"snapshot".to_vec()));
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.save_times("doc").len(), 1);
        assert!(store.save_times("other").is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.set_fail_saves(true);
        assert!(store.save("doc", b"x").await.is_err());
        assert_eq!(store.save_count(), 0);
        assert!(!store.contains("doc"));

        store.set_fail_saves(false);
        store.set_fail_loads(true);
        store.save("doc", b"x").await.unwrap();
        assert!(matches!(store.load("doc").await, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_delay() {
        let store = MemoryStore::new();
        store.set_load_delay(Some(Duration::from_millis(500)));
        let start = Instant::now();
        store.load("doc").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
