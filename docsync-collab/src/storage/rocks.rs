//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: full document snapshots (LZ4 compressed), keyed by name
//! - `metadata`: bookkeeping per document (bincode)
//!
//! RocksDB calls block, so the [`ContentStore`] impl runs them on the blocking
//! pool. The synchronous methods are public for tooling and tests.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::{ContentStore, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub name: String,
    /// Number of snapshots written
    pub save_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(name: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_string(),
            save_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

struct StoreInner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

/// Durable store for document snapshots. Cheap to clone.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

impl DocumentStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(StoreInner { db, config }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are already LZ4 frames.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Write a snapshot and its metadata in one batch.
    pub fn save_snapshot(&self, name: &str, snapshot: &[u8]) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(name)?
            .unwrap_or_else(|| DocumentMetadata::new(name));
        meta.save_count += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, name.as_bytes(), &compressed);
        batch.put_cf(cf_meta, name.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.inner.config.sync_writes);
        self.inner.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Stored '{}': {} bytes ({} compressed)",
            name,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Latest snapshot, decompressed.
    pub fn load_snapshot(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.inner.db.get_cf(cf, name.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn load_metadata(&self, name: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.inner
            .db
            .get_cf(cf, name.as_bytes())?
            .map(|bytes| DocumentMetadata::decode(&bytes))
            .transpose()
    }

    pub fn document_exists(&self, name: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.inner.db.get_cf(cf, name.as_bytes())?.is_some())
    }

    /// Names of all stored documents, in key order.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            names.push(name);
        }
        Ok(names)
    }

    pub fn delete_document(&self, name: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, name.as_bytes());
        batch.delete_cf(cf_meta, name.as_bytes());
        self.inner.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.inner
            .db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl ContentStore for DocumentStore {
    async fn load(&self, document: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let store = self.clone();
        let name = document.to_string();
        tokio::task::spawn_blocking(move || store.load_snapshot(&name)).await?
    }

    async fn save(&self, document: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let store = self.clone();
        let name = document.to_string();
        let snapshot = snapshot.to_vec();
        tokio::task::spawn_blocking(move || store.save_snapshot(&name, &snapshot).map(|_| ())).await?
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let data = b"Snapshot of doc-42 with enough repeated bytes bytes bytes to compress.".to_vec();

        let meta = store.save_snapshot("doc-42", &data).unwrap();
        assert_eq!(meta.name, "doc-42");
        assert_eq!(meta.save_count, 1);
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.load_snapshot("doc-42").unwrap(), Some(data));
    }

    #[test]
    fn test_snapshot_missing() {
        let (_dir, store) = open_temp();
        assert_eq!(store.load_snapshot("missing").unwrap(), None);
        assert_eq!(store.load_metadata("missing").unwrap(), None);
    }

    #[test]
    fn test_overwrite_bumps_save_count() {
        let (_dir, store) = open_temp();
        store.save_snapshot("doc", b"v1").unwrap();
        let meta = store.save_snapshot("doc", b"version two").unwrap();

        assert_eq!(meta.save_count, 2);
        assert_eq!(meta.snapshot_size, 11);
        assert!(meta.updated_at >= meta.created_at);
        assert_eq!(store.load_snapshot("doc").unwrap(), Some(b"version two".to_vec()));
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_temp();
        for name in ["beta", "alpha", "gamma"] {
            store.save_snapshot(name, name.as_bytes()).unwrap();
        }
        assert_eq!(store.list_documents().unwrap(), vec!["alpha", "beta", "gamma"]);

        store.delete_document("beta").unwrap();
        assert!(!store.document_exists("beta").unwrap());
        assert_eq!(store.load_snapshot("beta").unwrap(), None);
        assert_eq!(store.list_documents().unwrap(), vec!["alpha", "gamma"]);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot("durable", b"still here").unwrap();
            store.sync().unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_snapshot("durable").unwrap(), Some(b"still here".to_vec()));
    }

    #[test]
    fn test_large_snapshot_compresses() {
        let (_dir, store) = open_temp();
        let data = vec![42u8; 1_000_000];
        let meta = store.save_snapshot("large", &data).unwrap();
        assert!(meta.compressed_size < 100_000);
        assert_eq!(store.load_snapshot("large").unwrap().map(|d| d.len()), Some(1_000_000));
    }

    #[tokio::test]
    async fn test_content_store_impl() {
        let (_dir, store) = open_temp();
        let content: &dyn ContentStore = &store;
        assert_eq!(content.load("doc").await.unwrap(), None);
        content.save("doc", b"bytes").await.unwrap();
        assert_eq!(content.load("doc").await.unwrap(), Some(b"bytes".to_vec()));
        assert!(store.document_exists("doc").unwrap());
    }
}
