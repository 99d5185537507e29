//! RocksDB-backed snapshot persistence.
//!
//! Column families:
//! - `snapshots` full document state, LZ4 compressed, keyed by document name
//! - `metadata`  sizes, save count and timestamps per document
//!
//! RocksDB calls block, so [`RocksPersistence`] runs them on the blocking
//! pool and never on the event loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use serde::{Deserialize, Serialize};

use crate::hooks::{Persistence, PersistenceError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct RocksConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flux_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub doc: String,
    /// Number of saves so far.
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl SnapshotMetadata {
    fn new(doc: &str) -> Self {
        let now = now_secs();
        Self {
            doc: doc.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Codec(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Backend(e.to_string())
    }
}

/// Synchronous snapshot store.
pub struct RocksStore {
    db: DB,
    config: RocksConfig,
}

impl RocksStore {
    /// Open or create the database at the configured path.
    pub fn open(config: RocksConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        match name {
            // Values are already LZ4 compressed.
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    /// Replace the snapshot of `doc`. Snapshot and metadata land in one batch.
    pub fn save_snapshot(
        &self,
        doc: &str,
        snapshot: &[u8],
    ) -> Result<SnapshotMetadata, PersistenceError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(doc)?
            .unwrap_or_else(|| SnapshotMetadata::new(doc));
        meta.version += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, doc.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    pub fn load_snapshot(&self, doc: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, doc.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| PersistenceError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn load_metadata(&self, doc: &str) -> Result<Option<SnapshotMetadata>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc.as_bytes())? {
            Some(bytes) => SnapshotMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Names of every stored document.
    pub fn list_documents(&self) -> Result<Vec<String>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        let mut docs = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            match String::from_utf8(key.to_vec()) {
                Ok(name) => docs.push(name),
                Err(_) => log::warn!("skipping non-utf8 document key"),
            }
        }
        Ok(docs)
    }

    pub fn delete_document(&self, doc: &str) -> Result<(), PersistenceError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snapshots, doc.as_bytes());
        batch.delete_cf(&cf_meta, doc.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Backend(format!("column family '{name}' not found")))
    }
}

/// [`Persistence`] over a [`RocksStore`].
#[derive(Clone)]
pub struct RocksPersistence {
    store: Arc<RocksStore>,
}

impl RocksPersistence {
    pub fn open(config: RocksConfig) -> Result<Self, PersistenceError> {
        Ok(Self {
            store: Arc::new(RocksStore::open(config)?),
        })
    }

    pub fn store(&self) -> &RocksStore {
        &self.store
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksStore) -> Result<T, PersistenceError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl Persistence for RocksPersistence {
    async fn load(&self, doc: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let doc = doc.to_string();
        self.blocking(move |store| store.load_snapshot(&doc)).await
    }

    async fn save(&self, doc: &str, state: &[u8]) -> Result<(), PersistenceError> {
        let doc = doc.to_string();
        let state = state.to_vec();
        let meta = self
            .blocking(move |store| store.save_snapshot(&doc, &state))
            .await?;
        log::debug!(
            "saved {} v{} ({} -> {} bytes)",
            meta.doc,
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(RocksConfig::for_testing(dir.path())).unwrap();
        (store, dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (store, dir) = open();
        assert_eq!(store.path(), dir.path());
        assert!(store.cf(CF_SNAPSHOTS).is_ok());
        assert!(store.cf(CF_METADATA).is_ok());
    }

    #[test]
    fn test_snapshot_save_load() {
        let (store, _dir) = open();
        let snapshot = b"hello collaborative world".repeat(100);

        let meta = store.save_snapshot("room-1", &snapshot).unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.snapshot_size, snapshot.len() as u64);
        assert!(meta.compressed_size < meta.snapshot_size);

        assert_eq!(store.load_snapshot("room-1").unwrap(), Some(snapshot));
        assert_eq!(store.load_snapshot("missing").unwrap(), None);
    }

    #[test]
    fn test_resave_bumps_version_and_keeps_created_at() {
        let (store, _dir) = open();
        let first = store.save_snapshot("doc", b"v1").unwrap();
        let second = store.save_snapshot("doc", b"v2 longer").unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(store.load_snapshot("doc").unwrap(), Some(b"v2 longer".to_vec()));
        assert_eq!(store.load_metadata("doc").unwrap(), Some(second));
    }

    #[test]
    fn test_list_and_delete() {
        let (store, _dir) = open();
        store.save_snapshot("a", b"1").unwrap();
        store.save_snapshot("b", b"2").unwrap();

        let mut docs = store.list_documents().unwrap();
        docs.sort();
        assert_eq!(docs, vec!["a".to_string(), "b".to_string()]);

        store.delete_document("a").unwrap();
        assert_eq!(store.load_snapshot("a").unwrap(), None);
        assert_eq!(store.list_documents().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(RocksConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot("durable", b"state").unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(RocksConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_snapshot("durable").unwrap(), Some(b"state".to_vec()));
    }

    #[tokio::test]
    async fn test_persistence_trait_roundtrip() {
        let dir = TempDir::new().unwrap();
        let persistence = RocksPersistence::open(RocksConfig::for_testing(dir.path())).unwrap();

        assert_eq!(persistence.load("room").await.unwrap(), None);
        persistence.save("room", &[1, 2, 3]).await.unwrap();
        assert_eq!(persistence.load("room").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(
            persistence.store().load_metadata("room").unwrap().map(|m| m.version),
            Some(1)
        );
    }
}
