//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents` — serialized sequences (LZ4 compressed, keyed by document id)
//! - `metadata`  — per-document bookkeeping (bincode: timestamps, sizes, save count)
//! - `clocks`    — per-peer clock reservations (big-endian u64, keyed by `{doc}\0{peer}`)
//!
//! Both are written in one `WriteBatch`, so a snapshot and its metadata never
//! disagree after a crash.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{DocumentPersistence, StoreError};
use crate::coordinator::DocumentId;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_CLOCKS: &str = "clocks";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_CLOCKS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collabtext.db"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `path` with default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    /// Number of snapshots written so far
    pub save_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &DocumentId) -> Self {
        let now = unix_now();
        Self {
            doc_id: doc_id.to_string(),
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

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
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
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA | CF_CLOCKS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Document Snapshots ───────────────────────────────────────────

    /// Save a serialized sequence (LZ4 compressed) and bump its metadata.
    pub fn save_snapshot(
        &self,
        doc_id: &DocumentId,
        snapshot: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = match self.load_metadata(doc_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(doc_id),
            Err(e) => return Err(e),
        };
        meta.save_count += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = doc_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved {doc_id}: {} bytes ({} compressed)",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load a serialized sequence, or `None` if never saved.
    pub fn load_snapshot(&self, doc_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, doc_id: &DocumentId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: &DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id.clone())),
        }
    }

    /// List every stored document id. Keys that are not valid ids are skipped.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            match std::str::from_utf8(&key).ok().map(DocumentId::parse) {
                Some(Ok(id)) => doc_ids.push(id),
                _ => log::warn!("Skipping unreadable document key ({} bytes)", key.len()),
            }
        }

        Ok(doc_ids)
    }

    /// Delete a document, its metadata and its clock reservations.
    pub fn delete_document(&self, doc_id: &DocumentId) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_clocks = self.cf(CF_CLOCKS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());

        let prefix = clock_prefix(doc_id);
        let from = IteratorMode::From(&prefix, Direction::Forward);
        for item in self.db.iterator_cf(&cf_clocks, from) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_clocks, key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    // ─── Clock Reservations ───────────────────────────────────────────

    pub fn load_clock_reservation(
        &self,
        doc_id: &DocumentId,
        peer_id: &str,
    ) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_CLOCKS)?;
        match self.db.get_cf(&cf, clock_key(doc_id, peer_id))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Deserialization(format!(
                        "clock of {peer_id} on {doc_id} is {} bytes",
                        bytes.len()
                    ))
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Record a clock reservation. Always synced: a lost reservation could
    /// hand out an id twice.
    pub fn save_clock_reservation(
        &self,
        doc_id: &DocumentId,
        peer_id: &str,
        clock: u64,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_CLOCKS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(&cf, clock_key(doc_id, peer_id), clock.to_be_bytes(), &write_opts)?;
        log::debug!("Reserved clocks up to {clock} for {peer_id} on {doc_id}");
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl DocumentPersistence for DocumentStore {
    fn load(&self, doc_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        self.load_snapshot(doc_id)
    }

    fn save(&self, doc_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        self.save_snapshot(doc_id, snapshot).map(|_| ())
    }

    fn load_clock(&self, doc_id: &DocumentId, peer_id: &str) -> Result<Option<u64>, StoreError> {
        self.load_clock_reservation(doc_id, peer_id)
    }

    fn save_clock(
        &self,
        doc_id: &DocumentId,
        peer_id: &str,
        clock: u64,
    ) -> Result<(), StoreError> {
        self.save_clock_reservation(doc_id, peer_id, clock)
    }
}

/// Document ids never contain NUL, so one document's keys never prefix
/// another's.
fn clock_prefix(doc_id: &DocumentId) -> Vec<u8> {
    let mut key = doc_id.as_bytes().to_vec();
    key.push(0);
    key
}

fn clock_key(doc_id: &DocumentId, peer_id: &str) -> Vec<u8> {
    let mut key = clock_prefix(doc_id);
    key.extend_from_slice(peer_id.as_bytes());
    key
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
