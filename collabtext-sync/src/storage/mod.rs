//! Persistence collaborators for document snapshots.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────┐  save (debounced)  ┌───────────────────────────┐
//! │ DocumentCoordinator │ ─────────────────► │ dyn DocumentPersistence   │
//! │ (in-memory, locked) │ ◄───────────────── │                           │
//! └─────────────────────┘   load on first    │  MemoryStore  (HashMap)   │
//!                           access           │  DocumentStore (RocksDB)  │
//!                                            └───────────────────────────┘
//! ```
//!
//! A snapshot is the JSON array form of a [`collabtext_core::Sequence`],
//! sentinels included. Stores treat it as opaque bytes.
//!
//! Next to each snapshot a store keeps one clock reservation per peer: the
//! highest clock that peer may already have stamped on the document. It
//! survives deletes that remove the characters carrying those clocks.

pub mod rocks;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;

use crate::coordinator::DocumentId;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Load/save contract shared by every coordinator in a process.
///
/// Calls are synchronous and short; the coordinator already rate-limits
/// writes.
pub trait DocumentPersistence: Send + Sync {
    /// Stored snapshot, or `None` if the document has never been saved.
    fn load(&self, doc_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError>;

    fn save(&self, doc_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Clock reservation of `peer_id` on the document, `None` if never set.
    fn load_clock(&self, doc_id: &DocumentId, peer_id: &str) -> Result<Option<u64>, StoreError>;

    fn save_clock(&self, doc_id: &DocumentId, peer_id: &str, clock: u64)
        -> Result<(), StoreError>;
}

/// In-memory store for tests and storage-less runs.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<DocumentId, Vec<u8>>>,
    clocks: RwLock<HashMap<(DocumentId, String), u64>>,
    fail_writes: AtomicBool,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn contains(&self, doc_id: &DocumentId) -> bool {
        self.docs
            .read()
            .map(|docs| docs.contains_key(doc_id))
            .unwrap_or(false)
    }
}

impl DocumentPersistence for MemoryStore {
    fn load(&self, doc_id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let docs = self
            .docs
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(docs.get(doc_id).cloned())
    }

    fn save(&self, doc_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        let mut docs = self
            .docs
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        docs.insert(doc_id.clone(), snapshot.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_clock(&self, doc_id: &DocumentId, peer_id: &str) -> Result<Option<u64>, StoreError> {
        let clocks = self
            .clocks
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(clocks.get(&(doc_id.clone(), peer_id.to_string())).copied())
    }

    fn save_clock(
        &self,
        doc_id: &DocumentId,
        peer_id: &str,
        clock: u64,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        let mut clocks = self
            .clocks
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        clocks.insert((doc_id.clone(), peer_id.to_string()), clock);
        Ok(())
    }
}
