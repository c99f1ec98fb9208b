//! Persistence boundary for room documents.
//!
//! ```text
//! ┌──────────┐  load on first join   ┌──────────────────────────────┐
//! │   Hub    │ ◄──────────────────── │ DocumentStore                │
//! │ (rooms)  │ ────────────────────► │  MemoryStore  (tests, dev)   │
//! └──────────┘  persist_snapshot,    │  RocksStore   (CF documents, │
//!               last member leaves   │                CF metadata)  │
//!                                    └──────────────────────────────┘
//! ```
//!
//! A failed save is logged by the caller and retried by the next coalesced
//! snapshot; the store itself does not queue.

pub mod rocks;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use classgraph_core::GraphDocument;
use thiserror::Error;
use uuid::Uuid;

pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
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

pub trait DocumentStore: Send + Sync {
    /// `Ok(None)` for a project that was never saved.
    fn load_document(&self, project_id: Uuid) -> Result<Option<GraphDocument>, StoreError>;

    fn save_document(&self, project_id: Uuid, document: &GraphDocument) -> Result<(), StoreError>;

    /// Push buffered writes to durable storage, e.g. before the process exits.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Volatile store keeping documents in a map.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<Uuid, GraphDocument>>,
    saves: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Make every load and save fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn load_document(&self, project_id: Uuid) -> Result<Option<GraphDocument>, StoreError> {
        self.check_available()?;
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents.get(&project_id).cloned())
    }

    fn save_document(&self, project_id: Uuid, document: &GraphDocument) -> Result<(), StoreError> {
        self.check_available()?;
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.insert(project_id, document.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
