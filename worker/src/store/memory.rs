//! In-memory document store
//!
//! Keeps every collection as a vector of documents. Used for local runs
//! (`VARASTO_STORE=memory`), tests and benches.

use crate::error::StoreError;
use crate::message::Document;
use crate::store::{CollectionStats, DocumentStore, InsertResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// In-memory store
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Snapshot of the documents in a collection
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.collections.lock().get(collection).map_or(0, Vec::len)
    }

    /// Total documents across all collections
    pub fn total(&self) -> usize {
        self.collections.lock().values().map(Vec::len).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<InsertResult, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Unavailable("store closed".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(InsertResult {
            inserted_id: id.to_string(),
        })
    }

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Unavailable("store closed".into()));
        }
        Ok(CollectionStats {
            kind: "collection".to_string(),
            document_count: self.count(collection) as u64,
        })
    }

    async fn health(&self) -> bool {
        !self.is_closed()
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
