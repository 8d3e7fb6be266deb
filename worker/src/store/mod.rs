//! Document store facade for VARASTO
//!
//! The store is an external collaborator: the worker only needs to insert a
//! document into a named collection and to ask how many documents a
//! collection holds. Implementations classify their own failures into
//! [`StoreError`] variants; the handler turns those into ack/reject
//! decisions.

pub mod memory;
pub mod mongo;

use crate::error::StoreError;
use crate::message::Document;
use async_trait::async_trait;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Outcome of a successful insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertResult {
    /// Store-assigned identifier, rendered as a string
    pub inserted_id: String,
}

/// Live statistics for one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    /// Collection kind as reported by the store ("collection", "view", ...)
    pub kind: String,
    /// Current number of documents
    pub document_count: u64,
}

/// Store trait - persists decoded documents
///
/// Implementations must be safe to share between all consumer tasks without
/// extra locking.
///
/// # Example
///
/// ```ignore
/// struct MyStore { client: MyClient }
///
/// #[async_trait]
/// impl DocumentStore for MyStore {
///     fn name(&self) -> &'static str { "my-store" }
///
///     async fn insert(&self, collection: &str, document: Document)
///         -> Result<InsertResult, StoreError>
///     {
///         let id = self.client.put(collection, document).await.map_err(classify)?;
///         Ok(InsertResult { inserted_id: id })
///     }
///
///     async fn collection_stats(&self, collection: &str)
///         -> Result<CollectionStats, StoreError>
///     {
///         let count = self.client.count(collection).await.map_err(classify)?;
///         Ok(CollectionStats { kind: "collection".into(), document_count: count })
///     }
///
///     async fn health(&self) -> bool { self.client.ping().await.is_ok() }
/// }
/// ```
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store name for identification and logging
    fn name(&self) -> &'static str;

    /// Insert one document into a collection
    async fn insert(&self, collection: &str, document: Document)
    -> Result<InsertResult, StoreError>;

    /// Kind and live document count of a collection
    ///
    /// Collections that do not exist yet report kind "collection" and a
    /// count of zero.
    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats, StoreError>;

    /// Health check, used before the worker starts consuming
    async fn health(&self) -> bool;

    /// Close connections
    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
