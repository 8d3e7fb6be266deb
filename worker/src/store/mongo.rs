//! MongoDB document store
//!
//! Inserts decoded documents with `insert_one` and reports collection
//! statistics from `listCollections` plus `count_documents`.
//!
//! # Error classification
//!
//! | driver error | StoreError |
//! |---|---|
//! | IO, server selection | Unavailable |
//! | pool cleared, write concern error, retryable write label | Transient |
//! | write error (e.g. duplicate key), serialization, invalid argument | Permanent |
//! | anything else | Transient |

use crate::error::StoreError;
use crate::message::Document;
use crate::store::{CollectionStats, DocumentStore, InsertResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, doc};
use mongodb::error::{ErrorKind, RETRYABLE_WRITE_ERROR, WriteFailure};
use mongodb::results::CollectionType;
use mongodb::{Client, Database};
use tracing::{debug, info, warn};

/// MongoDB-backed store
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    /// Connect to a MongoDB deployment and select a database
    ///
    /// The driver connects lazily; call [`DocumentStore::health`] to find
    /// out whether the deployment is reachable.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StoreError::Unavailable(format!("invalid MongoDB URI: {e}")))?;
        let db = client.database(database);
        info!(database = %database, "MongoDB store created");
        Ok(Self { client, db })
    }
}

/// Map a driver error onto the ingestion taxonomy
fn classify(err: mongodb::error::Error) -> StoreError {
    if err.contains_label(RETRYABLE_WRITE_ERROR) {
        return StoreError::Transient(err.to_string());
    }
    match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => {
            StoreError::Unavailable(err.to_string())
        }
        ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::Write(WriteFailure::WriteConcernError(_)) => {
            StoreError::Transient(err.to_string())
        }
        ErrorKind::Write(WriteFailure::WriteError(_))
        | ErrorKind::BsonSerialization(_)
        | ErrorKind::InvalidArgument { .. } => StoreError::Permanent(err.to_string()),
        _ => StoreError::Transient(err.to_string()),
    }
}

fn render_id(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    fn name(&self) -> &'static str {
        "mongo"
    }

    async fn insert(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<InsertResult, StoreError> {
        let document = bson::to_document(&document)
            .map_err(|e| StoreError::Permanent(format!("document conversion: {e}")))?;

        let result = self
            .db
            .collection::<bson::Document>(collection)
            .insert_one(document)
            .await
            .map_err(classify)?;

        let inserted_id = render_id(&result.inserted_id);
        debug!(collection = %collection, id = %inserted_id, "Document inserted");
        Ok(InsertResult { inserted_id })
    }

    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats, StoreError> {
        let mut cursor = self
            .db
            .list_collections()
            .filter(doc! { "name": collection })
            .await
            .map_err(classify)?;

        let kind = match cursor.try_next().await.map_err(classify)? {
            Some(spec) => match spec.collection_type {
                CollectionType::View => "view",
                CollectionType::Timeseries => "timeseries",
                _ => "collection",
            },
            None => "collection",
        };

        let document_count = self
            .db
            .collection::<bson::Document>(collection)
            .count_documents(doc! {})
            .await
            .map_err(classify)?;

        Ok(CollectionStats {
            kind: kind.to_string(),
            document_count,
        })
    }

    async fn health(&self) -> bool {
        match self.db.run_command(doc! { "ping": 1 }).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "MongoDB ping failed");
                false
            }
        }
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        self.client.clone().shutdown().await;
        info!("MongoDB store closed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;

    #[test]
    fn test_render_object_id() {
        let oid = ObjectId::new();
        assert_eq!(render_id(&Bson::ObjectId(oid)), oid.to_hex());
        assert_eq!(render_id(&Bson::String("abc".into())), "abc");
        assert_eq!(render_id(&Bson::Int32(7)), "7");
    }

    #[test]
    fn test_json_document_converts_to_bson() {
        let json: Document =
            serde_json::from_str(r#"{"id": 1, "amount": 9.99, "tags": ["a"]}"#).unwrap();
        let converted = bson::to_document(&json).unwrap();
        assert_eq!(converted.len(), 3);
        assert_eq!(converted.get_f64("amount").unwrap(), 9.99);
    }
}
