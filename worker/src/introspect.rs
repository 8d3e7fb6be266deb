//! Introspection service
//!
//! Answers "which collections does this worker feed, and how full are
//! they?". Served as a broker RPC (`list_collections` by default) and on the
//! HTTP status surface. Read-only: it shares the routing table and the store
//! with the consumers and never touches consumer state.

use crate::broker::RpcListener;
use crate::error::{Result, WorkerError};
use crate::routing::RoutingTable;
use crate::store::DocumentStore;
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One routed collection with its live statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub kind: String,
    pub topic: String,
    pub document_count: u64,
}

#[derive(Clone)]
pub struct IntrospectionService {
    table: Arc<RoutingTable>,
    store: Arc<dyn DocumentStore>,
}

impl IntrospectionService {
    pub fn new(table: Arc<RoutingTable>, store: Arc<dyn DocumentStore>) -> Self {
        Self { table, store }
    }

    /// Every routed collection, in route order
    ///
    /// Any store failure fails the whole call with
    /// [`WorkerError::StoreUnavailable`]; partial listings are never returned.
    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let mut infos = Vec::with_capacity(self.table.len());

        for entry in self.table.entries() {
            let collection = entry.destination_collection.as_str();
            let stats = self
                .store
                .collection_stats(collection)
                .await
                .map_err(|e| WorkerError::StoreUnavailable(format!("{collection}: {e}")))?;
            let topic = self.table.reverse_lookup(collection)?;

            infos.push(CollectionInfo {
                name: collection.to_string(),
                kind: stats.kind,
                topic: topic.to_string(),
                document_count: stats.document_count,
            });
        }

        Ok(infos)
    }

    /// JSON reply for one request: the listing, or `{"error": ...}`
    pub async fn reply_body(&self, method: &str, served: &str) -> Bytes {
        if method != served {
            return error_body(&format!("unknown method '{method}'"));
        }
        match self.list_collections().await {
            Ok(infos) => match serde_json::to_vec(&infos) {
                Ok(body) => Bytes::from(body),
                Err(e) => error_body(&WorkerError::from(e).to_string()),
            },
            Err(e) => {
                warn!(method = %method, error = %e, "Introspection failed");
                error_body(&e.to_string())
            }
        }
    }

    /// Answer RPC requests until cancelled or the listener ends
    pub async fn serve(
        &self,
        mut listener: Box<dyn RpcListener>,
        method: String,
        cancel: CancellationToken,
    ) {
        info!(method = %method, "Introspection RPC serving");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = listener.next_request() => next,
            };

            match next {
                Some(Ok(request)) => {
                    let body = self.reply_body(&request.method, &method).await;
                    if let Err(e) = request.responder.reply(body).await {
                        warn!(method = %method, error = %e, "RPC reply failed");
                    }
                }
                Some(Err(e)) => {
                    error!(method = %method, error = %e, "RPC listener failed, introspection unavailable");
                    break;
                }
                None => break,
            }
        }

        if let Err(e) = listener.close().await {
            debug!(method = %method, error = %e, "RPC listener close failed");
        }
        info!(method = %method, "Introspection RPC stopped");
    }
}

fn error_body(message: &str) -> Bytes {
    Bytes::from(json!({ "error": message }).to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::message::Document;
    use crate::store::MemoryStore;
    use serde_json::Value;

    fn service(store: Arc<MemoryStore>) -> IntrospectionService {
        let table = RoutingTable::from_pairs([
            ("orders", "orders_collection"),
            ("events", "events_collection"),
        ])
        .unwrap();
        IntrospectionService::new(Arc::new(table), store)
    }

    async fn seed(store: &MemoryStore, collection: &str, n: usize) {
        for _ in 0..n {
            store.insert(collection, Document::new()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_lists_every_route_in_order() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "orders_collection", 2).await;

        let infos = service(store).list_collections().await.unwrap();
        assert_eq!(
            infos,
            vec![
                CollectionInfo {
                    name: "orders_collection".into(),
                    kind: "collection".into(),
                    topic: "orders".into(),
                    document_count: 2,
                },
                CollectionInfo {
                    name: "events_collection".into(),
                    kind: "collection".into(),
                    topic: "events".into(),
                    document_count: 0,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_store_unavailable_propagates() {
        let store = Arc::new(MemoryStore::new());
        store.shutdown().await.unwrap();

        let result = service(store.clone()).list_collections().await;
        assert!(matches!(result, Err(WorkerError::StoreUnavailable(_))));

        let body = service(store).reply_body("list_collections", "list_collections").await;
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert!(value["error"].as_str().unwrap().contains("orders_collection"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let body = service(Arc::new(MemoryStore::new()))
            .reply_body("drop_database", "list_collections")
            .await;
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "unknown method 'drop_database'");
    }

    #[tokio::test]
    async fn test_serve_over_broker() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        seed(&store, "events_collection", 3).await;

        let listener = broker.listen_rpc("list_collections").await.unwrap();
        let cancel = CancellationToken::new();
        let svc = service(store);
        let server = tokio::spawn({
            let cancel = cancel.clone();
            async move { svc.serve(listener, "list_collections".into(), cancel).await }
        });

        let reply = broker.call("list_collections", "{}").await.unwrap();
        let value: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value[1]["name"], "events_collection");
        assert_eq!(value[1]["topic"], "events");
        assert_eq!(value[1]["document_count"], 3);

        cancel.cancel();
        server.await.unwrap();
        assert!(broker.call("list_collections", "{}").await.is_err());
    }
}
