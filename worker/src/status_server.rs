//! HTTP status server
//!
//! Serves Prometheus metrics, lifecycle health and the collection listing on
//! a separate port.
//!
//! # Example
//!
//! ```ignore
//! use varasto_worker::status_server::StatusServer;
//!
//! let server = StatusServer::start(config.status_addr, worker.status());
//!
//! // Later, to shutdown
//! server.abort();
//! ```

use crate::worker::{StatusHandle, WorkerState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::{Router, routing::get};
use serde_json::json;
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Status HTTP server
pub struct StatusServer;

impl StatusServer {
    /// Start the status server on `addr`
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    pub fn start(addr: SocketAddr, status: StatusHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            let app = router(status);

            info!(addr = %addr, "Status server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %addr, "Failed to bind status server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Status server error");
            }
        })
    }
}

fn router(status: StatusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/collections", get(collections_handler))
        .with_state(status)
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Handler for /health endpoint
///
/// 200 only while Running with at least one consumer in Consuming.
async fn health_handler(State(status): State<StatusHandle>) -> Response {
    let state = status.state();
    let consuming = status.consuming();
    let code = if state == WorkerState::Running && consuming > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let consumers: serde_json::Map<String, serde_json::Value> = status
        .consumers()
        .into_iter()
        .map(|(topic, state)| (topic, json!(state.to_string())))
        .collect();

    (
        code,
        Json(json!({
            "state": state.as_str(),
            "consuming": consuming,
            "consumers": consumers,
        })),
    )
        .into_response()
}

/// Handler for /collections endpoint
async fn collections_handler(State(status): State<StatusHandle>) -> Response {
    match status.introspection().list_collections().await {
        Ok(infos) => (StatusCode::OK, Json(infos)).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::routing::RoutingTable;
    use crate::store::MemoryStore;
    use crate::consumer::RebindBackoff;
    use crate::worker::{RunningWorker, Worker};
    use std::time::Duration;

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn running() -> RunningWorker {
        Worker::new(RoutingTable::from_pairs([("orders", "orders_collection")]).unwrap())
            .broker(MemoryBroker::new())
            .store(MemoryStore::new())
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_metrics_handler_returns_prometheus_format() {
        let _ = crate::metrics::Metrics::init();

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn test_health_follows_lifecycle() {
        let worker = running().await;
        let status = worker.status();

        let response = health_handler(State(status.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        worker.shutdown().await.unwrap();
        let response = health_handler(State(status)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_unavailable_while_no_consumer_is_consuming() {
        let broker = MemoryBroker::new();
        let worker = Worker::new(RoutingTable::from_pairs([("orders", "orders_collection")]).unwrap())
            .broker(broker.clone())
            .store(MemoryStore::new())
            .rebind_backoff(RebindBackoff {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                ..Default::default()
            })
            .start()
            .await
            .unwrap();
        let status = worker.status();

        broker.set_unreachable(true);
        broker.drop_connections();
        wait_for(|| status.consuming() == 0).await;

        let response = health_handler(State(status.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status.state(), WorkerState::Running);

        broker.set_unreachable(false);
        wait_for(|| status.consuming() == 1).await;
        let response = health_handler(State(status)).await;
        assert_eq!(response.status(), StatusCode::OK);

        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_collections_unavailable_after_stop() {
        let worker = running().await;
        let status = worker.status();

        let response = collections_handler(State(status.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        // Stopping closes the store
        worker.shutdown().await.unwrap();
        let response = collections_handler(State(status)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
