//! VARASTO - Durable Multi-Queue Ingestion Worker
//!
//! Consumes JSON messages from broker topics and stores each one as a
//! document in its routed collection.
//!
//! ## Usage
//!
//! ```bash
//! # Against local RabbitMQ and MongoDB
//! VARASTO_ROUTES=orders=orders_collection,events=events_collection cargo run
//!
//! # Fully in-process, no external services
//! VARASTO_ROUTES=orders=orders VARASTO_BROKER=memory VARASTO_STORE=memory cargo run
//! ```
//!
//! ## Environment Variables
//!
//! - `VARASTO_ROUTES`: `topic=collection,...` (required)
//! - `VARASTO_BROKER` / `VARASTO_STORE`: `amqp|memory` / `mongo|memory`
//! - `VARASTO_AMQP_URL` or `VARASTO_AMQP_{HOST,PORT,USER,PASSWORD,VHOST}`
//! - `VARASTO_MONGO_URI` or `VARASTO_MONGO_{HOST,PORT}`, `VARASTO_MONGO_DATABASE`
//! - `VARASTO_STATUS_ADDR`: health/metrics server address (default: "0.0.0.0:9090")
//! - `VARASTO_DRAIN_TIMEOUT_MS`: shutdown drain bound (default: 10000)
//! - `VARASTO_REBIND_INITIAL_MS` / `VARASTO_REBIND_MAX_MS`: re-bind backoff (default: 100 / 5000)
//! - `VARASTO_LOG_LEVEL` / `VARASTO_LOG_FORMAT`: "info" / "pretty" or "json"

use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use varasto_worker::broker::{AmqpBroker, Broker, MemoryBroker};
use varasto_worker::config::{BrokerKind, Config, LogFormat, StoreKind};
use varasto_worker::metrics::Metrics;
use varasto_worker::status_server::StatusServer;
use varasto_worker::store::{DocumentStore, MemoryStore, MongoStore};
use varasto_worker::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    let table = config.routing_table()?;
    info!(
        routes = table.len(),
        broker = ?config.broker,
        store = ?config.store,
        status_addr = %config.status_addr,
        "Starting VARASTO worker"
    );

    Metrics::init()?;

    let broker: Arc<dyn Broker> = match config.broker {
        BrokerKind::Amqp => Arc::new(AmqpBroker::new(&config.amqp_url(), config.amqp_pool_size)?),
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
    };
    let store: Arc<dyn DocumentStore> = match config.store {
        StoreKind::Mongo => {
            Arc::new(MongoStore::connect(&config.mongo_uri(), &config.mongo_database).await?)
        }
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };

    let worker = Worker::new(table)
        .broker_arc(broker)
        .store_arc(store)
        .drain_timeout(config.drain_timeout)
        .startup_policy(config.startup_policy)
        .rebind_backoff(config.rebind_backoff)
        .rpc_queue(config.rpc_queue.clone())
        .start()
        .await?;

    let status_server = StatusServer::start(config.status_addr, worker.status());

    let report = worker.run_until(shutdown_signal()).await?;
    status_server.abort();

    info!(
        drained = report.completed,
        abandoned = report.abandoned.len(),
        "VARASTO worker shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, draining"),
        _ = terminate => info!("Received SIGTERM, draining"),
    }
}
