//! VARASTO - Durable Multi-Queue Ingestion Worker
//!
//! Consumes JSON messages from many broker topics and persists each one as a
//! document in the collection its topic is routed to. A message is
//! acknowledged only after its document is stored.
//!
//! # Architecture
//!
//! ```text
//! exchange ──► queue ──► consumer task ──► IngestionHandler ──► DocumentStore
//!    (one per topic, prefetch 1)                 │
//!                                     Disposition (ack / reject)
//! ```
//!
//! Broker and store are pluggable via traits; RabbitMQ and MongoDB are the
//! production implementations, in-memory ones back local runs and tests.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod introspect;
pub mod message;
pub mod metrics;
pub mod routing;
pub mod status_server;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{BrokerError, Result, StoreError, WorkerError};
pub use routing::{RouteEntry, RoutingTable};
pub use worker::{RunningWorker, Worker, WorkerState};
