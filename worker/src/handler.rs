//! Ingestion handler
//!
//! Turns one delivered message into one [`Disposition`]:
//!
//! ```text
//! Received ──decode──► Parsed ──insert──► Inserted ──► Acked
//!    │                   │
//!    │                   ├── transient store error ──► RejectedRequeue
//!    │                   └── permanent store error ──► RejectedDiscard
//!    └── malformed payload / no route ───────────────► RejectedDiscard
//! ```
//!
//! The handler never talks to the broker. It has no retry loop and keeps no
//! state between messages: redelivery after a requeue is the broker's job.
//! Acknowledging happens after the insert, so a crash in between yields a
//! redelivery and a duplicate insert (at-least-once).

use crate::message::{Disposition, InboundMessage};
use crate::metrics;
use crate::routing::RoutingTable;
use crate::store::DocumentStore;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Stateless per-message ingestion logic, shared by all consumers
#[derive(Clone)]
pub struct IngestionHandler {
    table: Arc<RoutingTable>,
    store: Arc<dyn DocumentStore>,
}

impl IngestionHandler {
    pub fn new(table: Arc<RoutingTable>, store: Arc<dyn DocumentStore>) -> Self {
        Self { table, store }
    }

    /// Process one message and decide how it must be settled
    pub async fn handle(&self, message: &InboundMessage) -> Disposition {
        let started = Instant::now();
        let topic = message.source_topic.as_str();
        metrics::try_record_received(topic);

        let disposition = self.process(message).await;

        metrics::try_record_settled(topic, disposition, started.elapsed().as_secs_f64());
        disposition
    }

    async fn process(&self, message: &InboundMessage) -> Disposition {
        let topic = message.source_topic.as_str();

        let document = match message.decode() {
            Ok(document) => document,
            Err(e) => {
                error!(
                    topic = %topic,
                    collection = self.table.resolve(topic).ok().unwrap_or("-"),
                    id = %message.message_id,
                    bytes = message.payload_len(),
                    error = %e,
                    outcome = %Disposition::RejectedDiscard,
                    "Malformed payload, discarding"
                );
                return Disposition::RejectedDiscard;
            }
        };

        // Consumers only exist for routed topics; a miss means the table
        // and the bindings disagree
        let collection = match self.table.resolve(topic) {
            Ok(collection) => collection,
            Err(e) => {
                error!(
                    topic = %topic,
                    id = %message.message_id,
                    error = %e,
                    outcome = %Disposition::RejectedDiscard,
                    "Routing invariant violated, discarding"
                );
                return Disposition::RejectedDiscard;
            }
        };

        match self.store.insert(collection, document).await {
            Ok(result) => {
                info!(
                    topic = %topic,
                    collection = %collection,
                    id = %message.message_id,
                    inserted_id = %result.inserted_id,
                    redelivered = message.redelivered,
                    outcome = %Disposition::Acked,
                    "Document stored"
                );
                Disposition::Acked
            }
            Err(e) if e.is_transient() => {
                warn!(
                    topic = %topic,
                    collection = %collection,
                    id = %message.message_id,
                    error = %e,
                    outcome = %Disposition::RejectedRequeue,
                    "Store temporarily failed, requeueing"
                );
                Disposition::RejectedRequeue
            }
            Err(e) => {
                error!(
                    topic = %topic,
                    collection = %collection,
                    id = %message.message_id,
                    error = %e,
                    outcome = %Disposition::RejectedDiscard,
                    "Store rejected document, discarding"
                );
                Disposition::RejectedDiscard
            }
        }
    }
}
