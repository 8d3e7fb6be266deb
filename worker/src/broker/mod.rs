//! Broker abstraction for VARASTO
//!
//! The broker is an external collaborator. The worker needs four things
//! from it, each modelled as a trait:
//!
//! - [`Broker`]: bind a topic to a private queue, open an RPC queue
//! - [`Subscription`]: one bound queue; start consuming with a prefetch
//!   limit, pull deliveries, cancel
//! - [`Acker`]: the one-shot capability to settle a delivery
//! - [`RpcListener`] / [`RpcResponder`]: request/reply for introspection
//!
//! # Topology
//!
//! ```text
//! producer ──► exchange "orders" (fanout) ──► exclusive queue ──► Subscription
//!                                        └──► other workers' queues
//! ```

pub mod amqp;
pub mod memory;

use crate::error::BrokerError;
use crate::message::{Disposition, InboundMessage};
use async_trait::async_trait;
use bytes::Bytes;

pub use amqp::{AmqpBroker, ChannelPool};
pub use memory::MemoryBroker;

/// A delivered message together with the capability to settle it
pub struct Delivery {
    pub message: InboundMessage,
    pub acker: Box<dyn Acker>,
}

/// Settles exactly one delivery
///
/// `settle` takes the acker by value, so a delivery cannot be settled
/// twice. Dropping an acker without settling leaves the message unacked;
/// the broker requeues it when the channel or subscription goes away.
#[async_trait]
pub trait Acker: Send {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError>;
}

/// One topic bound to a queue owned by this worker
///
/// Lifecycle: returned by [`Broker::bind`] (bound), [`consume`](Self::consume)
/// (consuming), [`cancel`](Self::cancel) (cancelled), [`close`](Self::close)
/// (channel released). Deliveries taken before `cancel` may still be settled
/// until `close`.
#[async_trait]
pub trait Subscription: Send {
    fn topic(&self) -> &str;

    /// Start consuming; the broker keeps at most `prefetch` deliveries
    /// unsettled
    async fn consume(&mut self, prefetch: u16) -> Result<(), BrokerError>;

    /// Next delivery; `None` once the subscription is cancelled or closed
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Stop receiving deliveries
    async fn cancel(&mut self) -> Result<(), BrokerError>;

    /// Release the underlying channel
    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// An RPC call waiting for its reply
pub struct RpcRequest {
    /// Method (queue) the request arrived on
    pub method: String,
    pub body: Bytes,
    pub responder: Box<dyn RpcResponder>,
}

/// Sends the reply for one RPC request
#[async_trait]
pub trait RpcResponder: Send {
    async fn reply(self: Box<Self>, body: Bytes) -> Result<(), BrokerError>;
}

/// Stream of RPC requests for one method
#[async_trait]
pub trait RpcListener: Send {
    async fn next_request(&mut self) -> Option<Result<RpcRequest, BrokerError>>;

    /// Stop accepting requests
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Broker trait - topology and channel management
///
/// # Example
///
/// ```ignore
/// let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
/// let mut sub = broker.bind("orders").await?;
/// sub.consume(1).await?;
/// while let Some(delivery) = sub.next_delivery().await {
///     let delivery = delivery?;
///     delivery.acker.settle(Disposition::Acked).await?;
/// }
/// ```
#[async_trait]
pub trait Broker: Send + Sync {
    /// Broker name for identification and logging
    fn name(&self) -> &'static str;

    /// Declare the topic's fanout exchange, declare an exclusive auto-delete
    /// queue and bind it. Declaring is idempotent.
    async fn bind(&self, topic: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Start serving RPC requests addressed to `method`
    async fn listen_rpc(&self, method: &str) -> Result<Box<dyn RpcListener>, BrokerError>;

    /// Health check, used before the worker starts
    async fn health(&self) -> bool;

    /// Close all connections
    async fn shutdown(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
