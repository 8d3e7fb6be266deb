//! In-process broker
//!
//! Implements the broker traits with plain queues so the whole worker can run
//! without RabbitMQ: local development (`VARASTO_BROKER=memory`), tests and
//! benches. It models the broker behaviour the worker depends on:
//!
//! - fanout: a publish is copied into every queue bound to the topic
//! - prefetch: a queue hands out at most `prefetch` unsettled deliveries
//! - requeue: rejected-with-requeue and dropped (never settled) deliveries go
//!   back to the head of their queue, marked redelivered
//! - cancellation: a cancelled subscription yields no further deliveries, but
//!   deliveries already taken can still be settled
//!
//! Every settlement is recorded, which is what the tests assert on.

use crate::broker::{Acker, Broker, Delivery, RpcListener, RpcRequest, RpcResponder, Subscription};
use crate::error::BrokerError;
use crate::message::{Disposition, InboundMessage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::debug;

/// Capacity of the request channel behind each RPC method
const RPC_CHANNEL_CAPACITY: usize = 16;

/// A settled delivery, as observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub topic: String,
    pub message_id: String,
    pub delivery_tag: u64,
    pub disposition: Disposition,
}

/// In-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    /// Queues bound to each topic's exchange
    exchanges: Mutex<HashMap<String, Vec<Arc<MemoryQueue>>>>,
    rpc: Mutex<HashMap<String, mpsc::Sender<RpcRequest>>>,
    settlements: Mutex<Vec<Settlement>>,
    failing_binds: Mutex<HashSet<String>>,
    next_tag: AtomicU64,
    unreachable: AtomicBool,
    closed: AtomicBool,
}

struct MemoryQueue {
    topic: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<InboundMessage>,
    unsettled: usize,
    /// `None` until the subscription starts consuming
    prefetch: Option<usize>,
    cancelled: bool,
}

impl MemoryQueue {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn push(&self, message: InboundMessage) {
        self.state.lock().ready.push_back(message);
        self.notify.notify_one();
    }

    /// Settle one delivery, optionally putting it back at the head
    fn release(&self, requeue: Option<InboundMessage>) {
        {
            let mut st = self.state.lock();
            st.unsettled = st.unsettled.saturating_sub(1);
            if let Some(message) = requeue {
                st.ready.push_front(message.redelivered(true));
            }
        }
        self.notify.notify_one();
    }

    fn shut(&self) {
        self.state.lock().cancelled = true;
        self.notify.notify_one();
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                exchanges: Mutex::new(HashMap::new()),
                rpc: Mutex::new(HashMap::new()),
                settlements: Mutex::new(Vec::new()),
                failing_binds: Mutex::new(HashSet::new()),
                next_tag: AtomicU64::new(1),
                unreachable: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Publish to a topic's exchange
    ///
    /// Returns the number of queues the message was routed to. With no
    /// bound queue the message is dropped, as a fanout exchange would.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let queues = self
            .shared
            .exchanges
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for queue in &queues {
            let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed);
            queue.push(InboundMessage::new(topic, tag, payload.clone()));
        }
        queues.len()
    }

    /// Make every later `bind` of this topic fail
    pub fn fail_bind(&self, topic: impl Into<String>) {
        self.shared.failing_binds.lock().insert(topic.into());
    }

    /// Simulate the broker being down (health false, binds refused)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Simulate a dropped connection: every bound queue goes away and its
    /// subscription ends. The broker stays usable for new binds.
    pub fn drop_connections(&self) {
        let queues: Vec<_> = self
            .shared
            .exchanges
            .lock()
            .drain()
            .flat_map(|(_, queues)| queues)
            .collect();
        debug!(queues = queues.len(), "Dropping memory broker connections");
        for queue in queues {
            queue.shut();
        }
    }

    /// All settlements so far, in order
    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.settlements.lock().clone()
    }

    /// Settlements for one topic, in order
    pub fn settlements_for(&self, topic: &str) -> Vec<Settlement> {
        self.shared
            .settlements
            .lock()
            .iter()
            .filter(|s| s.topic == topic)
            .cloned()
            .collect()
    }

    /// Messages waiting in the topic's queues
    pub fn ready_count(&self, topic: &str) -> usize {
        self.queues(topic)
            .iter()
            .map(|q| q.state.lock().ready.len())
            .sum()
    }

    /// Deliveries handed out but not yet settled
    pub fn unsettled_count(&self, topic: &str) -> usize {
        self.queues(topic)
            .iter()
            .map(|q| q.state.lock().unsettled)
            .sum()
    }

    /// Number of live queues bound to the topic
    pub fn bound_queues(&self, topic: &str) -> usize {
        self.queues(topic).len()
    }

    /// Client side of the RPC: send a request and wait for the reply
    pub async fn call(&self, method: &str, body: impl Into<Bytes>) -> Result<Bytes, BrokerError> {
        let tx = self
            .shared
            .rpc
            .lock()
            .get(method)
            .cloned()
            .ok_or_else(|| BrokerError::Rpc(format!("no listener for '{method}'")))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(RpcRequest {
            method: method.to_string(),
            body: body.into(),
            responder: Box::new(MemoryResponder { tx: reply_tx }),
        })
        .await
        .map_err(|_| BrokerError::Rpc(format!("listener for '{method}' closed")))?;

        reply_rx
            .await
            .map_err(|_| BrokerError::Rpc(format!("no reply from '{method}'")))
    }

    fn queues(&self, topic: &str) -> Vec<Arc<MemoryQueue>> {
        self.shared
            .exchanges
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn check_reachable(&self) -> Result<(), BrokerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker unreachable".into()));
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn bind(&self, topic: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.check_reachable()?;
        if self.shared.failing_binds.lock().contains(topic) {
            return Err(BrokerError::Bind {
                topic: topic.to_string(),
                message: "bind refused".into(),
            });
        }

        let queue = Arc::new(MemoryQueue::new(topic));
        self.shared
            .exchanges
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::clone(&queue));

        debug!(topic = %topic, "Memory queue bound");
        Ok(Box::new(MemorySubscription {
            queue,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn listen_rpc(&self, method: &str) -> Result<Box<dyn RpcListener>, BrokerError> {
        self.check_reachable()?;
        let (tx, rx) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        self.shared.rpc.lock().insert(method.to_string(), tx);
        Ok(Box::new(MemoryRpcListener {
            method: method.to_string(),
            rx,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn health(&self) -> bool {
        self.check_reachable().is_ok()
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        let queues: Vec<_> = self
            .shared
            .exchanges
            .lock()
            .drain()
            .flat_map(|(_, queues)| queues)
            .collect();
        for queue in queues {
            queue.shut();
        }
        self.shared.rpc.lock().clear();
        Ok(())
    }
}

struct MemorySubscription {
    queue: Arc<MemoryQueue>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.queue.topic
    }

    async fn consume(&mut self, prefetch: u16) -> Result<(), BrokerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        // AMQP semantics: prefetch 0 means unlimited
        let limit = if prefetch == 0 {
            usize::MAX
        } else {
            usize::from(prefetch)
        };
        self.queue.state.lock().prefetch = Some(limit);
        self.queue.notify.notify_one();
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            {
                let mut st = self.queue.state.lock();
                if st.cancelled {
                    return None;
                }
                if let Some(limit) = st.prefetch {
                    if st.unsettled < limit {
                        if let Some(message) = st.ready.pop_front() {
                            st.unsettled += 1;
                            return Some(Ok(Delivery {
                                message: message.clone(),
                                acker: Box::new(MemoryAcker {
                                    queue: Arc::clone(&self.queue),
                                    shared: Arc::clone(&self.shared),
                                    message: Some(message),
                                }),
                            }));
                        }
                    }
                }
            }
            self.queue.notify.notified().await;
        }
    }

    async fn cancel(&mut self) -> Result<(), BrokerError> {
        self.queue.shut();
        // Exclusive auto-delete queue: unbinds once its consumer is gone
        if let Some(queues) = self.shared.exchanges.lock().get_mut(&self.queue.topic) {
            queues.retain(|q| !Arc::ptr_eq(q, &self.queue));
        }
        Ok(())
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    shared: Arc<Shared>,
    /// `Some` until settled
    message: Option<InboundMessage>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError> {
        let mut this = self;
        if this.shared.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let Some(message) = this.message.take() else {
            return Err(BrokerError::Settle("delivery already settled".into()));
        };

        this.shared.settlements.lock().push(Settlement {
            topic: message.source_topic.clone(),
            message_id: message.message_id.clone(),
            delivery_tag: message.delivery_tag,
            disposition,
        });

        let requeue = disposition.requeues().then_some(message);
        this.queue.release(requeue);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            debug!(id = %message.message_id, "Unsettled delivery returned to queue");
            self.queue.release(Some(message));
        }
    }
}

struct MemoryRpcListener {
    method: String,
    rx: mpsc::Receiver<RpcRequest>,
    shared: Arc<Shared>,
}

#[async_trait]
impl RpcListener for MemoryRpcListener {
    async fn next_request(&mut self) -> Option<Result<RpcRequest, BrokerError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.shared.rpc.lock().remove(&self.method);
        self.rx.close();
        Ok(())
    }
}

struct MemoryResponder {
    tx: oneshot::Sender<Bytes>,
}

#[async_trait]
impl RpcResponder for MemoryResponder {
    async fn reply(self: Box<Self>, body: Bytes) -> Result<(), BrokerError> {
        self.tx
            .send(body)
            .map_err(|_| BrokerError::Rpc("caller went away".into()))
    }
}
