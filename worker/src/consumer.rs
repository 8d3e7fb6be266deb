//! Consumer manager
//!
//! Brings up one consumer per route and keeps it running. Each consumer is a
//! tokio task owning its [`Subscription`] (and therefore its broker
//! channel):
//!
//! ```text
//! Unbound ──bind──► Bound ──consume(prefetch 1)──► Consuming ──cancel──► Cancelled
//!    └──────────────┴── error ──► Failed (other topics keep going)
//!
//! Consuming ──stream lost──► Failed ──re-bind (backoff)──► Consuming
//! ```
//!
//! A route that fails at startup stays Failed. A consumer that loses its
//! channel later keeps re-binding until it succeeds or is cancelled.
//!
//! # Cancellation
//!
//! A consumer races "next delivery" against the shutdown token. Once a
//! delivery has been taken, the handler and the settle call run outside
//! that race, so shutdown never interrupts an insert. `shutdown` waits for
//! the tasks up to the drain deadline and aborts whatever is left; an
//! aborted delivery is never settled and the broker requeues it.

use crate::broker::{Broker, Delivery, Subscription};
use crate::error::{Result, WorkerError};
use crate::handler::IngestionHandler;
use crate::message::Disposition;
use crate::metrics;
use crate::routing::RoutingTable;
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Unsettled deliveries the broker may hand each consumer
///
/// One keeps per-topic processing strictly ordered and sequential.
pub const PREFETCH: u16 = 1;

/// What startup requires of the route set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupPolicy {
    /// Start with whichever routes came up; failed topics are logged
    #[default]
    Tolerant,
    /// Every route must reach Consuming
    Strict,
}

/// Lifecycle of one consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Unbound,
    Bound,
    Consuming,
    Cancelled,
    Failed(String),
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Unbound => f.write_str("unbound"),
            ConsumerState::Bound => f.write_str("bound"),
            ConsumerState::Consuming => f.write_str("consuming"),
            ConsumerState::Cancelled => f.write_str("cancelled"),
            ConsumerState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Shared, ordered view of every consumer's state
#[derive(Clone, Default)]
pub struct ConsumerStates {
    inner: Arc<RwLock<Vec<(String, ConsumerState)>>>,
}

impl ConsumerStates {
    fn set(&self, topic: &str, state: ConsumerState) {
        let active = {
            let mut states = self.inner.write();
            match states.iter_mut().find(|(t, _)| t == topic) {
                Some(entry) => entry.1 = state,
                None => states.push((topic.to_string(), state)),
            }
            states
                .iter()
                .filter(|(_, s)| *s == ConsumerState::Consuming)
                .count()
        };
        metrics::try_set_consumers_active(active);
    }

    pub fn get(&self, topic: &str) -> Option<ConsumerState> {
        self.inner
            .read()
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, s)| s.clone())
    }

    /// `(topic, state)` pairs in route order
    pub fn snapshot(&self) -> Vec<(String, ConsumerState)> {
        self.inner.read().clone()
    }

    pub fn consuming(&self) -> usize {
        self.inner
            .read()
            .iter()
            .filter(|(_, s)| *s == ConsumerState::Consuming)
            .count()
    }
}

/// Outcome of [`ConsumerManager::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Consumers that stopped within the timeout
    pub completed: usize,
    /// Topics whose consumer was still busy and got aborted
    pub abandoned: Vec<String>,
}

/// Delay between re-bind attempts after a consumer lost its channel
///
/// Doubles after every failed attempt, up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebindBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RebindBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RebindBackoff {
    fn next(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_delay)
    }
}

/// Owns every consumer task
pub struct ConsumerManager {
    broker: Arc<dyn Broker>,
    table: Arc<RoutingTable>,
    handler: IngestionHandler,
    policy: StartupPolicy,
    backoff: RebindBackoff,
    states: ConsumerStates,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl ConsumerManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        table: Arc<RoutingTable>,
        handler: IngestionHandler,
        policy: StartupPolicy,
    ) -> Self {
        Self {
            broker,
            table,
            handler,
            policy,
            backoff: RebindBackoff::default(),
            states: ConsumerStates::default(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Set the re-bind backoff used after connection loss
    pub fn with_backoff(mut self, backoff: RebindBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bring up a consumer for every route
    ///
    /// Returns the number of consumers that reached Consuming. A failing
    /// route never stops the others from starting; whether the failure is
    /// fatal afterwards depends on the [`StartupPolicy`]. Starting nothing
    /// at all is always fatal.
    pub async fn start(&mut self) -> Result<usize> {
        let mut failed = Vec::new();

        for entry in self.table.entries() {
            let topic = entry.source_topic.as_str();
            self.states.set(topic, ConsumerState::Unbound);

            match bring_up(self.broker.as_ref(), topic, &self.states).await {
                Ok(subscription) => {
                    self.states.set(topic, ConsumerState::Consuming);
                    info!(
                        topic = %topic,
                        collection = %entry.destination_collection,
                        prefetch = PREFETCH,
                        "Consumer started"
                    );
                    let task = ConsumerTask {
                        topic: topic.to_string(),
                        broker: Arc::clone(&self.broker),
                        handler: self.handler.clone(),
                        backoff: self.backoff,
                        cancel: self.cancel.child_token(),
                        states: self.states.clone(),
                        in_flight: Arc::clone(&self.in_flight),
                    };
                    let handle = tokio::spawn(task.run(subscription));
                    self.tasks.push((topic.to_string(), handle));
                }
                Err(e) => {
                    error!(
                        topic = %topic,
                        collection = %entry.destination_collection,
                        error = %e,
                        "Consumer failed to start, topic will NOT be ingested"
                    );
                    self.states.set(topic, ConsumerState::Failed(e.to_string()));
                    failed.push(topic.to_string());
                }
            }
        }

        let started = self.tasks.len();
        if started == 0 && !self.table.is_empty() {
            return Err(WorkerError::Startup(format!(
                "no consumer could be started ({} routes failed)",
                failed.len()
            )));
        }
        if self.policy == StartupPolicy::Strict && !failed.is_empty() {
            return Err(WorkerError::Startup(format!(
                "strict startup: consumers failed for {}",
                failed.join(", ")
            )));
        }
        if !failed.is_empty() {
            warn!(
                started = started,
                failed = ?failed,
                "Running degraded, some topics are not consumed"
            );
        }

        Ok(started)
    }

    /// Shared view of consumer states
    pub fn states(&self) -> ConsumerStates {
        self.states.clone()
    }

    /// Handler invocations currently between delivery and settle
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Cancel all consumers and wait for in-flight work until `deadline`
    ///
    /// Consumers still busy at the deadline are aborted and reported; this
    /// call returns no later than `deadline`.
    pub async fn shutdown(&mut self, deadline: Instant) -> DrainReport {
        self.cancel.cancel();
        let mut report = DrainReport::default();

        for (topic, mut handle) in std::mem::take(&mut self.tasks) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.completed += 1,
                Ok(Err(e)) => {
                    error!(topic = %topic, error = %e, "Consumer task failed");
                    report.completed += 1;
                }
                Err(_) => {
                    warn!(topic = %topic, "Handler still running at drain deadline, abandoning");
                    handle.abort();
                    self.states.set(&topic, ConsumerState::Cancelled);
                    report.abandoned.push(topic);
                }
            }
        }

        info!(
            completed = report.completed,
            abandoned = report.abandoned.len(),
            "Consumers drained"
        );
        report
    }
}

/// Bind and start consuming one topic
async fn bring_up(
    broker: &dyn Broker,
    topic: &str,
    states: &ConsumerStates,
) -> Result<Box<dyn Subscription>> {
    let mut subscription = broker.bind(topic).await?;
    states.set(topic, ConsumerState::Bound);

    if let Err(e) = subscription.consume(PREFETCH).await {
        if let Err(close_err) = subscription.close().await {
            debug!(topic = %topic, error = %close_err, "Channel close after failed consume");
        }
        return Err(e.into());
    }
    Ok(subscription)
}

/// Decrements the in-flight counter even if the task is aborted
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Why a subscription stopped delivering
enum Stopped {
    Cancelled,
    Lost(String),
}

/// One topic's consumer, alive from startup until cancellation
struct ConsumerTask {
    topic: String,
    broker: Arc<dyn Broker>,
    handler: IngestionHandler,
    backoff: RebindBackoff,
    cancel: CancellationToken,
    states: ConsumerStates,
    in_flight: Arc<AtomicUsize>,
}

impl ConsumerTask {
    async fn run(self, mut subscription: Box<dyn Subscription>) {
        let topic = self.topic.as_str();

        loop {
            match self.consume(&mut *subscription).await {
                Stopped::Cancelled => break,
                Stopped::Lost(reason) => {
                    error!(topic = %topic, error = %reason, "Delivery stream lost, re-binding");
                    self.states.set(topic, ConsumerState::Failed(reason));
                    if let Err(e) = subscription.close().await {
                        debug!(topic = %topic, error = %e, "Channel close after stream loss");
                    }
                    match self.rebind().await {
                        Some(fresh) => subscription = fresh,
                        None => {
                            self.states.set(topic, ConsumerState::Cancelled);
                            debug!(topic = %topic, "Consumer stopped while re-binding");
                            return;
                        }
                    }
                }
            }
        }

        if let Err(e) = subscription.cancel().await {
            warn!(topic = %topic, error = %e, "Consumer cancel failed");
        }
        self.states.set(topic, ConsumerState::Cancelled);
        if let Err(e) = subscription.close().await {
            debug!(topic = %topic, error = %e, "Channel close failed");
        }
        debug!(topic = %topic, "Consumer stopped");
    }

    /// Process deliveries until cancelled or the stream breaks
    async fn consume(&self, subscription: &mut dyn Subscription) -> Stopped {
        let topic = self.topic.as_str();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Stopped::Cancelled,
                next = subscription.next_delivery() => next,
            };

            let Delivery { message, acker } = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Stopped::Lost(e.to_string()),
                None if self.cancel.is_cancelled() => return Stopped::Cancelled,
                None => return Stopped::Lost("subscription ended".to_string()),
            };

            let _guard = InFlight::enter(&self.in_flight);

            let disposition = match AssertUnwindSafe(self.handler.handle(&message))
                .catch_unwind()
                .await
            {
                Ok(disposition) => disposition,
                Err(panic) => {
                    error!(
                        topic = %topic,
                        id = %message.message_id,
                        panic = %panic_message(panic.as_ref()),
                        outcome = %Disposition::RejectedDiscard,
                        "Handler panicked, discarding message"
                    );
                    Disposition::RejectedDiscard
                }
            };

            if let Err(e) = acker.settle(disposition).await {
                // Unsettled deliveries come back from the broker
                warn!(
                    topic = %topic,
                    id = %message.message_id,
                    disposition = %disposition,
                    error = %e,
                    "Settle failed, message will be redelivered"
                );
            }
        }
    }

    /// Retry bind + consume with backoff; `None` once cancelled
    async fn rebind(&self) -> Option<Box<dyn Subscription>> {
        let topic = self.topic.as_str();
        let mut delay = self.backoff.initial_delay;
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = bring_up(self.broker.as_ref(), topic, &self.states) => result,
            };

            match result {
                Ok(subscription) => {
                    self.states.set(topic, ConsumerState::Consuming);
                    info!(topic = %topic, attempt = attempt, "Consumer re-bound");
                    return Some(subscription);
                }
                Err(e) => {
                    warn!(
                        topic = %topic,
                        attempt = attempt,
                        retry_in_ms = self.backoff.next(delay).as_millis() as u64,
                        error = %e,
                        "Re-bind failed"
                    );
                    self.states.set(topic, ConsumerState::Failed(e.to_string()));
                    delay = self.backoff.next(delay);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::MemoryStore;

    fn manager(broker: &MemoryBroker, routes: &[(&str, &str)]) -> (ConsumerManager, Arc<MemoryStore>) {
        let table = Arc::new(RoutingTable::from_pairs(routes.iter().copied()).unwrap());
        let store = Arc::new(MemoryStore::new());
        let handler = IngestionHandler::new(Arc::clone(&table), store.clone());
        let manager = ConsumerManager::new(
            Arc::new(broker.clone()),
            table,
            handler,
            StartupPolicy::Tolerant,
        );
        (manager, store)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_all_routes_reach_consuming() {
        let broker = MemoryBroker::new();
        let (mut manager, _store) = manager(&broker, &[("a", "ca"), ("b", "cb")]);

        assert_eq!(manager.start().await.unwrap(), 2);
        let states = manager.states();
        assert_eq!(states.get("a"), Some(ConsumerState::Consuming));
        assert_eq!(states.get("b"), Some(ConsumerState::Consuming));
        assert_eq!(broker.bound_queues("a"), 1);

        manager.shutdown(Instant::now() + Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failed_route_is_isolated() {
        let broker = MemoryBroker::new();
        broker.fail_bind("b");
        let (mut manager, store) = manager(&broker, &[("a", "ca"), ("b", "cb"), ("c", "cc")]);

        assert_eq!(manager.start().await.unwrap(), 2);
        assert!(matches!(
            manager.states().get("b"),
            Some(ConsumerState::Failed(_))
        ));

        broker.publish("c", r#"{"n": 1}"#);
        wait_for(|| store.count("cc") == 1).await;

        manager.shutdown(Instant::now() + Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_strict_policy_fails_on_any_route() {
        let broker = MemoryBroker::new();
        broker.fail_bind("b");
        let (manager, _) = manager(&broker, &[("a", "ca"), ("b", "cb")]);
        let mut manager = ConsumerManager {
            policy: StartupPolicy::Strict,
            ..manager
        };

        assert!(matches!(
            manager.start().await,
            Err(WorkerError::Startup(_))
        ));
        manager.shutdown(Instant::now() + Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_nothing_started_is_fatal() {
        let broker = MemoryBroker::new();
        broker.fail_bind("a");
        let (mut manager, _) = manager(&broker, &[("a", "ca")]);
        assert!(manager.start().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_consumers() {
        let broker = MemoryBroker::new();
        let (mut manager, _) = manager(&broker, &[("a", "ca")]);
        manager.start().await.unwrap();

        let report = manager.shutdown(Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(report.completed, 1);
        assert!(report.abandoned.is_empty());
        assert_eq!(manager.states().get("a"), Some(ConsumerState::Cancelled));
        assert_eq!(broker.bound_queues("a"), 0);
        assert_eq!(manager.in_flight(), 0);
    }

    fn fast_backoff() -> RebindBackoff {
        RebindBackoff {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let backoff = RebindBackoff::default();
        assert_eq!(backoff.next(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(backoff.next(Duration::from_secs(4)), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_lost_stream_is_rebound() {
        let broker = MemoryBroker::new();
        let (manager, store) = manager(&broker, &[("a", "ca")]);
        let mut manager = manager.with_backoff(fast_backoff());
        manager.start().await.unwrap();
        let states = manager.states();

        broker.set_unreachable(true);
        broker.drop_connections();
        wait_for(|| matches!(states.get("a"), Some(ConsumerState::Failed(_)))).await;
        assert_eq!(states.consuming(), 0);

        broker.set_unreachable(false);
        wait_for(|| states.get("a") == Some(ConsumerState::Consuming)).await;
        assert_eq!(broker.bound_queues("a"), 1);

        broker.publish("a", r#"{"n": 1}"#);
        wait_for(|| store.count("ca") == 1).await;

        manager.shutdown(Instant::now() + Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_rebinding() {
        let broker = MemoryBroker::new();
        let (manager, _) = manager(&broker, &[("a", "ca")]);
        let mut manager = manager.with_backoff(fast_backoff());
        manager.start().await.unwrap();

        broker.set_unreachable(true);
        broker.drop_connections();
        let states = manager.states();
        wait_for(|| matches!(states.get("a"), Some(ConsumerState::Failed(_)))).await;

        let report = manager.shutdown(Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(report.completed, 1);
        assert!(report.abandoned.is_empty());
        assert_eq!(states.get("a"), Some(ConsumerState::Cancelled));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
