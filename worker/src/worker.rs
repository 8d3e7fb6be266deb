//! Worker lifecycle
//!
//! ```text
//! Starting ──► Running ──► Draining ──► Stopped
//!     └──────── startup error ─────────────┘
//! ```
//!
//! [`Worker`] collects the collaborators and starts everything;
//! [`RunningWorker`] owns the consumers and the RPC task until shutdown.
//! The current state is published on a `watch` channel so the status server
//! and tests can observe it without holding the worker.

use crate::broker::Broker;
use crate::consumer::{
    ConsumerManager, ConsumerState, ConsumerStates, DrainReport, RebindBackoff, StartupPolicy,
};
use crate::error::{Result, WorkerError};
use crate::handler::IngestionHandler;
use crate::introspect::IntrospectionService;
use crate::metrics;
use crate::routing::RoutingTable;
use crate::store::DocumentStore;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default bound on waiting for in-flight handlers
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default queue for the introspection RPC
pub const DEFAULT_RPC_QUEUE: &str = "list_collections";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl WorkerState {
    /// Numeric encoding used by the state gauge
    pub fn ordinal(self) -> u8 {
        match self {
            WorkerState::Starting => 0,
            WorkerState::Running => 1,
            WorkerState::Draining => 2,
            WorkerState::Stopped => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        }
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        matches!(
            (self, next),
            (WorkerState::Starting, WorkerState::Running)
                | (WorkerState::Starting, WorkerState::Stopped)
                | (WorkerState::Running, WorkerState::Draining)
                | (WorkerState::Draining, WorkerState::Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn transition(state: &watch::Sender<WorkerState>, next: WorkerState) -> Result<()> {
    let current = *state.borrow();
    if !current.can_transition_to(next) {
        return Err(WorkerError::InvalidTransition {
            from: current.to_string(),
            to: next.to_string(),
        });
    }
    state.send_replace(next);
    metrics::try_set_worker_state(next);
    info!(from = %current, to = %next, "Worker state changed");
    Ok(())
}

/// Worker builder
///
/// # Example
///
/// ```ignore
/// let worker = Worker::new(table)
///     .broker(MemoryBroker::new())
///     .store(MemoryStore::new())
///     .drain_timeout(Duration::from_secs(5))
///     .start()
///     .await?;
/// worker.run_until(shutdown_signal()).await?;
/// ```
pub struct Worker {
    table: RoutingTable,
    broker: Option<Arc<dyn Broker>>,
    store: Option<Arc<dyn DocumentStore>>,
    drain_timeout: Duration,
    startup_policy: StartupPolicy,
    rebind_backoff: RebindBackoff,
    rpc_queue: String,
}

impl Worker {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table,
            broker: None,
            store: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            startup_policy: StartupPolicy::default(),
            rebind_backoff: RebindBackoff::default(),
            rpc_queue: DEFAULT_RPC_QUEUE.to_string(),
        }
    }

    pub fn broker<B: Broker + 'static>(self, broker: B) -> Self {
        self.broker_arc(Arc::new(broker))
    }

    pub fn broker_arc(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn store<S: DocumentStore + 'static>(self, store: S) -> Self {
        self.store_arc(Arc::new(store))
    }

    pub fn store_arc(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn startup_policy(mut self, policy: StartupPolicy) -> Self {
        self.startup_policy = policy;
        self
    }

    /// Backoff between re-bind attempts after a consumer loses its channel
    pub fn rebind_backoff(mut self, backoff: RebindBackoff) -> Self {
        self.rebind_backoff = backoff;
        self
    }

    pub fn rpc_queue(mut self, queue: impl Into<String>) -> Self {
        self.rpc_queue = queue.into();
        self
    }

    /// Run Starting and hand back the running worker
    ///
    /// Fails without reaching Running if the broker or store is
    /// unreachable, if the startup policy rejects the consumer set, or if
    /// the RPC listener cannot be opened. Anything started before the
    /// failure is torn down again.
    pub async fn start(self) -> Result<RunningWorker> {
        let broker = self
            .broker
            .ok_or_else(|| WorkerError::Config("no broker configured".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| WorkerError::Config("no document store configured".to_string()))?;

        let (state, _) = watch::channel(WorkerState::Starting);
        metrics::try_set_worker_state(WorkerState::Starting);
        info!(
            routes = self.table.len(),
            broker = broker.name(),
            store = store.name(),
            policy = ?self.startup_policy,
            "Worker starting"
        );

        if !broker.health().await {
            let _ = transition(&state, WorkerState::Stopped);
            return Err(WorkerError::Startup(format!(
                "broker '{}' unreachable",
                broker.name()
            )));
        }
        if !store.health().await {
            let _ = transition(&state, WorkerState::Stopped);
            return Err(WorkerError::Startup(format!(
                "store '{}' unreachable",
                store.name()
            )));
        }

        let table = Arc::new(self.table);
        let handler = IngestionHandler::new(Arc::clone(&table), Arc::clone(&store));
        let mut consumers = ConsumerManager::new(
            Arc::clone(&broker),
            Arc::clone(&table),
            handler,
            self.startup_policy,
        )
        .with_backoff(self.rebind_backoff);

        if let Err(e) = consumers.start().await {
            error!(error = %e, "Consumer startup failed");
            consumers.shutdown(Instant::now() + self.drain_timeout).await;
            teardown(&broker, &store).await;
            let _ = transition(&state, WorkerState::Stopped);
            return Err(e);
        }

        let introspection = IntrospectionService::new(Arc::clone(&table), Arc::clone(&store));
        let listener = match broker.listen_rpc(&self.rpc_queue).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(queue = %self.rpc_queue, error = %e, "RPC listener failed to start");
                consumers.shutdown(Instant::now() + self.drain_timeout).await;
                teardown(&broker, &store).await;
                let _ = transition(&state, WorkerState::Stopped);
                return Err(WorkerError::Startup(format!("rpc listener: {e}")));
            }
        };

        let rpc_cancel = CancellationToken::new();
        let rpc_task = tokio::spawn({
            let service = introspection.clone();
            let method = self.rpc_queue.clone();
            let cancel = rpc_cancel.clone();
            async move { service.serve(listener, method, cancel).await }
        });

        transition(&state, WorkerState::Running)?;
        Ok(RunningWorker {
            state,
            consumers,
            introspection,
            rpc_cancel,
            rpc_task: Some(rpc_task),
            broker,
            store,
            drain_timeout: self.drain_timeout,
        })
    }
}

async fn teardown(broker: &Arc<dyn Broker>, store: &Arc<dyn DocumentStore>) {
    if let Err(e) = broker.shutdown().await {
        warn!(broker = broker.name(), error = %e, "Broker shutdown failed");
    }
    if let Err(e) = store.shutdown().await {
        warn!(store = store.name(), error = %e, "Store shutdown failed");
    }
}

/// Read-only view of a running worker
#[derive(Clone)]
pub struct StatusHandle {
    state: watch::Receiver<WorkerState>,
    consumers: ConsumerStates,
    introspection: IntrospectionService,
}

impl StatusHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn consumers(&self) -> Vec<(String, ConsumerState)> {
        self.consumers.snapshot()
    }

    /// Consumers currently in Consuming
    pub fn consuming(&self) -> usize {
        self.consumers.consuming()
    }

    pub fn introspection(&self) -> &IntrospectionService {
        &self.introspection
    }
}

/// A worker in Running, until [`shutdown`](Self::shutdown)
pub struct RunningWorker {
    state: watch::Sender<WorkerState>,
    consumers: ConsumerManager,
    introspection: IntrospectionService,
    rpc_cancel: CancellationToken,
    rpc_task: Option<JoinHandle<()>>,
    broker: Arc<dyn Broker>,
    store: Arc<dyn DocumentStore>,
    drain_timeout: Duration,
}

impl RunningWorker {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> StatusHandle {
        StatusHandle {
            state: self.state.subscribe(),
            consumers: self.consumers.states(),
            introspection: self.introspection.clone(),
        }
    }

    pub fn introspection(&self) -> &IntrospectionService {
        &self.introspection
    }

    pub fn consumer_states(&self) -> Vec<(String, ConsumerState)> {
        self.consumers.states().snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.consumers.in_flight()
    }

    /// Stay Running until `signal` resolves, then shut down
    pub async fn run_until<F>(self, signal: F) -> Result<DrainReport>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await
    }

    /// Draining then Stopped
    ///
    /// Stops RPC serving, cancels every consumer and waits for in-flight
    /// handlers. One deadline, `drain_timeout` from now, bounds the whole
    /// drain: consumers, the pending RPC reply and connection teardown.
    /// Consumers still busy at the deadline are aborted; their deliveries
    /// stay unsettled and the broker requeues them.
    pub async fn shutdown(mut self) -> Result<DrainReport> {
        transition(&self.state, WorkerState::Draining)?;
        let deadline = Instant::now() + self.drain_timeout;
        info!(
            in_flight = self.consumers.in_flight(),
            timeout_ms = self.drain_timeout.as_millis() as u64,
            "Worker draining"
        );

        self.rpc_cancel.cancel();
        let report = self.consumers.shutdown(deadline).await;

        if let Some(mut rpc_task) = self.rpc_task.take() {
            if tokio::time::timeout_at(deadline, &mut rpc_task).await.is_err() {
                warn!("RPC reply still pending at drain deadline, abandoning");
                rpc_task.abort();
            }
        }

        if !report.abandoned.is_empty() {
            warn!(
                abandoned = ?report.abandoned,
                "Drain timeout elapsed, unsettled messages will be redelivered"
            );
        }

        if tokio::time::timeout_at(deadline, teardown(&self.broker, &self.store))
            .await
            .is_err()
        {
            warn!("Connection teardown still pending at drain deadline, abandoning");
        }
        transition(&self.state, WorkerState::Stopped)?;
        info!("Worker stopped");
        Ok(report)
    }
}
