//! Error types for VARASTO

use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Main error type for the worker
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Topic has no route
    #[error("unknown topic '{topic}'")]
    UnknownTopic { topic: String },

    /// No topic routes into the collection
    #[error("unknown collection '{collection}'")]
    UnknownCollection { collection: String },

    /// The same topic was routed twice
    #[error("topic '{topic}' is routed more than once")]
    DuplicateTopic { topic: String },

    /// Two topics were routed into one collection
    #[error("collection '{collection}' is the destination of both '{first}' and '{second}'")]
    SharedCollection {
        collection: String,
        first: String,
        second: String,
    },

    /// Route with an empty topic or collection name
    #[error("route names must not be empty")]
    EmptyRouteName,

    /// Broker error
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Store could not be reached while answering a query
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Worker failed to reach Running
    #[error("startup failed: {0}")]
    Startup(String),

    /// Illegal lifecycle transition
    #[error("invalid worker state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for broker operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection could not be acquired or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Exchange or queue declaration rejected
    #[error("declare failed for topic '{topic}': {message}")]
    Declare { topic: String, message: String },

    /// Queue to exchange binding rejected
    #[error("bind failed for topic '{topic}': {message}")]
    Bind { topic: String, message: String },

    /// Consumer registration rejected
    #[error("consume failed for topic '{topic}': {message}")]
    Consume { topic: String, message: String },

    /// Ack or reject call failed
    #[error("settle failed: {0}")]
    Settle(String),

    /// Publish failed
    #[error("publish failed: {0}")]
    Publish(String),

    /// RPC listener error
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Channel or subscription already closed
    #[error("broker closed")]
    Closed,
}

/// Error type for document store operations
///
/// The variant decides what happens to the message being ingested:
/// transient and unavailable errors requeue it, permanent errors discard it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Temporary failure (timeout, failover), worth redelivering
    #[error("transient store error: {0}")]
    Transient(String),

    /// The store will never accept this document
    #[error("permanent store error: {0}")]
    Permanent(String),

    /// Store cannot be reached at all
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a redelivery of the same document could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(StoreError::Unavailable("refused".into()).is_transient());
        assert!(!StoreError::Permanent("duplicate key".into()).is_transient());
    }

    #[test]
    fn test_broker_error_to_worker_error() {
        let err: WorkerError = BrokerError::Bind {
            topic: "orders".into(),
            message: "access refused".into(),
        }
        .into();
        assert!(matches!(err, WorkerError::Broker(BrokerError::Bind { .. })));
        assert_eq!(
            err.to_string(),
            "bind failed for topic 'orders': access refused"
        );
    }

    #[test]
    fn test_shared_collection_message() {
        let err = WorkerError::SharedCollection {
            collection: "c".into(),
            first: "a".into(),
            second: "b".into(),
        };
        assert!(err.to_string().contains("'a' and 'b'"));
    }
}
