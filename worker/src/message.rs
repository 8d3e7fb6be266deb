//! Inbound message envelope and document decoding
//!
//! An [`InboundMessage`] is what a consumer hands to the ingestion handler.
//! The payload stays as `Bytes` until the handler decodes it into a
//! [`Document`]: a JSON object with no schema attached.
//!
//! ```text
//! broker delivery ──► InboundMessage ──► decode ──► Document ──► store
//!        │                                                        │
//!        └──────── Acker (settled once with a Disposition) ◄──────┘
//! ```

use bytes::Bytes;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// A decoded message body: string keys to JSON values
pub type Document = Map<String, Value>;

/// A delivered message, owned by the handler while it is processed
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use varasto_worker::message::InboundMessage;
///
/// let msg = InboundMessage::new("orders", 7, Bytes::from(r#"{"id": 1}"#));
/// assert_eq!(msg.message_id, "orders#7");
/// assert!(msg.decode().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Identity used in logs: broker message-id, else `topic#delivery_tag`
    pub message_id: String,

    /// Topic (exchange) the message was published to
    pub source_topic: String,

    /// Broker-assigned tag, unique per channel
    pub delivery_tag: u64,

    /// Whether the broker has delivered this message before
    pub redelivered: bool,

    /// Raw body
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(source_topic: impl Into<String>, delivery_tag: u64, payload: Bytes) -> Self {
        let source_topic = source_topic.into();
        Self {
            message_id: format!("{source_topic}#{delivery_tag}"),
            source_topic,
            delivery_tag,
            redelivered: false,
            payload,
        }
    }

    /// Use the producer's message id instead of the synthetic one
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Decode the payload as a JSON object
    pub fn decode(&self) -> Result<Document, DecodeError> {
        decode_document(&self.payload)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Why a payload could not become a [`Document`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(String),

    #[error("payload is not valid JSON: {0}")]
    Json(String),

    #[error("payload is JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

/// Decode raw bytes into a document
pub fn decode_document(payload: &[u8]) -> Result<Document, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|e| DecodeError::Utf8(e.to_string()))?;
    match serde_json::from_str::<Value>(text).map_err(|e| DecodeError::Json(e.to_string()))? {
        Value::Object(map) => Ok(map),
        Value::Null => Err(DecodeError::NotAnObject("null")),
        Value::Bool(_) => Err(DecodeError::NotAnObject("bool")),
        Value::Number(_) => Err(DecodeError::NotAnObject("number")),
        Value::String(_) => Err(DecodeError::NotAnObject("string")),
        Value::Array(_) => Err(DecodeError::NotAnObject("array")),
    }
}

/// Terminal outcome of handling one delivery
///
/// Returned by the handler and applied by the consumer, so the ack/reject
/// decision is a value rather than something inferred from errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Stored downstream; remove from the broker
    Acked,
    /// Transient failure; return to the broker for redelivery
    RejectedRequeue,
    /// Permanent failure; remove from the broker without success
    RejectedDiscard,
}

impl Disposition {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acked => "acked",
            Disposition::RejectedRequeue => "rejected_requeue",
            Disposition::RejectedDiscard => "rejected_discard",
        }
    }

    pub fn requeues(&self) -> bool {
        matches!(self, Disposition::RejectedRequeue)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
