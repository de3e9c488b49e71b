//! # Broker Request/Reply
//!
//! A message broker has no persistent connection to a peer, so every
//! published message carries what the receiver needs to answer it: the
//! queue to reply to and a correlation id to echo back.
//!
//! The client publishes requests to the server's well-known queue with its
//! private reply queue in `reply_to`. The server treats that reply queue as
//! the client's transport id and publishes responses and pushed requests
//! there.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod in_memory;

pub use in_memory::InMemoryBroker;

/// A message in flight on the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Echoed by the receiver on the reply to this message
    pub correlation_id: Option<String>,
    /// Queue the receiver publishes its reply to
    pub reply_to: Option<String>,
    /// Serialized JSON-RPC message
    pub body: String,
}

impl Envelope {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            reply_to: None,
            body: body.into(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Build the reply to this envelope, echoing its correlation id
    pub fn reply(&self, body: impl Into<String>) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            reply_to: None,
            body: body.into(),
        }
    }
}

/// Broker errors
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {0} already has a consumer")]
    AlreadyConsumed(String),

    #[error("Broker connection failed: {0}")]
    Connection(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Stream of envelopes delivered to a queue consumer
pub type EnvelopeReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Minimal broker surface the tether transports rely on
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Get the backend name for logging and debugging
    fn backend_name(&self) -> &'static str;

    /// Create the queue if it does not exist
    async fn declare_queue(&self, name: &str) -> BrokerResult<()>;

    /// Delete the queue; its consumer sees the end of the stream
    async fn delete_queue(&self, name: &str) -> BrokerResult<()>;

    /// Whether the queue is still declared, like an AMQP passive declare
    async fn queue_exists(&self, name: &str) -> BrokerResult<bool>;

    async fn publish(&self, queue: &str, envelope: Envelope) -> BrokerResult<()>;

    /// Start consuming a queue. Each queue has at most one consumer.
    async fn consume(&self, queue: &str) -> BrokerResult<EnvelopeReceiver>;
}
