//! Broker request/reply bridge
//!
//! Consumes the server's well-known queue. The `reply_to` queue of each
//! envelope is the sender's transport id: responses are published there
//! echoing the request's correlation id, pushed messages without one.
//!
//! A broker gives no disconnect event. The bridge remembers every reply
//! queue it has answered on and periodically checks each one still
//! exists; a deleted reply queue is a lost transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_broker::{BrokerResult, Envelope, MessageBroker};
use tether_session_storage::{MessageSink, SinkError};

use crate::protocol::{InboundContext, ProtocolManager};

/// Publishes to a client's reply queue
struct ReplyQueueSink {
    broker: Arc<dyn MessageBroker>,
    reply_to: String,
    correlation_id: Option<String>,
}

#[async_trait]
impl MessageSink for ReplyQueueSink {
    fn transport_id(&self) -> Option<&str> {
        Some(&self.reply_to)
    }

    async fn send(&self, message: String) -> Result<(), SinkError> {
        let mut envelope = Envelope::new(message);
        envelope.correlation_id = self.correlation_id.clone();
        self.broker
            .publish(&self.reply_to, envelope)
            .await
            .map_err(|e| SinkError::Failed(e.to_string()))
    }
}

pub struct BrokerBridge {
    protocol: ProtocolManager,
    broker: Arc<dyn MessageBroker>,
    queue: String,
    reply_queues: Mutex<HashSet<String>>,
}

impl BrokerBridge {
    pub fn new(protocol: ProtocolManager, broker: Arc<dyn MessageBroker>, queue: impl Into<String>) -> Self {
        Self {
            protocol,
            broker,
            queue: queue.into(),
            reply_queues: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume the server queue until `shutdown` fires or the queue is deleted
    pub async fn run(&self, shutdown: CancellationToken) -> BrokerResult<()> {
        self.broker.declare_queue(&self.queue).await?;
        let mut envelopes = self.broker.consume(&self.queue).await?;
        info!(
            queue = %self.queue,
            backend = self.broker.backend_name(),
            "Broker bridge consuming"
        );

        let period = self.protocol.config().reply_queue_check_interval;
        let mut check = interval(period.max(Duration::from_millis(1)));
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = check.tick() => self.sweep_reply_queues().await,
                envelope = envelopes.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope),
                    None => {
                        debug!(queue = %self.queue, "Server queue deleted");
                        break;
                    }
                },
            }
        }

        info!(queue = %self.queue, "Broker bridge stopped");
        Ok(())
    }

    /// Reply queues seen since the last sweep found them deleted
    pub fn tracked_reply_queues(&self) -> usize {
        self.reply_queues.lock().len()
    }

    /// Start the grace window of every session whose reply queue is gone
    pub async fn sweep_reply_queues(&self) {
        let known: Vec<String> = self.reply_queues.lock().iter().cloned().collect();
        for reply_to in known {
            match self.broker.queue_exists(&reply_to).await {
                Ok(true) => {}
                Ok(false) => {
                    self.reply_queues.lock().remove(&reply_to);
                    debug!(queue = %reply_to, "Reply queue deleted");
                    self.protocol
                        .close_session_if_timeout(&reply_to, "reply queue deleted")
                        .await;
                }
                Err(e) => {
                    debug!(queue = %reply_to, error = %e, "Reply queue check failed");
                }
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let Some(reply_to) = envelope.reply_to else {
            warn!(queue = %self.queue, "Dropping envelope without reply queue");
            return;
        };
        self.reply_queues.lock().insert(reply_to.clone());

        let reply = Arc::new(ReplyQueueSink {
            broker: Arc::clone(&self.broker),
            reply_to: reply_to.clone(),
            correlation_id: envelope.correlation_id,
        });
        let channel = Arc::new(ReplyQueueSink {
            broker: Arc::clone(&self.broker),
            reply_to: reply_to.clone(),
            correlation_id: None,
        });
        let ctx = InboundContext::new(Some(reply_to), reply).with_channel(channel);

        let protocol = self.protocol.clone();
        let body = envelope.body;
        tokio::spawn(async move {
            protocol.process_message(&body, ctx).await;
        });
    }
}
