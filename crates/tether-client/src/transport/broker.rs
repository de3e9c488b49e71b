//! Broker request/reply transport
//!
//! Messages go to the server's well-known queue with a private reply
//! queue and a fresh correlation id. Replies echoing an id we are still
//! waiting on are delivered; replies without one are server pushes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_broker::{Envelope, MessageBroker};
use tether_json_rpc::{JsonRpcMessage, parse_message};

use super::{
    ConnectionInfo, EventReceiver, EventSender, Transport, TransportCapabilities, TransportEvent,
    TransportType,
};
use crate::error::TransportError;

/// Prefix of every private reply queue
pub const REPLY_QUEUE_PREFIX: &str = "tether-client-";

struct Binding {
    reply_queue: String,
    consumer: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

pub struct BrokerTransport {
    broker: Arc<dyn MessageBroker>,
    server_queue: String,
    binding: tokio::sync::Mutex<Option<Binding>>,
    reply_queue: Mutex<Option<String>>,
    outstanding: Arc<Mutex<HashSet<String>>>,
    connected: Arc<AtomicBool>,
    events: EventSender,
    receiver: Mutex<Option<EventReceiver>>,
}

impl BrokerTransport {
    pub fn new(broker: Arc<dyn MessageBroker>, server_queue: impl Into<String>) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            broker,
            server_queue: server_queue.into(),
            binding: tokio::sync::Mutex::new(None),
            reply_queue: Mutex::new(None),
            outstanding: Arc::new(Mutex::new(HashSet::new())),
            connected: Arc::new(AtomicBool::new(false)),
            events,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Correlation ids still waiting for their reply
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    async fn teardown(&self, reason: &str) {
        let binding = self.binding.lock().await.take();
        let Some(binding) = binding else {
            return;
        };

        binding.consumer.abort();
        if let Err(e) = self.broker.delete_queue(&binding.reply_queue).await {
            debug!(queue = %binding.reply_queue, error = %e, "Reply queue already gone");
        }
        self.outstanding.lock().clear();
        self.connected.store(false, Ordering::SeqCst);

        if binding.alive.swap(false, Ordering::SeqCst) {
            info!(queue = %binding.reply_queue, reason, "Broker binding closed");
            let _ = self.events.send(TransportEvent::Disconnected(reason.to_string()));
        }
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Broker
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            bidirectional: true,
            persistent: false,
            correlated: true,
            max_message_size: None,
        }
    }

    async fn connect_if_necessary(&self) -> Result<bool, TransportError> {
        let mut guard = self.binding.lock().await;
        if let Some(binding) = guard.as_ref() {
            if binding.alive.load(Ordering::SeqCst) {
                return Ok(false);
            }
            binding.consumer.abort();
            *guard = None;
        }

        let reply_queue = format!("{}{}", REPLY_QUEUE_PREFIX, Uuid::new_v4());
        self.broker.declare_queue(&reply_queue).await?;
        let mut replies = self.broker.consume(&reply_queue).await?;

        let alive = Arc::new(AtomicBool::new(true));
        let consumer_alive = Arc::clone(&alive);
        let connected = Arc::clone(&self.connected);
        let outstanding = Arc::clone(&self.outstanding);
        let events = self.events.clone();
        let queue = reply_queue.clone();
        let consumer = tokio::spawn(async move {
            while let Some(envelope) = replies.recv().await {
                if let Some(correlation_id) = &envelope.correlation_id
                    && !outstanding.lock().remove(correlation_id)
                {
                    warn!(queue = %queue, correlation_id = %correlation_id, "Dropping reply with unknown correlation id");
                    continue;
                }
                let _ = events.send(TransportEvent::Message(envelope.body));
            }
            if consumer_alive.swap(false, Ordering::SeqCst) {
                connected.store(false, Ordering::SeqCst);
                info!(queue = %queue, "Reply queue deleted");
                let _ = events.send(TransportEvent::Disconnected("reply queue deleted".to_string()));
            }
        });

        info!(
            backend = self.broker.backend_name(),
            server_queue = %self.server_queue,
            reply_queue = %reply_queue,
            "Broker transport connected"
        );
        *self.reply_queue.lock() = Some(reply_queue.clone());
        *guard = Some(Binding {
            reply_queue,
            consumer,
            alive,
        });
        self.connected.store(true, Ordering::SeqCst);
        drop(guard);

        let _ = self.events.send(TransportEvent::Connected);
        Ok(true)
    }

    async fn send(&self, message: String) -> Result<(), TransportError> {
        let reply_queue = {
            let guard = self.binding.lock().await;
            match guard.as_ref() {
                Some(binding) if binding.alive.load(Ordering::SeqCst) => binding.reply_queue.clone(),
                _ => return Err(TransportError::Closed),
            }
        };

        let mut envelope = Envelope::new(message).with_reply_to(reply_queue);
        // Notifications and responses get no reply to correlate
        let correlation_id = expects_reply(&envelope.body).then(|| Uuid::new_v4().to_string());
        if let Some(correlation_id) = &correlation_id {
            self.outstanding.lock().insert(correlation_id.clone());
            envelope.correlation_id = Some(correlation_id.clone());
        }

        if let Err(e) = self.broker.publish(&self.server_queue, envelope).await {
            if let Some(correlation_id) = &correlation_id {
                self.outstanding.lock().remove(correlation_id);
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn close(&self) {
        self.teardown("closed by client").await;
    }

    async fn drop_connection(&self, reason: &str) {
        self.teardown(reason).await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn take_event_receiver(&self) -> Option<EventReceiver> {
        self.receiver.lock().take()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            transport_type: TransportType::Broker,
            endpoint: self.server_queue.clone(),
            connected: self.is_connected(),
            transport_id: self.reply_queue.lock().clone(),
        }
    }
}

fn expects_reply(message: &str) -> bool {
    matches!(
        parse_message(message),
        Ok(JsonRpcMessage::Request(request)) if !request.is_notification()
    )
}
