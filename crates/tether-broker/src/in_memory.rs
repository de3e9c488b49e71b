//! In-process broker backed by unbounded tokio channels, one per queue

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{BrokerError, BrokerResult, Envelope, EnvelopeReceiver, MessageBroker};

struct QueueState {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Option<EnvelopeReceiver>,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    fn backend_name(&self) -> &'static str {
        "InMemory"
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        let mut queues = self.queues.lock();
        if !queues.contains_key(name) {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(name.to_string(), QueueState { tx, rx: Some(rx) });
            debug!(queue = name, "Declared queue");
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        match self.queues.lock().remove(name) {
            Some(_) => {
                debug!(queue = name, "Deleted queue");
                Ok(())
            }
            None => Err(BrokerError::QueueNotFound(name.to_string())),
        }
    }

    async fn queue_exists(&self, name: &str) -> BrokerResult<bool> {
        Ok(self.queues.lock().contains_key(name))
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> BrokerResult<()> {
        let queues = self.queues.lock();
        let state = queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        state
            .tx
            .send(envelope)
            .map_err(|_| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn consume(&self, queue: &str) -> BrokerResult<EnvelopeReceiver> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        state
            .rx
            .take()
            .ok_or_else(|| BrokerError::AlreadyConsumed(queue.to_string()))
    }
}
