use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tether_session_storage::{MessageSink, SinkError};

/// Sink that records everything written to it
pub struct RecordingSink {
    transport_id: String,
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new(transport_id: &str) -> Arc<Self> {
        Arc::new(Self {
            transport_id: transport_id.to_string(),
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> String {
        self.transport_id.clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Act as a connection whose socket already went away
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    fn transport_id(&self) -> Option<&str> {
        Some(&self.transport_id)
    }

    async fn send(&self, message: String) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
