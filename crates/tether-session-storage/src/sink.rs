//! Outbound half of a physical connection as seen by a session

use async_trait::async_trait;

use crate::error::SinkError;

/// Something a server can write serialized messages to: a socket writer,
/// the reply slot of an HTTP exchange, or a broker reply queue.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Physical connection behind this sink, if it has one
    fn transport_id(&self) -> Option<&str>;

    async fn send(&self, message: String) -> Result<(), SinkError>;

    /// Tear down the physical connection. Connectionless sinks ignore it.
    async fn close(&self, _reason: &str) {}

    /// Whether the physical connection is known to be gone
    fn is_closed(&self) -> bool {
        false
    }
}
