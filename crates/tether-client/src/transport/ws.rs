//! WebSocket transport
//!
//! The write half sits behind an async mutex so concurrent callers take
//! turns on the socket; a reader task per connection forwards every frame
//! as a [`TransportEvent::Message`].

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    ConnectionInfo, EventReceiver, EventSender, Transport, TransportCapabilities, TransportEvent,
    TransportType,
};
use crate::error::TransportError;

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// One physical socket
struct Connection {
    writer: WsWriter,
    reader: JoinHandle<()>,
    /// Cleared by whichever side notices the socket is gone first
    alive: Arc<AtomicBool>,
}

pub struct WsTransport {
    url: Url,
    connect_timeout: Duration,
    connection: tokio::sync::Mutex<Option<Connection>>,
    current_alive: Mutex<Option<Arc<AtomicBool>>>,
    events: EventSender,
    receiver: Mutex<Option<EventReceiver>>,
}

impl WsTransport {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::ConnectionFailed(format!("Invalid URL: {}", e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::Unsupported(format!(
                "WebSocket transport needs a ws:// or wss:// URL, got {}",
                url
            )));
        }

        let (events, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            url,
            connect_timeout,
            connection: tokio::sync::Mutex::new(None),
            current_alive: Mutex::new(None),
            events,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    async fn teardown(&self, reason: &str) {
        let connection = self.connection.lock().await.take();
        let Some(mut connection) = connection else {
            return;
        };

        let _ = connection.writer.close().await;
        connection.reader.abort();
        if connection.alive.swap(false, Ordering::SeqCst) {
            info!(url = %self.url, reason, "WebSocket connection closed");
            let _ = self.events.send(TransportEvent::Disconnected(reason.to_string()));
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            bidirectional: true,
            persistent: true,
            correlated: false,
            max_message_size: None,
        }
    }

    async fn connect_if_necessary(&self) -> Result<bool, TransportError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            if connection.alive.load(Ordering::SeqCst) {
                return Ok(false);
            }
            // The reader already reported the loss
            connection.reader.abort();
            *guard = None;
        }

        debug!(url = %self.url, "Opening WebSocket connection");
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("Timed out connecting to {}", self.url)))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (writer, mut read) = stream.split();
        let alive = Arc::new(AtomicBool::new(true));
        let events = self.events.clone();
        let reader_alive = Arc::clone(&alive);
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Message(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            let _ = events.send(TransportEvent::Message(text));
                        }
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) => break "closed by server".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "connection closed".to_string(),
                }
            };
            if reader_alive.swap(false, Ordering::SeqCst) {
                info!(reason = %reason, "WebSocket connection lost");
                let _ = events.send(TransportEvent::Disconnected(reason));
            }
        });

        *self.current_alive.lock() = Some(Arc::clone(&alive));
        *guard = Some(Connection {
            writer,
            reader,
            alive,
        });
        drop(guard);

        info!(url = %self.url, "WebSocket connected");
        let _ = self.events.send(TransportEvent::Connected);
        Ok(true)
    }

    async fn send(&self, message: String) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(TransportError::Closed)?;
        if !connection.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        connection.writer.send(Message::text(message)).await?;
        Ok(())
    }

    async fn close(&self) {
        self.teardown("closed by client").await;
    }

    async fn drop_connection(&self, reason: &str) {
        self.teardown(reason).await;
    }

    fn is_connected(&self) -> bool {
        self.current_alive
            .lock()
            .as_ref()
            .is_some_and(|alive| alive.load(Ordering::SeqCst))
    }

    fn take_event_receiver(&self) -> Option<EventReceiver> {
        self.receiver.lock().take()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            transport_type: TransportType::WebSocket,
            endpoint: self.url.to_string(),
            connected: self.is_connected(),
            // Assigned by the server and never told to the client
            transport_id: None,
        }
    }
}
