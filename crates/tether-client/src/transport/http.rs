//! HTTP long-poll transport
//!
//! Each message is one POST whose reply body (if any) is the server's
//! answer to it. Requests the server pushes are fetched with the `poll`
//! pseudo-method, which also ships back the responses we owe for them.
//! A fresh transport id header is generated on every connect so the
//! server can tell one logical connection from the next.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use tether_json_rpc::{JsonRpcMessage, JsonRpcRequest, RequestId, methods, parse_message};

use super::{
    ConnectionInfo, EventReceiver, EventSender, Transport, TransportCapabilities, TransportEvent,
    TransportType,
};
use crate::error::TransportError;

/// Header naming the logical connection
pub const TRANSPORT_ID_HEADER: &str = "x-tether-transport-id";

struct HttpState {
    endpoint: Url,
    client: Client,
    connected: AtomicBool,
    transport_id: Mutex<Option<String>>,
    session_id: watch::Sender<Option<String>>,
    /// Responses to pushed requests, shipped with the next `poll`
    owed: Mutex<Vec<Value>>,
    poll_counter: AtomicU64,
    poll_shutdown: Mutex<Option<CancellationToken>>,
    events: EventSender,
}

pub struct HttpTransport {
    state: Arc<HttpState>,
    receiver: Mutex<Option<EventReceiver>>,
}

impl HttpTransport {
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Http(format!("Failed to create HTTP client: {}", e)))?;
        Self::with_client(endpoint, client)
    }

    /// Create with a custom reqwest client
    pub fn with_client(endpoint: &str, client: Client) -> Result<Self, TransportError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| TransportError::ConnectionFailed(format!("Invalid URL: {}", e)))?;
        let (events, receiver) = mpsc::unbounded_channel();
        let (session_id, _) = watch::channel(None);

        Ok(Self {
            state: Arc::new(HttpState {
                endpoint,
                client,
                connected: AtomicBool::new(false),
                transport_id: Mutex::new(None),
                session_id,
                owed: Mutex::new(Vec::new()),
                poll_counter: AtomicU64::new(0),
                poll_shutdown: Mutex::new(None),
                events,
            }),
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Responses waiting for the next `poll`
    pub fn owed_responses(&self) -> usize {
        self.state.owed.lock().len()
    }
}

impl HttpState {
    /// One POST exchange. `Ok(None)` means the server had nothing to say.
    async fn post(&self, message: String) -> Result<Option<String>, TransportError> {
        let transport_id = self.transport_id.lock().clone().ok_or(TransportError::Closed)?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header(TRANSPORT_ID_HEADER, transport_id)
            .body(message)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let error = TransportError::from(e);
                self.mark_lost(&error.to_string());
                return Err(error);
            }
        };

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await.map_err(TransportError::from)?;
                Ok(Some(body))
            }
            StatusCode::NO_CONTENT => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TransportError::Http(format!("HTTP {}: {}", status, body)))
            }
        }
    }

    fn mark_lost(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(token) = self.poll_shutdown.lock().take() {
                token.cancel();
            }
            info!(endpoint = %self.endpoint, reason, "HTTP connection lost");
            let _ = self.events.send(TransportEvent::Disconnected(reason.to_string()));
        }
    }

    fn take_owed(&self) -> Vec<Value> {
        std::mem::take(&mut *self.owed.lock())
    }

    fn requeue_owed(&self, responses: Vec<Value>) {
        let mut owed = self.owed.lock();
        let newer = std::mem::replace(&mut *owed, responses);
        owed.extend(newer);
    }

    /// Send one `poll` and report every delivered message
    async fn poll_once(&self, session_id: Option<String>) -> Result<(), TransportError> {
        let responses = self.take_owed();
        let id = RequestId::String(format!(
            "poll-{}",
            self.poll_counter.fetch_add(1, Ordering::Relaxed) + 1
        ));
        let request = JsonRpcRequest::new(id, methods::POLL, Some(json!({ "responses": &responses })))
            .with_session_id(session_id);
        let text = serde_json::to_string(&request)?;

        let body = match self.post(text).await {
            Ok(body) => body,
            Err(e) => {
                self.requeue_owed(responses);
                return Err(e);
            }
        };
        let Some(body) = body else {
            return Ok(());
        };

        match parse_message(&body) {
            Ok(JsonRpcMessage::Response(response)) => match response.into_result() {
                Ok(Value::Array(messages)) => {
                    for message in messages {
                        let _ = self.events.send(TransportEvent::Message(message.to_string()));
                    }
                }
                Ok(other) => warn!("Unexpected poll result: {}", other),
                Err(error) => warn!(code = error.code, "Poll rejected: {}", error.message),
            },
            Ok(JsonRpcMessage::Request(_)) => warn!("Poll answered with a request, ignoring it"),
            Err(e) => warn!("Unreadable poll reply: {}", e),
        }
        Ok(())
    }

    /// Poll continuously once a session exists, until shut down or the
    /// connection is lost
    async fn poll_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut session_rx = self.session_id.subscribe();
        loop {
            let session_id = session_rx.borrow_and_update().clone();
            if session_id.is_none() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = session_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.poll_once(session_id) => {
                    if let Err(e) = result {
                        if !self.connected.load(Ordering::SeqCst) {
                            break;
                        }
                        debug!(error = %e, "Poll failed, retrying");
                        let _ = self.events.send(TransportEvent::Error(e.to_string()));
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
        debug!(endpoint = %self.endpoint, "Poll loop stopped");
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Http
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            bidirectional: false,
            persistent: false,
            correlated: true,
            max_message_size: Some(1024 * 1024),
        }
    }

    async fn connect_if_necessary(&self) -> Result<bool, TransportError> {
        if self.state.connected.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let transport_id = Uuid::new_v4().to_string();
        info!(endpoint = %self.state.endpoint, transport_id = %transport_id, "HTTP transport connected");
        *self.state.transport_id.lock() = Some(transport_id);

        let shutdown = CancellationToken::new();
        if let Some(previous) = self.state.poll_shutdown.lock().replace(shutdown.clone()) {
            previous.cancel();
        }
        tokio::spawn(Arc::clone(&self.state).poll_loop(shutdown));

        let _ = self.state.events.send(TransportEvent::Connected);
        Ok(true)
    }

    async fn send(&self, message: String) -> Result<(), TransportError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(body) = self.state.post(message).await? {
            let _ = self.state.events.send(TransportEvent::Message(body));
        }
        Ok(())
    }

    /// Queue the response and ship it right away with its own `poll`
    async fn send_response(&self, message: String) -> Result<(), TransportError> {
        let value: Value = serde_json::from_str(&message)?;
        self.state.owed.lock().push(value);

        let state = Arc::clone(&self.state);
        let session_id = state.session_id.borrow().clone();
        tokio::spawn(async move {
            if let Err(e) = state.poll_once(session_id).await {
                debug!(error = %e, "Flushing owed responses failed, next poll retries");
            }
        });
        Ok(())
    }

    async fn close(&self) {
        self.drop_connection("closed by client").await;
        *self.state.transport_id.lock() = None;
    }

    async fn drop_connection(&self, reason: &str) {
        self.state.mark_lost(reason);
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn take_event_receiver(&self) -> Option<EventReceiver> {
        self.receiver.lock().take()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            transport_type: TransportType::Http,
            endpoint: self.state.endpoint.to_string(),
            connected: self.is_connected(),
            transport_id: self.state.transport_id.lock().clone(),
        }
    }

    fn set_session_id(&self, session_id: Option<String>) {
        self.state.session_id.send_replace(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_connect_assigns_fresh_transport_id() {
        let transport = HttpTransport::new("http://127.0.0.1:1/jsonrpc", Duration::from_secs(1)).unwrap();
        assert!(transport.connection_info().transport_id.is_none());

        assert!(assert_ok!(transport.connect_if_necessary().await));
        assert!(!assert_ok!(transport.connect_if_necessary().await));
        let first = transport.connection_info().transport_id.unwrap();

        transport.drop_connection("test").await;
        assert!(!transport.is_connected());
        assert!(transport.connect_if_necessary().await.unwrap());
        let second = transport.connection_info().transport_id.unwrap();
        assert_ne!(first, second);

        transport.close().await;
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let transport = HttpTransport::new("http://127.0.0.1:1/jsonrpc", Duration::from_secs(1)).unwrap();
        let mut events = transport.take_event_receiver().unwrap();

        transport.connect_if_necessary().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        transport.drop_connection("keep-alive failed").await;
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Disconnected("keep-alive failed".to_string()))
        );
    }

    #[test]
    fn test_requeue_keeps_order() {
        let transport = HttpTransport::new("http://127.0.0.1:1/jsonrpc", Duration::from_secs(1)).unwrap();
        transport.state.owed.lock().push(json!(3));
        transport.state.requeue_owed(vec![json!(1), json!(2)]);
        assert_eq!(transport.state.take_owed(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(transport.owed_responses(), 0);
    }
}
