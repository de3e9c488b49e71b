//! In-process transport for driving the client from tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use tether_json_rpc::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, parse_message};

use crate::error::TransportError;
use crate::transport::{
    ConnectionInfo, EventReceiver, EventSender, Transport, TransportCapabilities, TransportEvent,
    TransportType,
};

struct MockState {
    connected: AtomicBool,
    failing_sends: AtomicUsize,
    events: EventSender,
}

impl MockState {
    fn disconnect(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected(reason.to_string()));
        }
    }
}

pub struct MockTransport {
    state: Arc<MockState>,
    sent: mpsc::UnboundedSender<String>,
    responses: mpsc::UnboundedSender<String>,
    receiver: Mutex<Option<EventReceiver>>,
}

/// The server side of a [`MockTransport`]
pub struct Peer {
    state: Arc<MockState>,
    sent: mpsc::UnboundedReceiver<String>,
    responses: mpsc::UnboundedReceiver<String>,
}

impl MockTransport {
    pub fn pair() -> (Self, Peer) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            connected: AtomicBool::new(false),
            failing_sends: AtomicUsize::new(0),
            events,
        });

        let transport = Self {
            state: Arc::clone(&state),
            sent: sent_tx,
            responses: responses_tx,
            receiver: Mutex::new(Some(receiver)),
        };
        let peer = Peer {
            state,
            sent: sent_rx,
            responses: responses_rx,
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for MockTransport {
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
        if self.state.connected.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let _ = self.state.events.send(TransportEvent::Connected);
        Ok(true)
    }

    async fn send(&self, message: String) -> Result<(), TransportError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let failing = self.state.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_sends.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionFailed("injected failure".to_string()));
        }
        self.sent.send(message).map_err(|_| TransportError::Closed)
    }

    async fn send_response(&self, message: String) -> Result<(), TransportError> {
        self.responses.send(message).map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.state.disconnect("closed by client");
    }

    async fn drop_connection(&self, reason: &str) {
        self.state.disconnect(reason);
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn take_event_receiver(&self) -> Option<EventReceiver> {
        self.receiver.lock().take()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            transport_type: TransportType::WebSocket,
            endpoint: "mock".to_string(),
            connected: self.is_connected(),
            transport_id: None,
        }
    }
}

impl Peer {
    /// Next request the client sent
    pub async fn next_request(&mut self) -> JsonRpcRequest {
        loop {
            let text = self.sent.recv().await.expect("client transport dropped");
            if let Ok(JsonRpcMessage::Request(request)) = parse_message(&text) {
                return request;
            }
        }
    }

    /// Next response the client gave to a pushed request
    pub async fn next_response(&mut self) -> JsonRpcResponse {
        let text = self.responses.recv().await.expect("client transport dropped");
        match parse_message(&text) {
            Ok(JsonRpcMessage::Response(response)) => response,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    pub fn respond(&self, response: JsonRpcResponse) {
        let text = serde_json::to_string(&response).unwrap();
        let _ = self.state.events.send(TransportEvent::Message(text));
    }

    pub fn push(&self, request: JsonRpcRequest) {
        let text = serde_json::to_string(&request).unwrap();
        let _ = self.state.events.send(TransportEvent::Message(text));
    }

    pub fn disconnect(&self, reason: &str) {
        self.state.disconnect(reason);
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.state.failing_sends.store(count, Ordering::SeqCst);
    }
}
