//! HTTP long-poll transport
//!
//! Every POST carries one message and receives the single response to it
//! (or 204 when there is none). Requests the server pushes to an HTTP
//! client wait in its session outbox until the client's next `poll`.
//!
//! HTTP has no persistent connection, so the client names its logical
//! connection with the [`TRANSPORT_ID_HEADER`] header. The binding is
//! considered lost whenever no exchange on that id is in flight.

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use tether_session_storage::{MessageSink, SinkError};

use super::{ResponseBody, json_response, status_response};
use crate::protocol::{InboundContext, ProtocolManager};

/// Header carrying the client's transport id
pub const TRANSPORT_ID_HEADER: &str = "x-tether-transport-id";

/// Reply slot of one HTTP exchange. Accepts a single message.
struct ExchangeSink {
    transport_id: Option<String>,
    slot: Mutex<Option<oneshot::Sender<String>>>,
}

#[async_trait]
impl MessageSink for ExchangeSink {
    fn transport_id(&self) -> Option<&str> {
        self.transport_id.as_deref()
    }

    async fn send(&self, message: String) -> Result<(), SinkError> {
        let sender = self.slot.lock().take().ok_or(SinkError::Closed)?;
        sender.send(message).map_err(|_| SinkError::Closed)
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    protocol: ProtocolManager,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
}

impl HttpTransport {
    pub fn new(protocol: ProtocolManager) -> Self {
        Self {
            protocol,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serve one POST exchange
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        if req.method() != Method::POST {
            return status_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }

        let transport_id = req
            .headers()
            .get(TRANSPORT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let config = self.protocol.config();
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return status_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };
        if body.len() > config.max_body_size {
            return status_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
        let text = String::from_utf8_lossy(&body).into_owned();

        let (tx, rx) = oneshot::channel();
        let reply = Arc::new(ExchangeSink {
            transport_id: transport_id.clone(),
            slot: Mutex::new(Some(tx)),
        });
        let ctx = InboundContext::new(transport_id.clone(), reply);

        if let Some(transport_id) = &transport_id {
            self.enter(transport_id);
        }

        let protocol = self.protocol.clone();
        tokio::spawn(async move {
            protocol.process_message(&text, ctx).await;
        });
        let outcome = tokio::time::timeout(config.http_response_timeout, rx).await;

        if let Some(transport_id) = &transport_id {
            self.leave(transport_id).await;
        }

        match outcome {
            Ok(Ok(message)) => json_response(message),
            // Notifications and bare responses get no answer
            Ok(Err(_)) => status_response(StatusCode::NO_CONTENT, ""),
            Err(_) => {
                debug!(transport_id = ?transport_id, "Exchange timed out waiting for a response");
                status_response(StatusCode::GATEWAY_TIMEOUT, "Response timed out")
            }
        }
    }

    /// Number of exchanges currently open for a transport id
    pub fn in_flight(&self, transport_id: &str) -> usize {
        self.in_flight.lock().get(transport_id).copied().unwrap_or(0)
    }

    fn enter(&self, transport_id: &str) {
        *self
            .in_flight
            .lock()
            .entry(transport_id.to_string())
            .or_insert(0) += 1;
    }

    async fn leave(&self, transport_id: &str) {
        let idle = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get_mut(transport_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    in_flight.remove(transport_id);
                    true
                }
                None => false,
            }
        };
        if idle {
            self.protocol
                .close_session_if_timeout(transport_id, "no exchange in flight")
                .await;
        }
    }
}
