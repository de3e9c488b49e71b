//! WebSocket transport
//!
//! Writes go through a single-writer queue drained by one task per
//! socket, so any number of handlers can answer concurrently while the
//! reader keeps dispatching.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_session_storage::{MessageSink, SinkError};

use super::{ResponseBody, status_response};
use crate::protocol::{InboundContext, ProtocolManager};

/// Outbound half of one WebSocket connection
pub struct WsSink {
    transport_id: String,
    tx: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
}

#[async_trait]
impl MessageSink for WsSink {
    fn transport_id(&self) -> Option<&str> {
        Some(&self.transport_id)
    }

    async fn send(&self, message: String) -> Result<(), SinkError> {
        if self.shutdown.is_cancelled() {
            return Err(SinkError::Closed);
        }
        self.tx
            .send(Message::text(message))
            .map_err(|_| SinkError::Closed)
    }

    async fn close(&self, reason: &str) {
        debug!(transport_id = %self.transport_id, reason, "Closing WebSocket");
        self.shutdown.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Whether the request asks to switch to the WebSocket protocol
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    let websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    connection_upgrade && websocket
}

/// Answer the upgrade handshake and serve the socket once hyper hands it over
pub fn upgrade(mut req: Request<Incoming>, protocol: ProtocolManager) -> Response<ResponseBody> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return status_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
    };
    let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
        return status_response(StatusCode::BAD_REQUEST, "Invalid Sec-WebSocket-Key");
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let stream =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                serve_connection(protocol, stream).await;
            }
            Err(e) => warn!("WebSocket upgrade failed: {}", e),
        }
    });

    let mut response = status_response(StatusCode::SWITCHING_PROTOCOLS, "");
    let headers = response.headers_mut();
    headers.remove(hyper::header::CONTENT_TYPE);
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

/// Serve one WebSocket connection until it closes
pub async fn serve_connection<S>(protocol: ProtocolManager, stream: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let transport_id = Uuid::new_v4().to_string();
    let (mut write, mut read) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let shutdown = CancellationToken::new();
    let sink: Arc<dyn MessageSink> = Arc::new(WsSink {
        transport_id: transport_id.clone(),
        tx,
        shutdown: shutdown.clone(),
    });

    let writer_shutdown = shutdown.clone();
    let writer_id = transport_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => {
                        if let Err(e) = write.send(message).await {
                            debug!(transport_id = %writer_id, error = %e, "WebSocket write failed");
                            writer_shutdown.cancel();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = write.close().await;
    });

    info!(transport_id = %transport_id, "WebSocket connection opened");

    let mut failure = None;
    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break "closed by server".to_string(),
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&protocol, &transport_id, &sink, text.as_str().to_owned());
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => dispatch(&protocol, &transport_id, &sink, text),
                    Err(_) => warn!(transport_id = %transport_id, "Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) => break "closed by client".to_string(),
                // Control frames are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let error = e.to_string();
                    failure = Some(error.clone());
                    break error;
                }
                None => break "connection closed".to_string(),
            },
        }
    };

    shutdown.cancel();
    let _ = writer.await;
    info!(transport_id = %transport_id, reason = %reason, "WebSocket connection closed");

    match failure {
        Some(error) => protocol.transport_error(&transport_id, &error).await,
        None => protocol.close_session_if_timeout(&transport_id, &reason).await,
    }
}

fn dispatch(protocol: &ProtocolManager, transport_id: &str, sink: &Arc<dyn MessageSink>, text: String) {
    let protocol = protocol.clone();
    let ctx = InboundContext::duplex(transport_id, Arc::clone(sink));
    tokio::spawn(async move {
        protocol.process_message(&text, ctx).await;
    });
}
