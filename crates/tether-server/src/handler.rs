//! Business handler collaborator and the per-request transaction it answers through

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use tether_json_rpc::{JsonRpcErrorObject, JsonRpcRequest, JsonRpcResponse, RequestId};
use tether_session_storage::{MessageSink, ServerSession};

use crate::error::TransactionError;

/// Error type returned by business handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Trait implemented by the application behind a tether server
#[async_trait]
pub trait JsonRpcHandler: Send + Sync {
    /// Handle a request. Answer it through `transaction` exactly once,
    /// unless it is a notification. Returning without answering sends a
    /// `null` result; returning an error sends a handler error.
    async fn handle_request(
        &self,
        session: Arc<ServerSession>,
        transaction: Transaction,
        request: JsonRpcRequest,
    ) -> HandlerResult<()>;

    /// Called once when a session is created
    async fn after_connection_established(&self, session: Arc<ServerSession>) {
        let _ = session;
    }

    /// Called once when a session is destroyed
    async fn after_connection_closed(&self, session: Arc<ServerSession>, reason: &str) {
        let _ = (session, reason);
    }

    /// Called when the connection a session is bound to fails
    async fn handle_transport_error(&self, session: Arc<ServerSession>, error: &str) {
        let _ = (session, error);
    }

    /// Liveness check for one object the client keeps alive
    async fn keep_alive(&self, session: Arc<ServerSession>, object: Option<Value>) -> HandlerResult<()> {
        let _ = (session, object);
        Ok(())
    }
}

struct TransactionInner {
    request_id: Option<RequestId>,
    method: String,
    session: Arc<ServerSession>,
    reply: Arc<dyn MessageSink>,
    responded: AtomicBool,
    deferred: AtomicBool,
}

/// Response slot for one inbound request.
///
/// Cloneable so a handler can answer from another task after calling
/// [`Transaction::start_async`]. Only the first answer reaches the wire.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(
        request: &JsonRpcRequest,
        session: Arc<ServerSession>,
        reply: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                request_id: request.id.clone(),
                method: request.method.clone(),
                session,
                reply,
                responded: AtomicBool::new(false),
                deferred: AtomicBool::new(false),
            }),
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.inner.request_id.as_ref()
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn session(&self) -> &Arc<ServerSession> {
        &self.inner.session
    }

    pub fn is_notification(&self) -> bool {
        self.inner.request_id.is_none()
    }

    pub fn is_responded(&self) -> bool {
        self.inner.responded.load(Ordering::SeqCst)
    }

    /// Keep the transaction open after `handle_request` returns
    pub fn start_async(&self) {
        self.inner.deferred.store(true, Ordering::SeqCst);
    }

    pub fn is_async(&self) -> bool {
        self.inner.deferred.load(Ordering::SeqCst)
    }

    pub async fn send_response(&self, result: Value) -> Result<(), TransactionError> {
        match self.inner.request_id.clone() {
            Some(id) => self.respond(JsonRpcResponse::success(id, result)).await,
            None => Ok(()),
        }
    }

    pub async fn send_error(
        &self,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), TransactionError> {
        self.send_error_object(JsonRpcErrorObject::with_code(code, message, data))
            .await
    }

    pub async fn send_error_object(&self, error: JsonRpcErrorObject) -> Result<(), TransactionError> {
        match self.inner.request_id.clone() {
            Some(id) => self.respond(JsonRpcResponse::error(Some(id), error)).await,
            None => Ok(()),
        }
    }

    async fn respond(&self, response: JsonRpcResponse) -> Result<(), TransactionError> {
        if self.inner.responded.swap(true, Ordering::SeqCst) {
            let id = response.id.map(|id| id.to_string()).unwrap_or_default();
            warn!(
                session_id = %self.inner.session.session_id(),
                request_id = %id,
                method = %self.inner.method,
                "Rejected second response for request"
            );
            return Err(TransactionError::AlreadyResponded(id));
        }

        let session_id = self.inner.session.session_id().to_string();
        let text = serde_json::to_string(&response.with_session_id(Some(session_id)))?;

        if let Err(e) = self.inner.reply.send(text.clone()).await {
            // The exchange is gone; the session delivers it on its next channel
            debug!(
                session_id = %self.inner.session.session_id(),
                error = %e,
                "Reply channel closed, handing response to session"
            );
            self.inner.session.deliver(text).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("request_id", &self.inner.request_id)
            .field("method", &self.inner.method)
            .field("responded", &self.is_responded())
            .finish()
    }
}
