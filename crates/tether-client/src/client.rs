//! Request sender
//!
//! [`JsonRpcClient`] allocates ids, registers each call in a
//! [`PendingRequests`] registry and matches responses back to it from a
//! single reader task. Calls either await their response under a hard
//! deadline or hand it to a callback run on a bounded worker pool.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_json_rpc::{
    JsonRpcErrorObject, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, PendingError,
    PendingOutcome, PendingRequests, RECONNECTION_SUCCESSFUL, RequestId, methods, parse_message,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult, TransportError};
use crate::handler::ServerRequestHandler;
use crate::keepalive::KeepAliveManager;
use crate::session::{ClientSession, SessionInfo, SessionState};
use crate::transport::{BoxedTransport, Transport, TransportEvent, TransportFactory};

/// Connection lifecycle as seen by the client's owner
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// First physical connection of a session-less client
    Connected,
    Disconnected(String),
    Reconnecting { attempt: u32 },
    /// Connection restored. `same_session` is false when the server had
    /// already discarded our session.
    Reconnected { same_session: bool },
    SessionExpired { session_id: String },
}

/// Cloneable handle to one logical client
#[derive(Clone)]
pub struct JsonRpcClient {
    inner: Arc<ClientInner>,
}

/// Handle that does not keep the client alive
#[derive(Clone)]
pub(crate) struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    pub(crate) fn upgrade(&self) -> Option<JsonRpcClient> {
        self.0.upgrade().map(|inner| JsonRpcClient { inner })
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    pending: PendingRequests,
    session: ClientSession,
    next_id: AtomicI64,
    /// Held while connecting and running the reconnect handshake
    connect_lock: tokio::sync::Mutex<()>,
    needs_handshake: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    workers: Arc<Semaphore>,
    server_handler: Option<Arc<dyn ServerRequestHandler>>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
    keep_alive: Mutex<Option<Arc<KeepAliveManager>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let cancelled = self.pending.cancel_all("client dropped");
        if cancelled > 0 {
            debug!(cancelled, "Client dropped with requests in flight");
        }
    }
}

impl JsonRpcClient {
    pub fn builder() -> JsonRpcClientBuilder {
        JsonRpcClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.session_id()
    }

    pub fn session_info(&self) -> SessionInfo {
        self.inner.session.info()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The client's keep-alive manager, configured from its settings.
    /// Already running when `keep_alive.enabled` is set.
    pub fn keep_alive(&self) -> Arc<KeepAliveManager> {
        let mut slot = self.inner.keep_alive.lock();
        let manager = slot.get_or_insert_with(|| {
            Arc::new(KeepAliveManager::new(self, self.inner.config.keep_alive.clone()))
        });
        Arc::clone(manager)
    }

    pub(crate) fn downgrade(&self) -> WeakClient {
        WeakClient(Arc::downgrade(&self.inner))
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Establish the connection now instead of on the first request
    pub async fn connect(&self) -> ClientResult<()> {
        self.inner.ensure_connected().await
    }

    /// Call `method` and deserialize its result
    pub async fn send_request<T>(&self, method: &str, params: Option<Value>) -> ClientResult<T>
    where
        T: DeserializeOwned,
    {
        let value = self.send_request_value(method, params).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Transport(e.into()))
    }

    pub async fn send_request_value(&self, method: &str, params: Option<Value>) -> ClientResult<Value> {
        self.send_request_with_timeout(method, params, self.inner.config.timeouts.request)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> ClientResult<Value> {
        self.inner.ensure_connected().await?;
        let request = self.inner.new_request(method, params);
        self.inner.call(request, timeout).await
    }

    /// Send a request and return at once. `callback` receives the outcome
    /// on the worker pool, so it may itself issue requests.
    pub async fn send_request_with_callback<F>(
        &self,
        method: &str,
        params: Option<Value>,
        callback: F,
    ) -> ClientResult<RequestId>
    where
        F: FnOnce(ClientResult<Value>) + Send + 'static,
    {
        self.inner.ensure_connected().await?;
        let request = self.inner.new_request(method, params);
        let id = request
            .id
            .clone()
            .ok_or_else(|| ClientError::Transport(TransportError::Closed))?;
        let text = serde_json::to_string(&request).map_err(TransportError::from)?;

        let weak = Arc::downgrade(&self.inner);
        let workers = Arc::clone(&self.inner.workers);
        self.inner
            .pending
            .prepare_continuation(
                id.clone(),
                Box::new(move |outcome: PendingOutcome| {
                    // Slots can be cancelled while the client is dropped outside a runtime
                    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                        callback(Err(ClientError::Closed));
                        return;
                    };
                    runtime.spawn(async move {
                        let Ok(_permit) = workers.acquire_owned().await else {
                            return;
                        };
                        let result = match weak.upgrade() {
                            Some(inner) => inner.finish(outcome),
                            None => Err(ClientError::Closed),
                        };
                        callback(result);
                    });
                }),
            )
            .map_err(|e| self.inner.pending_error(e))?;

        if let Err(e) = self.inner.send_with_retry(text).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }

        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.timeouts.request;
        let expiry_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade()
                && inner.pending.expire(&expiry_id)
            {
                debug!(request_id = %expiry_id, "Callback request timed out");
            }
        });

        Ok(id)
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> ClientResult<()> {
        self.inner.ensure_connected().await?;
        let notification = JsonRpcRequest::notification(method, params)
            .with_session_id(self.inner.session.session_id());
        let text = serde_json::to_string(&notification).map_err(TransportError::from)?;
        self.inner.send_with_retry(text).await
    }

    /// Tear down the physical connection as if it had failed, which starts
    /// the reconnect cycle
    pub async fn report_transport_loss(&self, reason: &str) {
        warn!(reason, "Transport loss reported");
        self.inner.transport.drop_connection(reason).await;
    }

    /// Close the client. Pending requests fail with [`ClientError::Closed`].
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = ?inner.session.session_id(), "Closing client");

        if inner.config.send_close_message
            && inner.session.session_id().is_some()
            && inner.transport.is_connected()
        {
            let request = inner.new_request(methods::CLOSE_SESSION, None);
            if let Err(e) = inner.call_once(request, inner.config.timeouts.request).await {
                warn!(error = %e, "closeSession failed, closing anyway");
            }
        }

        if let Some(manager) = inner.keep_alive.lock().as_ref() {
            manager.stop();
        }
        inner.shutdown.cancel();
        let cancelled = inner.pending.cancel_all("client closed");
        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending requests on close");
        }
        inner.transport.close().await;
        inner.session.set_state(SessionState::Closed);
    }
}

impl ClientInner {
    fn new_request(&self, method: &str, params: Option<Value>) -> JsonRpcRequest {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        JsonRpcRequest::new(id, method, params).with_session_id(self.session.session_id())
    }

    fn record_session(&self, session_id: Option<&str>) {
        if let Some(session_id) = session_id
            && self.session.record(session_id)
        {
            self.transport.set_session_id(Some(session_id.to_string()));
        }
    }

    fn pending_error(&self, error: PendingError) -> ClientError {
        match error {
            PendingError::Timeout(_) => ClientError::Timeout,
            _ if self.closed.load(Ordering::SeqCst) => ClientError::Closed,
            PendingError::Cancelled(reason) => ClientError::Transport(TransportError::ConnectionFailed(reason)),
            PendingError::DuplicateId(id) => ClientError::Transport(TransportError::ConnectionFailed(
                format!("request id {} already in flight", id),
            )),
        }
    }

    /// Turn a resolved slot into the caller's result
    fn finish(&self, outcome: PendingOutcome) -> ClientResult<Value> {
        let response = outcome.map_err(|e| self.pending_error(e))?;
        self.record_session(response.session_id.as_deref());
        response.into_result().map_err(ClientError::from_error_object)
    }

    /// Connect if needed and, after a lost connection, run the reconnect
    /// handshake before anything else goes out
    async fn ensure_connected(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let _guard = self.connect_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let fresh = self.transport.connect_if_necessary().await?;
        if fresh {
            self.session.set_state(SessionState::Connected);
            if self.session.session_id().is_some() {
                self.needs_handshake.store(true, Ordering::SeqCst);
            } else {
                let _ = self.events.send(ConnectionEvent::Connected);
            }
        }

        if self.needs_handshake.load(Ordering::SeqCst) {
            self.reconnect_handshake().await?;
            self.needs_handshake.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn reconnect_handshake(&self) -> ClientResult<()> {
        let Some(session_id) = self.session.session_id() else {
            return Ok(());
        };
        debug!(session_id = %session_id, "Sending reconnect handshake");

        let request = self.new_request(methods::RECONNECT, None);
        match self.call_once(request, self.config.timeouts.request).await {
            Ok(result) => {
                if result.as_str() != Some(RECONNECTION_SUCCESSFUL) {
                    warn!(session_id = %session_id, result = %result, "Unexpected reconnect result");
                }
                self.session.record_reconnect();
                info!(session_id = %session_id, "Session reconnected");
                let _ = self
                    .events
                    .send(ConnectionEvent::Reconnected { same_session: true });
                Ok(())
            }
            Err(ClientError::SessionExpired(message)) => {
                info!(session_id = %session_id, reason = %message, "Session expired, next request starts a new one");
                self.session.clear();
                self.transport.set_session_id(None);
                let _ = self.events.send(ConnectionEvent::SessionExpired { session_id });
                let _ = self
                    .events
                    .send(ConnectionEvent::Reconnected { same_session: false });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Register, send (with retries) and await one request under `timeout`
    async fn call(&self, request: JsonRpcRequest, timeout: Duration) -> ClientResult<Value> {
        let (id, text, rx) = self.register(&request)?;
        self.await_response(&request, id, timeout, async {
            self.send_with_retry(text).await?;
            rx.await.map_err(|_| ClientError::Closed)
        })
        .await
    }

    /// Like [`ClientInner::call`] but sends exactly once and never
    /// reconnects, for use while the connect lock is held
    async fn call_once(&self, request: JsonRpcRequest, timeout: Duration) -> ClientResult<Value> {
        let (id, text, rx) = self.register(&request)?;
        self.await_response(&request, id, timeout, async {
            self.transport.send(text).await?;
            rx.await.map_err(|_| ClientError::Closed)
        })
        .await
    }

    fn register(
        &self,
        request: &JsonRpcRequest,
    ) -> ClientResult<(RequestId, String, oneshot::Receiver<PendingOutcome>)> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| ClientError::Transport(TransportError::Closed))?;
        let text = serde_json::to_string(request).map_err(TransportError::from)?;
        let rx = self.pending.prepare(id.clone()).map_err(|e| self.pending_error(e))?;
        Ok((id, text, rx))
    }

    async fn await_response<F>(
        &self,
        request: &JsonRpcRequest,
        id: RequestId,
        timeout: Duration,
        exchange: F,
    ) -> ClientResult<Value>
    where
        F: Future<Output = ClientResult<PendingOutcome>>,
    {
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(outcome)) => self.finish(outcome),
            Ok(Err(e)) => {
                self.pending.remove(&id);
                Err(e)
            }
            Err(_) => {
                self.pending.remove(&id);
                debug!(request_id = %id, method = %request.method, "Request timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// Resend transport failures with backoff, reconnecting in between
    async fn send_with_retry(&self, text: String) -> ClientResult<()> {
        let mut attempt = 0;
        loop {
            let error = match self.transport.send(text.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !error.is_retryable() || !self.config.retry.should_retry(attempt) {
                return Err(error.into());
            }
            attempt += 1;
            let delay = self.config.retry.delay_for_attempt(attempt);
            debug!(attempt, error = %error, delay_ms = delay.as_millis() as u64, "Send failed, retrying");
            tokio::time::sleep(delay).await;

            if let Err(e) = self.ensure_connected().await {
                debug!(attempt, error = %e, "Reconnect before resend failed");
            }
        }
    }

    fn handle_message(self: &Arc<Self>, text: String) {
        match parse_message(&text) {
            Ok(JsonRpcMessage::Response(response)) => {
                self.record_session(response.session_id.as_deref());
                self.pending.resolve(response);
            }
            Ok(JsonRpcMessage::Request(request)) => self.dispatch_server_request(request),
            Err(e) => warn!(error = %e, "Dropping unreadable message"),
        }
    }

    fn dispatch_server_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let inner = Arc::clone(self);
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let params = request.params.clone();

            let Some(id) = request.id.clone() else {
                if let Some(handler) = &inner.server_handler {
                    handler.handle_notification(&request.method, params).await;
                }
                return;
            };

            let outcome = match &inner.server_handler {
                Some(handler) => handler.handle_request(&request.method, params).await,
                None => Err(JsonRpcErrorObject::method_not_found(&request.method)),
            };
            let response = match outcome {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(error) => JsonRpcResponse::error(Some(id), error),
            }
            .with_session_id(inner.session.session_id());

            let text = match serde_json::to_string(&response) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Failed to serialize response to server request");
                    return;
                }
            };
            if let Err(e) = inner.transport.send_response(text).await {
                warn!(method = %request.method, error = %e, "Failed to answer server request");
            }
        });
    }

    fn on_transport_lost(self: &Arc<Self>, reason: String) {
        let _ = self.events.send(ConnectionEvent::Disconnected(reason.clone()));
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        if !self.config.reconnect.enabled || self.session.session_id().is_none() {
            self.session.set_state(SessionState::Disconnected);
            let cancelled = self.pending.cancel_all(&reason);
            debug!(cancelled, reason = %reason, "Connection lost, not reconnecting");
            return;
        }

        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.set_state(SessionState::Reconnecting);
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.reconnect_loop().await });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt = 0;
        while self.config.reconnect.should_attempt(attempt) && !self.closed.load(Ordering::SeqCst) {
            attempt += 1;
            let _ = self.events.send(ConnectionEvent::Reconnecting { attempt });

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect.delay) => {}
            }

            match self.ensure_connected().await {
                Ok(()) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);
        if !self.closed.load(Ordering::SeqCst) && !self.transport.is_connected() {
            error!(attempts = attempt, "Giving up reconnecting");
            self.session.set_state(SessionState::Disconnected);
            self.pending.cancel_all("reconnection failed");
        }
    }
}

/// Feed transport events into the client until either side goes away
async fn read_events(
    weak: Weak<ClientInner>,
    mut events: crate::transport::EventReceiver,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Message(text) => inner.handle_message(text),
            TransportEvent::Disconnected(reason) => inner.on_transport_lost(reason),
            TransportEvent::Connected => debug!("Transport connected"),
            TransportEvent::Error(e) => debug!(error = %e, "Transport reported an error"),
        }
    }
    debug!("Client reader stopped");
}

/// Builder for creating clients
pub struct JsonRpcClientBuilder {
    transport: Option<BoxedTransport>,
    config: Option<ClientConfig>,
    server_handler: Option<Arc<dyn ServerRequestHandler>>,
}

impl JsonRpcClientBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            config: None,
            server_handler: None,
        }
    }

    pub fn with_transport(mut self, transport: BoxedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set transport from URL (`ws://` or `http://`)
    pub fn with_url(mut self, url: &str) -> ClientResult<Self> {
        let connect_timeout = self.config.clone().unwrap_or_default().timeouts.connect;
        self.transport = Some(TransportFactory::from_url(url, connect_timeout)?);
        Ok(self)
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_server_handler(mut self, handler: Arc<dyn ServerRequestHandler>) -> Self {
        self.server_handler = Some(handler);
        self
    }

    /// Build the client and start its reader. Must run inside a tokio runtime.
    pub fn build(self) -> ClientResult<JsonRpcClient> {
        let transport: Arc<dyn Transport> = Arc::from(
            self.transport
                .ok_or_else(|| TransportError::Unsupported("no transport configured".to_string()))?,
        );
        let events = transport
            .take_event_receiver()
            .ok_or_else(|| TransportError::Unsupported("transport already owned by a client".to_string()))?;
        let config = self.config.unwrap_or_default();
        let (event_tx, _) = broadcast::channel(64);

        let inner = Arc::new(ClientInner {
            transport,
            workers: Arc::new(Semaphore::new(config.workers.pool_size.max(1))),
            config,
            pending: PendingRequests::new(),
            session: ClientSession::new(),
            next_id: AtomicI64::new(1),
            connect_lock: tokio::sync::Mutex::new(()),
            needs_handshake: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            server_handler: self.server_handler,
            events: event_tx,
            shutdown: CancellationToken::new(),
            keep_alive: Mutex::new(None),
        });

        tokio::spawn(read_events(Arc::downgrade(&inner), events));
        let client = JsonRpcClient { inner };
        if client.inner.config.keep_alive.enabled {
            client.keep_alive().start();
        }
        Ok(client)
    }
}

impl Default for JsonRpcClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
