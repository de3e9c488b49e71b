//! Protocol manager: maps every inbound message to its session and drives
//! the session lifecycle.
//!
//! Transports hand each message to [`ProtocolManager::process_message`]
//! together with an [`InboundContext`] describing where it came from.
//! Reserved methods (`reconnect`, `poll`, `ping`, `keepAlive`,
//! `closeSession`) are answered here; everything else goes to the
//! [`JsonRpcHandler`].

use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use tether_json_rpc::{
    JsonRpcErrorObject, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, PONG,
    RECONNECTION_SUCCESSFUL, error_reply, methods, parse_message, parse_value,
};
use tether_session_storage::{BoxedSessionStore, MessageSink, ServerSession};

use crate::config::ServerConfig;
use crate::handler::{JsonRpcHandler, Transaction};
use crate::watchdog::{PingTimeoutCallback, PingWatchdog};

/// Where an inbound message came from and where its answers go
#[derive(Clone)]
pub struct InboundContext {
    /// Physical connection the message arrived on
    pub transport_id: Option<String>,
    /// Receives the response to this message
    pub reply: Arc<dyn MessageSink>,
    /// Persistent push channel of the connection, if it has one
    pub channel: Option<Arc<dyn MessageSink>>,
}

impl InboundContext {
    pub fn new(transport_id: Option<String>, reply: Arc<dyn MessageSink>) -> Self {
        Self {
            transport_id,
            reply,
            channel: None,
        }
    }

    /// Use `reply` for server push as well
    pub fn duplex(transport_id: impl Into<String>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            transport_id: Some(transport_id.into()),
            reply: Arc::clone(&sink),
            channel: Some(sink),
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn MessageSink>) -> Self {
        self.channel = Some(channel);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct PollParams {
    #[serde(default)]
    responses: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct PingParams {
    /// Milliseconds between client pings
    interval: Option<u64>,
}

struct ProtocolInner {
    config: ServerConfig,
    store: Arc<BoxedSessionStore>,
    handler: Arc<dyn JsonRpcHandler>,
    watchdog: PingWatchdog,
}

#[derive(Clone)]
pub struct ProtocolManager {
    inner: Arc<ProtocolInner>,
}

impl ProtocolManager {
    pub fn new(
        config: ServerConfig,
        store: Arc<BoxedSessionStore>,
        handler: Arc<dyn JsonRpcHandler>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ProtocolInner>| {
            let weak = weak.clone();
            let on_timeout: PingTimeoutCallback = Arc::new(move |transport_id: String| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        ProtocolManager { inner }.on_ping_timeout(&transport_id).await;
                    }
                }
                .boxed()
            });

            ProtocolInner {
                watchdog: PingWatchdog::new(config.ping_watchdog.clone(), on_timeout),
                config,
                store,
                handler,
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<BoxedSessionStore> {
        &self.inner.store
    }

    pub fn watchdog(&self) -> &PingWatchdog {
        &self.inner.watchdog
    }

    // ------------------------------------------------------------------
    // Inbound routing
    // ------------------------------------------------------------------

    /// Route one inbound text message. Returns once the message has been
    /// handled; handlers that went async may answer later.
    pub async fn process_message(&self, text: &str, ctx: InboundContext) {
        match parse_message(text) {
            Ok(JsonRpcMessage::Request(request)) => self.route_request(request, &ctx).await,
            Ok(JsonRpcMessage::Response(response)) => self.route_response(response, &ctx).await,
            Err(e) => {
                warn!(transport_id = ?ctx.transport_id, error = %e, "Rejecting unreadable message");
                send_to(&ctx.reply, &error_reply(&e)).await;
            }
        }
    }

    async fn route_response(&self, response: JsonRpcResponse, ctx: &InboundContext) {
        let session = match response.session_id.as_deref() {
            Some(session_id) => self.inner.store.get_by_session_id(session_id).await,
            None => None,
        };
        let session = match (session, ctx.transport_id.as_deref()) {
            (Some(session), _) => Some(session),
            (None, Some(transport_id)) => self.inner.store.get_by_transport_id(transport_id).await,
            (None, None) => None,
        };

        match session {
            Some(session) => {
                session.touch();
                session.handle_response(response);
            }
            None => debug!(
                transport_id = ?ctx.transport_id,
                request_id = ?response.id,
                "Response for unknown session dropped"
            ),
        }
    }

    async fn route_request(&self, request: JsonRpcRequest, ctx: &InboundContext) {
        debug!(
            transport_id = ?ctx.transport_id,
            method = %request.method,
            request_id = ?request.id,
            "Inbound request"
        );

        match request.method.as_str() {
            methods::RECONNECT => self.handle_reconnect(request, ctx).await,
            methods::CLOSE_SESSION => self.handle_close_session(request, ctx).await,
            _ => {
                let session = match self.resolve_session(&request, ctx).await {
                    Ok(session) => session,
                    Err(error) => {
                        if let Some(id) = request.id {
                            send_to(&ctx.reply, &JsonRpcResponse::error(Some(id), error)).await;
                        }
                        return;
                    }
                };

                match request.method.as_str() {
                    methods::POLL => self.handle_poll(session, request, ctx).await,
                    methods::PING => self.handle_ping(session, request, ctx).await,
                    methods::KEEP_ALIVE => self.handle_keep_alive(session, request, ctx).await,
                    _ => self.dispatch(session, request, ctx).await,
                }
            }
        }
    }

    /// Find the session a request belongs to, creating one on first contact
    async fn resolve_session(
        &self,
        request: &JsonRpcRequest,
        ctx: &InboundContext,
    ) -> Result<Arc<ServerSession>, JsonRpcErrorObject> {
        let store = &self.inner.store;
        let transport_id = ctx.transport_id.as_deref();

        let mut existing = match request.session_id() {
            Some(session_id) => store.get_by_session_id(session_id).await,
            None => None,
        };
        if existing.is_none() {
            if let Some(transport_id) = transport_id {
                existing = store.get_by_transport_id(transport_id).await;
            }
        }

        if let Some(session) = existing {
            if session.revive() {
                self.bind_connection(&session, ctx).await;
                session.set_new(false);
                session.touch();
                self.close_if_channel_gone(&session, ctx).await;
                return Ok(session);
            }
            // Lost the race against its close timer
            store.remove(session.session_id()).await;
        }

        let reconnection_timeout = self.inner.config.reconnection_timeout;
        let push_request_timeout = self.inner.config.push_request_timeout;
        let factory = move || {
            ServerSession::new(reconnection_timeout).with_push_request_timeout(push_request_timeout)
        };
        let (session, created) = store
            .get_or_create(None, transport_id, &factory)
            .await
            .map_err(|e| JsonRpcErrorObject::internal_error(Some(e.to_string())))?;

        if created {
            if let Some(channel) = &ctx.channel {
                session.attach_sink(Arc::clone(channel)).await;
            }
            self.inner
                .handler
                .after_connection_established(Arc::clone(&session))
                .await;
        } else {
            session.revive();
            session.set_new(false);
            session.touch();
        }
        self.close_if_channel_gone(&session, ctx).await;
        Ok(session)
    }

    /// The transport may have closed, and run its close step, while this
    /// message was still resolving its session. Arm the timer here then.
    async fn close_if_channel_gone(&self, session: &ServerSession, ctx: &InboundContext) {
        let (Some(channel), Some(transport_id)) = (&ctx.channel, ctx.transport_id.as_deref()) else {
            return;
        };
        if channel.is_closed() && session.transport_id().as_deref() == Some(transport_id) {
            debug!(session_id = %session.session_id(), transport_id, "Session bound to a closed connection");
            self.close_session_if_timeout(transport_id, "connection closed").await;
        }
    }

    /// Point the session at the connection this message arrived on
    async fn bind_connection(&self, session: &Arc<ServerSession>, ctx: &InboundContext) {
        let Some(transport_id) = ctx.transport_id.as_deref() else {
            return;
        };
        let previous = session.transport_id();
        if previous.as_deref() != Some(transport_id) {
            if let Err(e) = self.inner.store.rebind(session, Some(transport_id)).await {
                warn!(session_id = %session.session_id(), error = %e, "Rebind failed");
                return;
            }
            if let Some(previous) = previous.as_deref() {
                self.inner.watchdog.update_transport_id(previous, transport_id);
            }
            info!(
                session_id = %session.session_id(),
                from = ?previous,
                to = transport_id,
                "Session moved to new transport"
            );
        }

        let attached = session
            .sink()
            .and_then(|sink| sink.transport_id().map(str::to_string));
        if attached.as_deref() != Some(transport_id) {
            if let Some(channel) = &ctx.channel {
                session.attach_sink(Arc::clone(channel)).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Reserved methods
    // ------------------------------------------------------------------

    async fn handle_reconnect(&self, request: JsonRpcRequest, ctx: &InboundContext) {
        let Some(id) = request.id.clone() else {
            debug!("Ignoring reconnect sent as notification");
            return;
        };
        let Some(session_id) = request.session_id().map(str::to_string) else {
            let error =
                JsonRpcErrorObject::invalid_params("SessionId is mandatory in a reconnection request");
            send_to(&ctx.reply, &JsonRpcResponse::error(Some(id), error)).await;
            return;
        };

        let session = self.inner.store.get_by_session_id(&session_id).await;
        let response = match session {
            Some(session) if session.revive() => {
                self.bind_connection(&session, ctx).await;
                session.set_new(false);
                session.touch();
                self.close_if_channel_gone(&session, ctx).await;
                info!(session_id = %session_id, transport_id = ?ctx.transport_id, "Session reconnected");
                JsonRpcResponse::success(id, Value::String(RECONNECTION_SUCCESSFUL.to_string()))
                    .with_session_id(Some(session_id))
            }
            _ => {
                info!(session_id = %session_id, "Reconnect to unknown or expired session");
                JsonRpcResponse::error(
                    Some(id),
                    JsonRpcErrorObject::reconnection_error(&format!(
                        "Session {} not found or expired",
                        session_id
                    )),
                )
            }
        };
        send_to(&ctx.reply, &response).await;
    }

    async fn handle_close_session(&self, request: JsonRpcRequest, ctx: &InboundContext) {
        let session = match request.session_id() {
            Some(session_id) => self.inner.store.get_by_session_id(session_id).await,
            None => match ctx.transport_id.as_deref() {
                Some(transport_id) => self.inner.store.get_by_transport_id(transport_id).await,
                None => None,
            },
        };

        let session_id = session.as_ref().map(|s| s.session_id().to_string());
        if let Some(session) = session {
            self.destroy_session(session, "client closed").await;
        }

        if let Some(id) = request.id {
            send_to(
                &ctx.reply,
                &JsonRpcResponse::null(id).with_session_id(session_id),
            )
            .await;
        }
    }

    async fn handle_poll(&self, session: Arc<ServerSession>, request: JsonRpcRequest, ctx: &InboundContext) {
        let params: PollParams = request.params_as().unwrap_or_default();
        for value in params.responses {
            match parse_value(value) {
                Ok(JsonRpcMessage::Response(response)) => {
                    session.handle_response(response);
                }
                Ok(JsonRpcMessage::Request(_)) => {
                    warn!(session_id = %session.session_id(), "Poll carried a request, ignoring it");
                }
                Err(e) => {
                    warn!(session_id = %session.session_id(), error = %e, "Poll carried an unreadable response");
                }
            }
        }

        let Some(id) = request.id else {
            return;
        };
        let queued = session.drain_outbox(self.inner.config.long_poll_wait).await;
        let messages: Vec<Value> = queued
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect();
        if !messages.is_empty() {
            debug!(session_id = %session.session_id(), count = messages.len(), "Poll delivering queued messages");
        }

        let response = JsonRpcResponse::success(id, Value::Array(messages))
            .with_session_id(Some(session.session_id().to_string()));
        if !send_to(&ctx.reply, &response).await {
            // The poll exchange died; keep the messages for the next one
            for text in queued {
                let _ = session.deliver(text).await;
            }
        }
    }

    async fn handle_ping(&self, session: Arc<ServerSession>, request: JsonRpcRequest, ctx: &InboundContext) {
        let params: PingParams = request.params_as().unwrap_or_default();
        if let Some(transport_id) = ctx.transport_id.as_deref() {
            self.inner
                .watchdog
                .ping_received(transport_id, params.interval.map(Duration::from_millis));
        }

        if let Some(id) = request.id {
            let response = JsonRpcResponse::success(id, json!({ "value": PONG }))
                .with_session_id(Some(session.session_id().to_string()));
            send_to(&ctx.reply, &response).await;
        }
    }

    async fn handle_keep_alive(
        &self,
        session: Arc<ServerSession>,
        request: JsonRpcRequest,
        ctx: &InboundContext,
    ) {
        let object = request.get_param("object").cloned();
        let result = AssertUnwindSafe(self.inner.handler.keep_alive(Arc::clone(&session), object))
            .catch_unwind()
            .await;

        let Some(id) = request.id else {
            return;
        };
        let response = match result {
            Ok(Ok(())) => JsonRpcResponse::null(id),
            Ok(Err(e)) => JsonRpcResponse::error(Some(id), JsonRpcErrorObject::handler_error(e, None)),
            Err(panic) => JsonRpcResponse::error(
                Some(id),
                JsonRpcErrorObject::handler_error(panic_message(&*panic), None),
            ),
        };
        send_to(
            &ctx.reply,
            &response.with_session_id(Some(session.session_id().to_string())),
        )
        .await;
    }

    // ------------------------------------------------------------------
    // Handler dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&self, session: Arc<ServerSession>, request: JsonRpcRequest, ctx: &InboundContext) {
        let transaction = Transaction::new(&request, Arc::clone(&session), Arc::clone(&ctx.reply));
        let method = request.method.clone();

        let outcome = AssertUnwindSafe(self.inner.handler.handle_request(
            Arc::clone(&session),
            transaction.clone(),
            request,
        ))
        .catch_unwind()
        .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(session_id = %session.session_id(), method = %method, error = %e, "Handler failed");
                Some(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(session_id = %session.session_id(), method = %method, panic = %message, "Handler panicked");
                Some(message)
            }
        };

        if transaction.is_notification() || transaction.is_responded() {
            return;
        }

        let result = match failure {
            Some(message) => {
                transaction
                    .send_error_object(JsonRpcErrorObject::handler_error(message, None))
                    .await
            }
            None if transaction.is_async() => return,
            None => transaction.send_response(Value::Null).await,
        };
        if let Err(e) = result {
            debug!(session_id = %session.session_id(), error = %e, "Fallback response not sent");
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// The connection behind `transport_id` is gone. Its session, if any,
    /// gets its reconnection window.
    pub async fn close_session_if_timeout(&self, transport_id: &str, reason: &str) {
        self.inner.watchdog.stop(transport_id);

        let Some(session) = self.inner.store.get_by_transport_id(transport_id).await else {
            debug!(transport_id, reason, "Transport closed without a bound session");
            return;
        };
        session.detach_sink(transport_id);

        info!(
            session_id = %session.session_id(),
            transport_id,
            reason,
            timeout_ms = session.reconnection_timeout().as_millis() as u64,
            "Transport closed, waiting for reconnection"
        );

        let manager = self.clone();
        let reason = reason.to_string();
        session.schedule_close(move |session| async move {
            manager.finish_session(session, &reason).await;
        });
    }

    /// A connection failed. The handler hears about it and the session
    /// enters its reconnection window.
    pub async fn transport_error(&self, transport_id: &str, error: &str) {
        if let Some(session) = self.inner.store.get_by_transport_id(transport_id).await {
            self.inner
                .handler
                .handle_transport_error(Arc::clone(&session), error)
                .await;
        }
        self.close_session_if_timeout(transport_id, error).await;
    }

    /// Close a session right away, skipping the reconnection window
    pub async fn destroy_session(&self, session: Arc<ServerSession>, reason: &str) {
        if session.mark_closed() {
            self.finish_session(session, reason).await;
        }
    }

    async fn finish_session(&self, session: Arc<ServerSession>, reason: &str) {
        if let Some(transport_id) = session.transport_id() {
            self.inner.watchdog.stop(&transport_id);
        }
        self.inner.store.remove(session.session_id()).await;
        info!(session_id = %session.session_id(), reason, "Session closed");
        self.inner
            .handler
            .after_connection_closed(session, reason)
            .await;
    }

    async fn on_ping_timeout(&self, transport_id: &str) {
        if let Some(session) = self.inner.store.get_by_transport_id(transport_id).await {
            if let Some(sink) = session.sink() {
                if sink.transport_id() == Some(transport_id) {
                    sink.close("ping timeout").await;
                }
            }
        }
        self.close_session_if_timeout(transport_id, "ping timeout").await;
    }
}

impl std::fmt::Debug for ProtocolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolManager")
            .field("store", &self.inner.store.backend_name())
            .finish()
    }
}

/// Serialize and write, logging failures. Returns whether it was written.
async fn send_to(sink: &Arc<dyn MessageSink>, response: &JsonRpcResponse) -> bool {
    let text = match serde_json::to_string(response) {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            return false;
        }
    };
    match sink.send(text).await {
        Ok(()) => true,
        Err(e) => {
            debug!(transport_id = ?sink.transport_id(), error = %e, "Response not written");
            false
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResult;
    use crate::test_support::RecordingSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_json_rpc::{RequestId, error_codes};
    use tether_session_storage::{InMemorySessionStore, SessionStore};

    #[derive(Default)]
    struct TestHandler {
        established: AtomicUsize,
        closed: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JsonRpcHandler for TestHandler {
        async fn handle_request(
            &self,
            session: Arc<ServerSession>,
            transaction: Transaction,
            request: JsonRpcRequest,
        ) -> HandlerResult<()> {
            match request.method.as_str() {
                "echo" => {
                    transaction
                        .send_response(request.params.unwrap_or(Value::Null))
                        .await?;
                }
                "isNew" => {
                    transaction.send_response(json!(session.is_new())).await?;
                }
                "twice" => {
                    transaction.send_response(json!(1)).await?;
                    let _ = transaction.send_response(json!(2)).await;
                }
                "boom" => return Err("boom".into()),
                "panic" => panic!("exploded"),
                "silent" => {}
                "later" => {
                    transaction.start_async();
                    let transaction = transaction.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        let _ = transaction.send_response(json!("done")).await;
                    });
                }
                _ => {
                    transaction
                        .send_error_object(JsonRpcErrorObject::method_not_found(&request.method))
                        .await?;
                }
            }
            Ok(())
        }

        async fn after_connection_established(&self, _session: Arc<ServerSession>) {
            self.established.fetch_add(1, Ordering::SeqCst);
        }

        async fn after_connection_closed(&self, _session: Arc<ServerSession>, reason: &str) {
            self.closed.lock().push(reason.to_string());
        }
    }

    struct Fixture {
        manager: ProtocolManager,
        store: Arc<InMemorySessionStore>,
        handler: Arc<TestHandler>,
    }

    fn fixture(reconnection_ms: u64) -> Fixture {
        let store = Arc::new(InMemorySessionStore::new());
        let handler = Arc::new(TestHandler::default());
        let config = ServerConfig::default()
            .with_reconnection_timeout(Duration::from_millis(reconnection_ms))
            .with_long_poll_wait(Duration::from_millis(50));
        let manager = ProtocolManager::new(config, store.clone(), handler.clone());
        Fixture {
            manager,
            store,
            handler,
        }
    }

    fn request(id: i64, method: &str, params: Option<Value>, session_id: Option<&str>) -> String {
        let request = JsonRpcRequest::new(RequestId::Number(id), method, params)
            .with_session_id(session_id.map(str::to_string));
        serde_json::to_string(&request).unwrap()
    }

    async fn call(fixture: &Fixture, sink: &Arc<RecordingSink>, text: String) -> JsonRpcResponse {
        let before = sink.messages().len();
        let ctx = InboundContext::duplex(sink.id(), sink.clone());
        fixture.manager.process_message(&text, ctx).await;
        let messages = sink.messages();
        assert_eq!(messages.len(), before + 1, "expected exactly one response");
        serde_json::from_str(&messages[before]).unwrap()
    }

    #[tokio::test]
    async fn test_echo_carries_session_id() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");
        let params = json!({"param1": "Value1", "param2": "Value2"});

        let response = call(&fixture, &sink, request(1, "echo", Some(params.clone()), None)).await;
        assert_eq!(response.result(), Some(&params));
        let session_id = response.session_id.unwrap();
        assert!(fixture.store.get_by_session_id(&session_id).await.is_some());
        assert_eq!(fixture.handler.established.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_is_new_only_on_first_message() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let first = call(&fixture, &sink, request(1, "isNew", None, None)).await;
        assert_eq!(first.result(), Some(&json!(true)));
        let second = call(&fixture, &sink, request(2, "isNew", None, None)).await;
        assert_eq!(second.result(), Some(&json!(false)));
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(fixture.store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_contact_creates_one_session() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let mut tasks = Vec::new();
        for id in 0..16 {
            let manager = fixture.manager.clone();
            let ctx = InboundContext::duplex(sink.id(), sink.clone());
            tasks.push(tokio::spawn(async move {
                manager.process_message(&request(id, "echo", None, None), ctx).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(fixture.store.session_count().await, 1);
        assert_eq!(fixture.handler.established.load(Ordering::SeqCst), 1);
        assert_eq!(sink.messages().len(), 16);
    }

    #[tokio::test]
    async fn test_double_response_reaches_wire_once() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let response = call(&fixture, &sink, request(9, "twice", None, None)).await;
        assert_eq!(response.result(), Some(&json!(1)));
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_handler_errors() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let boom = call(&fixture, &sink, request(1, "boom", None, None)).await;
        let error = boom.error_object().unwrap();
        assert_eq!(error.code, error_codes::HANDLER_ERROR);
        assert!(error.message.contains("boom"));

        let panicked = call(&fixture, &sink, request(2, "panic", None, None)).await;
        let error = panicked.error_object().unwrap();
        assert_eq!(error.code, error_codes::HANDLER_ERROR);
        assert!(error.message.contains("exploded"));
    }

    #[tokio::test]
    async fn test_silent_handler_gets_null_response() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let response = call(&fixture, &sink, request(1, "silent", None, None)).await;
        assert_eq!(response.result(), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_async_transaction_answers_later() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");
        let ctx = InboundContext::duplex(sink.id(), sink.clone());

        fixture.manager.process_message(&request(1, "later", None, None), ctx).await;
        assert!(sink.messages().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        let response: JsonRpcResponse = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(response.result(), Some(&json!("done")));
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");
        let text = serde_json::to_string(&JsonRpcRequest::notification("silent", None)).unwrap();

        fixture
            .manager
            .process_message(&text, InboundContext::duplex(sink.id(), sink.clone()))
            .await;
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_parse_error_reply() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let response = call(&fixture, &sink, "{not json".to_string()).await;
        assert_eq!(response.error_object().unwrap().code, error_codes::PARSE_ERROR);
        assert!(response.id.is_none());
        assert_eq!(fixture.store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_reconnect_within_window() {
        let fixture = fixture(300);
        let first = RecordingSink::new("ws-1");

        let response = call(&fixture, &first, request(1, "isNew", None, None)).await;
        let session_id = response.session_id.unwrap();
        fixture.manager.close_session_if_timeout("ws-1", "connection lost").await;

        let second = RecordingSink::new("ws-2");
        let reconnect = call(&fixture, &second, request(1, methods::RECONNECT, None, Some(&session_id))).await;
        assert_eq!(reconnect.result(), Some(&json!(RECONNECTION_SUCCESSFUL)));
        assert_eq!(reconnect.session_id.as_deref(), Some(session_id.as_str()));

        // Past the first window the session is still alive
        tokio::time::sleep(Duration::from_millis(400)).await;
        let after = call(&fixture, &second, request(2, "isNew", None, Some(&session_id))).await;
        assert_eq!(after.result(), Some(&json!(false)));
        assert_eq!(after.session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(fixture.store.session_count().await, 1);
        assert!(fixture.handler.closed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_after_window() {
        let fixture = fixture(50);
        let first = RecordingSink::new("ws-1");

        let response = call(&fixture, &first, request(1, "isNew", None, None)).await;
        let session_id = response.session_id.unwrap();
        fixture.manager.close_session_if_timeout("ws-1", "connection lost").await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(fixture.store.session_count().await, 0);
        assert_eq!(fixture.handler.closed.lock().as_slice(), ["connection lost".to_string()]);

        let second = RecordingSink::new("ws-2");
        let reconnect = call(&fixture, &second, request(1, methods::RECONNECT, None, Some(&session_id))).await;
        assert_eq!(
            reconnect.error_object().unwrap().code,
            error_codes::RECONNECTION_ERROR
        );

        let fresh = call(&fixture, &second, request(2, "isNew", None, None)).await;
        assert_eq!(fresh.result(), Some(&json!(true)));
        assert_ne!(fresh.session_id.as_deref(), Some(session_id.as_str()));
    }

    #[tokio::test]
    async fn test_reconnect_requires_session_id() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let response = call(&fixture, &sink, request(1, methods::RECONNECT, None, None)).await;
        let error = response.error_object().unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        assert_eq!(error.message, "SessionId is mandatory in a reconnection request");
    }

    #[tokio::test]
    async fn test_ping_answers_pong_and_arms_watchdog() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let response = call(&fixture, &sink, request(1, methods::PING, Some(json!({"interval": 1000})), None)).await;
        assert_eq!(response.result(), Some(&json!({"value": "pong"})));
        assert!(fixture.manager.watchdog().is_watching("ws-1"));
    }

    #[tokio::test]
    async fn test_close_session() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let response = call(&fixture, &sink, request(1, "echo", None, None)).await;
        let session_id = response.session_id.unwrap();

        let closed = call(&fixture, &sink, request(2, methods::CLOSE_SESSION, None, Some(&session_id))).await;
        assert!(!closed.is_error());
        assert_eq!(fixture.store.session_count().await, 0);
        assert_eq!(fixture.handler.closed.lock().as_slice(), ["client closed".to_string()]);
    }

    #[tokio::test]
    async fn test_poll_returns_queued_push_and_resolves_responses() {
        let fixture = fixture(500);
        let reply = RecordingSink::new("http-1");
        let ctx = InboundContext::new(Some("http-1".to_string()), reply.clone());

        fixture.manager.process_message(&request(1, "echo", None, None), ctx).await;
        let first: JsonRpcResponse = serde_json::from_str(&reply.messages()[0]).unwrap();
        let session_id = first.session_id.unwrap();
        let session = fixture.store.get_by_session_id(&session_id).await.unwrap();

        // No push channel: the request waits in the outbox
        let pusher = session.clone();
        let push = tokio::spawn(async move {
            pusher
                .send_request("getStats", None, Duration::from_secs(2))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let poll_reply = RecordingSink::new("http-1");
        let ctx = InboundContext::new(Some("http-1".to_string()), poll_reply.clone());
        let poll = serde_json::to_string(
            &JsonRpcRequest::new(RequestId::from("poll-1"), methods::POLL, Some(json!({"responses": []})))
                .with_session_id(Some(session_id.clone())),
        )
        .unwrap();
        fixture.manager.process_message(&poll, ctx).await;

        let polled: JsonRpcResponse = serde_json::from_str(&poll_reply.messages()[0]).unwrap();
        let queued = polled.result().unwrap().as_array().unwrap().clone();
        assert_eq!(queued.len(), 1);
        let pushed: JsonRpcRequest = serde_json::from_value(queued[0].clone()).unwrap();
        assert_eq!(pushed.method, "getStats");

        // Next poll ships the client's answer back
        let answer = JsonRpcResponse::success(pushed.id.unwrap(), json!({"rx": 3}));
        let poll = serde_json::to_string(
            &JsonRpcRequest::new(
                RequestId::from("poll-2"),
                methods::POLL,
                Some(json!({"responses": [answer]})),
            )
            .with_session_id(Some(session_id)),
        )
        .unwrap();
        let ctx = InboundContext::new(Some("http-1".to_string()), RecordingSink::new("http-1"));
        fixture.manager.process_message(&poll, ctx).await;

        assert_eq!(push.await.unwrap().unwrap(), json!({"rx": 3}));
    }

    #[tokio::test]
    async fn test_sessions_take_push_timeout_from_config() {
        let store = Arc::new(InMemorySessionStore::new());
        let config = ServerConfig {
            push_request_timeout: Duration::from_millis(40),
            ..ServerConfig::default()
        };
        let manager = ProtocolManager::new(config, store.clone(), Arc::new(TestHandler::default()));
        let sink = RecordingSink::new("ws-1");

        let ctx = InboundContext::duplex(sink.id(), sink.clone());
        manager.process_message(&request(1, "echo", None, None), ctx).await;
        let session = store.get_by_transport_id("ws-1").await.unwrap();
        assert_eq!(session.push_request_timeout(), Duration::from_millis(40));

        // Nobody answers the push, so the configured deadline ends it
        let result = session.call("getStats", None).await;
        assert!(matches!(
            result,
            Err(tether_session_storage::SessionError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_watchdog_follows_session_to_new_transport() {
        let fixture = fixture(500);
        let first = RecordingSink::new("ws-1");

        let pong = call(&fixture, &first, request(1, methods::PING, Some(json!({"interval": 1000})), None)).await;
        let session_id = pong.session_id.unwrap();
        assert!(fixture.manager.watchdog().is_watching("ws-1"));

        let second = RecordingSink::new("ws-2");
        let moved = call(&fixture, &second, request(2, "isNew", None, Some(&session_id))).await;
        assert_eq!(moved.session_id.as_deref(), Some(session_id.as_str()));
        assert!(fixture.manager.watchdog().is_watching("ws-2"));
        assert!(!fixture.manager.watchdog().is_watching("ws-1"));
    }

    #[tokio::test]
    async fn test_session_created_after_connection_closed_still_expires() {
        let fixture = fixture(50);
        let sink = RecordingSink::new("ws-1");

        // The socket's close step ran before its first message found a session
        sink.disconnect();
        fixture.manager.close_session_if_timeout("ws-1", "connection closed").await;

        let response = call(&fixture, &sink, request(1, "echo", None, None)).await;
        let session_id = response.session_id.unwrap();
        let session = fixture.store.get_by_session_id(&session_id).await.unwrap();
        assert_eq!(session.state(), tether_session_storage::SessionState::PendingClose);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fixture.store.session_count().await, 0);
        assert_eq!(fixture.handler.closed.lock().as_slice(), ["connection closed".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_session_id_gets_fresh_session() {
        let fixture = fixture(500);
        let sink = RecordingSink::new("ws-1");

        let response = call(&fixture, &sink, request(1, "isNew", None, Some("no-such-session"))).await;
        assert_eq!(response.result(), Some(&json!(true)));
        assert_ne!(response.session_id.as_deref(), Some("no-such-session"));
    }
}
