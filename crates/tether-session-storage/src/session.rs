//! Server-side session: a stable logical identity that outlives the
//! physical connections it is bound to.
//!
//! A session is `Active` while bound to a live transport, `PendingClose`
//! while its close timer is armed, and `Closed` once the timer fired or
//! the session was closed explicitly. `Closed` is terminal.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_json_rpc::{JsonRpcRequest, JsonRpcResponse, PendingRequests, RequestId};

use crate::error::SessionError;
use crate::sink::MessageSink;

/// Default grace window before a disconnected session is discarded
pub const DEFAULT_RECONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for requests the server pushes to the client
pub const DEFAULT_PUSH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct CloseTimer {
    /// Bumped on every arm and cancel; a timer only fires if its
    /// generation is still current.
    generation: u64,
    handle: Option<AbortHandle>,
    closed: bool,
}

/// Lifecycle state derived from the close timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    PendingClose,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Active => write!(f, "Active"),
            SessionState::PendingClose => write!(f, "PendingClose"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Point-in-time view of a session for listings and diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub transport_id: Option<String>,
    pub is_new: bool,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub attributes: HashMap<String, Value>,
}

pub struct ServerSession {
    session_id: String,
    transport_id: RwLock<Option<String>>,
    is_new: AtomicBool,
    reconnection_timeout: Duration,
    push_request_timeout: Duration,
    close_timer: Mutex<CloseTimer>,
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
    pending: PendingRequests,
    next_request_id: AtomicI64,
    outbox: Mutex<VecDeque<String>>,
    outbox_ready: Notify,
    attributes: RwLock<HashMap<String, Value>>,
    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
}

impl ServerSession {
    /// Create a session with a freshly generated id
    pub fn new(reconnection_timeout: Duration) -> Self {
        Self::with_id(Uuid::now_v7().to_string(), reconnection_timeout)
    }

    pub fn with_id(session_id: String, reconnection_timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            transport_id: RwLock::new(None),
            is_new: AtomicBool::new(true),
            reconnection_timeout,
            push_request_timeout: DEFAULT_PUSH_REQUEST_TIMEOUT,
            close_timer: Mutex::new(CloseTimer::default()),
            sink: RwLock::new(None),
            pending: PendingRequests::new(),
            next_request_id: AtomicI64::new(1),
            outbox: Mutex::new(VecDeque::new()),
            outbox_ready: Notify::new(),
            attributes: RwLock::new(HashMap::new()),
            created_at: now,
            last_activity: RwLock::new(now),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transport_id(&self) -> Option<String> {
        self.transport_id.read().clone()
    }

    /// Only the store moves the binding, so both of its indexes stay in step
    pub(crate) fn set_transport_id(&self, transport_id: Option<String>) {
        *self.transport_id.write() = transport_id;
    }

    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::SeqCst)
    }

    pub fn set_new(&self, is_new: bool) {
        self.is_new.store(is_new, Ordering::SeqCst);
    }

    pub fn reconnection_timeout(&self) -> Duration {
        self.reconnection_timeout
    }

    pub fn with_push_request_timeout(mut self, timeout: Duration) -> Self {
        self.push_request_timeout = timeout;
        self
    }

    pub fn push_request_timeout(&self) -> Duration {
        self.push_request_timeout
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    // ------------------------------------------------------------------
    // Physical binding
    // ------------------------------------------------------------------

    /// Bind the outbound channel of the current connection and flush any
    /// messages queued while the session had none.
    pub async fn attach_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.sink.write() = Some(Arc::clone(&sink));

        let queued: Vec<String> = self.outbox.lock().drain(..).collect();
        if queued.is_empty() {
            return;
        }
        debug!(
            session_id = %self.session_id,
            count = queued.len(),
            "Flushing queued messages to new connection"
        );
        for (index, message) in queued.iter().enumerate() {
            if let Err(e) = sink.send(message.clone()).await {
                warn!(session_id = %self.session_id, error = %e, "Flush to new connection failed");
                let mut outbox = self.outbox.lock();
                for message in queued[index..].iter().rev() {
                    outbox.push_front(message.clone());
                }
                break;
            }
        }
    }

    /// Drop the outbound channel if it still belongs to `transport_id`
    pub fn detach_sink(&self, transport_id: &str) -> bool {
        let mut sink = self.sink.write();
        let owned = sink
            .as_ref()
            .is_some_and(|s| s.transport_id() == Some(transport_id));
        if owned {
            *sink = None;
        }
        owned
    }

    pub fn sink(&self) -> Option<Arc<dyn MessageSink>> {
        self.sink.read().clone()
    }

    // ------------------------------------------------------------------
    // Outbound delivery
    // ------------------------------------------------------------------

    /// Write a message to the client. Without a live channel the message is
    /// queued until the next poll or reconnection picks it up.
    pub async fn deliver(&self, message: String) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.session_id.clone()));
        }

        if let Some(sink) = self.sink() {
            match sink.send(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Channel write failed, queueing message");
                    if let Some(transport_id) = sink.transport_id() {
                        self.detach_sink(transport_id);
                    }
                }
            }
        }

        self.outbox.lock().push_back(message);
        self.outbox_ready.notify_one();
        Ok(())
    }

    /// Take every queued message, waiting up to `wait` for one to arrive
    pub async fn drain_outbox(&self, wait: Duration) -> Vec<String> {
        if self.outbox.lock().is_empty() {
            let _ = tokio::time::timeout(wait, self.outbox_ready.notified()).await;
        }
        self.outbox.lock().drain(..).collect()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().len()
    }

    // ------------------------------------------------------------------
    // Server push
    // ------------------------------------------------------------------

    /// Issue a request to the client under the session's push timeout
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, SessionError> {
        self.send_request(method, params, self.push_request_timeout)
            .await
    }

    /// Issue a request to the client and wait for its response
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        let id = RequestId::Number(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let rx = self.pending.prepare(id.clone())?;

        let request = JsonRpcRequest::new(id.clone(), method, params);
        let delivered = match serde_json::to_string(&request) {
            Ok(text) => self.deliver(text).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = delivered {
            self.pending.remove(&id);
            return Err(e);
        }

        debug!(session_id = %self.session_id, request_id = %id, method, "Request pushed to client");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => response.into_result().map_err(SessionError::Remote),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(SessionError::Closed(self.session_id.clone())),
            Err(_) => {
                self.pending.remove(&id);
                Err(SessionError::Timeout(id))
            }
        }
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), SessionError> {
        let notification = JsonRpcRequest::notification(method, params);
        self.deliver(serde_json::to_string(&notification)?).await
    }

    /// Route a client response to the push request waiting for it
    pub fn handle_response(&self, response: JsonRpcResponse) -> bool {
        self.pending.resolve(response)
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    // ------------------------------------------------------------------
    // Close timer
    // ------------------------------------------------------------------

    /// Arm the close timer. An armed timer is cancelled first, so at most
    /// one timer can ever fire for this session.
    pub fn schedule_close<F, Fut>(self: &Arc<Self>, on_expiry: F)
    where
        F: FnOnce(Arc<ServerSession>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timer = self.close_timer.lock();
        if timer.closed {
            return;
        }
        if let Some(previous) = timer.handle.take() {
            previous.abort();
        }
        timer.generation += 1;
        let generation = timer.generation;

        let session = Arc::clone(self);
        let delay = self.reconnection_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if session.expire(generation) {
                info!(session_id = %session.session_id, "Reconnection window elapsed, closing session");
                on_expiry(session).await;
            }
        });
        timer.handle = Some(task.abort_handle());

        debug!(
            session_id = %self.session_id,
            timeout_ms = delay.as_millis() as u64,
            "Close timer armed"
        );
    }

    fn expire(&self, generation: u64) -> bool {
        let mut timer = self.close_timer.lock();
        if timer.closed || timer.generation != generation {
            return false;
        }
        timer.handle = None;
        timer.closed = true;
        drop(timer);
        self.pending.cancel_all("session closed");
        true
    }

    /// Disarm the close timer. Returns `false` if the session already closed.
    pub fn revive(&self) -> bool {
        let mut timer = self.close_timer.lock();
        if timer.closed {
            return false;
        }
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
            debug!(session_id = %self.session_id, "Close timer cancelled");
        }
        true
    }

    /// Close immediately. Returns `true` only for the call that closed it.
    pub fn mark_closed(&self) -> bool {
        let mut timer = self.close_timer.lock();
        if timer.closed {
            return false;
        }
        timer.closed = true;
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        drop(timer);
        self.pending.cancel_all("session closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.close_timer.lock().closed
    }

    pub fn state(&self) -> SessionState {
        let timer = self.close_timer.lock();
        if timer.closed {
            SessionState::Closed
        } else if timer.handle.is_some() {
            SessionState::PendingClose
        } else {
            SessionState::Active
        }
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    pub fn get_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.write().insert(key.into(), value)
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.write().remove(key)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            transport_id: self.transport_id(),
            is_new: self.is_new(),
            state: self.state(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            attributes: self.attributes.read().clone(),
        }
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("session_id", &self.session_id)
            .field("transport_id", &self.transport_id())
            .field("is_new", &self.is_new())
            .field("state", &self.state())
            .finish()
    }
}
