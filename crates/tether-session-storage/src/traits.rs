//! Session Store Trait
//!
//! The store is the registry every transport task consults to map an
//! inbound message to its session. It keeps two indexes, by session id
//! and by transport id, and every mutation updates both together.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::SessionStoreError;
use crate::session::{ServerSession, SessionInfo};

/// Builds the session inserted by [`SessionStore::get_or_create`]
pub type SessionFactory<'a> = &'a (dyn Fn() -> ServerSession + Send + Sync);

/// Core trait for session store backends
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Error type for store operations
    type Error: std::error::Error + Send + Sync + 'static;

    /// Get the backend name for logging and debugging
    fn backend_name(&self) -> &'static str;

    /// Return the session for `session_id`, else the one bound to
    /// `transport_id`, else insert a new one from `factory` bound to
    /// `transport_id`. The flag is `true` only when a session was created.
    ///
    /// Atomic: concurrent first messages on one transport yield one session.
    async fn get_or_create(
        &self,
        session_id: Option<&str>,
        transport_id: Option<&str>,
        factory: SessionFactory<'_>,
    ) -> Result<(Arc<ServerSession>, bool), Self::Error>;

    async fn get_by_session_id(&self, session_id: &str) -> Option<Arc<ServerSession>>;

    async fn get_by_transport_id(&self, transport_id: &str) -> Option<Arc<ServerSession>>;

    /// Move the session's physical binding. The transport id is
    /// single-owner: any other session bound to it loses the binding.
    /// `None` unbinds the session.
    async fn rebind(
        &self,
        session: &ServerSession,
        transport_id: Option<&str>,
    ) -> Result<(), Self::Error>;

    /// Remove the session and its transport binding
    async fn remove(&self, session_id: &str) -> Option<Arc<ServerSession>>;

    async fn session_count(&self) -> usize;

    async fn list_sessions(&self) -> Vec<SessionInfo>;
}

/// Type alias for a boxed session store
pub type BoxedSessionStore = dyn SessionStore<Error = SessionStoreError>;
