//! In-Memory Session Store Implementation
//!
//! Both indexes live behind a single `RwLock`, so a get-or-create or a
//! rebind is one critical section and the indexes can never disagree.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::SessionStoreError;
use crate::session::{ServerSession, SessionInfo};
use crate::traits::{SessionFactory, SessionStore};

/// Configuration for the in-memory session store
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Maximum sessions to keep (for memory management)
    pub max_sessions: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100_000, // 100k concurrent sessions
        }
    }
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<String, Arc<ServerSession>>,
    /// transport id -> session id
    by_transport: HashMap<String, String>,
}

impl StoreState {
    fn lookup_transport(&self, transport_id: &str) -> Option<Arc<ServerSession>> {
        self.by_transport
            .get(transport_id)
            .and_then(|session_id| self.sessions.get(session_id))
            .cloned()
    }

    fn bind(&mut self, session: &ServerSession, transport_id: &str) {
        let session_id = session.session_id().to_string();

        if let Some(previous_owner) = self
            .by_transport
            .insert(transport_id.to_string(), session_id.clone())
        {
            if previous_owner != session_id {
                if let Some(previous) = self.sessions.get(&previous_owner) {
                    debug!(
                        transport_id,
                        from = %previous_owner,
                        to = %session_id,
                        "Transport binding revoked from previous session"
                    );
                    previous.set_transport_id(None);
                }
            }
        }

        self.unbind_stale(session, Some(transport_id));
        session.set_transport_id(Some(transport_id.to_string()));
    }

    /// Drop the index entry for the session's current binding unless it is `keep`
    fn unbind_stale(&mut self, session: &ServerSession, keep: Option<&str>) {
        if let Some(old) = session.transport_id() {
            if Some(old.as_str()) != keep
                && self.by_transport.get(&old).map(String::as_str) == Some(session.session_id())
            {
                self.by_transport.remove(&old);
            }
        }
    }
}

/// In-memory session store
#[derive(Clone)]
pub struct InMemorySessionStore {
    state: Arc<RwLock<StoreState>>,
    config: InMemoryConfig,
}

impl InMemorySessionStore {
    /// Create new in-memory session store with default configuration
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    /// Create new in-memory session store with custom configuration
    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            config,
        }
    }

    /// Number of transport ids currently bound to a session
    pub async fn binding_count(&self) -> usize {
        self.state.read().await.by_transport.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    type Error = SessionStoreError;

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }

    async fn get_or_create(
        &self,
        session_id: Option<&str>,
        transport_id: Option<&str>,
        factory: SessionFactory<'_>,
    ) -> Result<(Arc<ServerSession>, bool), Self::Error> {
        let mut state = self.state.write().await;

        if let Some(session) = session_id.and_then(|id| state.sessions.get(id).cloned()) {
            return Ok((session, false));
        }
        if let Some(session) = transport_id.and_then(|id| state.lookup_transport(id)) {
            return Ok((session, false));
        }

        if state.sessions.len() >= self.config.max_sessions {
            return Err(SessionStoreError::MaxSessionsReached(self.config.max_sessions));
        }

        let session = Arc::new(factory());
        if let Some(transport_id) = transport_id {
            state.bind(&session, transport_id);
        }
        state
            .sessions
            .insert(session.session_id().to_string(), Arc::clone(&session));

        info!(
            session_id = %session.session_id(),
            transport_id = ?transport_id,
            "Created session"
        );
        Ok((session, true))
    }

    async fn get_by_session_id(&self, session_id: &str) -> Option<Arc<ServerSession>> {
        self.state.read().await.sessions.get(session_id).cloned()
    }

    async fn get_by_transport_id(&self, transport_id: &str) -> Option<Arc<ServerSession>> {
        self.state.read().await.lookup_transport(transport_id)
    }

    async fn rebind(
        &self,
        session: &ServerSession,
        transport_id: Option<&str>,
    ) -> Result<(), Self::Error> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(session.session_id()) {
            return Err(SessionStoreError::SessionNotFound(
                session.session_id().to_string(),
            ));
        }

        match transport_id {
            Some(transport_id) => state.bind(session, transport_id),
            None => {
                state.unbind_stale(session, None);
                session.set_transport_id(None);
            }
        }
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Option<Arc<ServerSession>> {
        let mut state = self.state.write().await;
        let session = state.sessions.remove(session_id)?;
        state.unbind_stale(&session, None);
        debug!(session_id, "Removed session");
        Some(session)
    }

    async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.state
            .read()
            .await
            .sessions
            .values()
            .map(|s| s.info())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn factory() -> ServerSession {
        ServerSession::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = InMemorySessionStore::new();

        let (session, created) = store
            .get_or_create(None, Some("t-1"), &factory)
            .await
            .unwrap();
        assert!(created);
        assert_eq!(session.transport_id().as_deref(), Some("t-1"));

        let by_id = store.get_by_session_id(session.session_id()).await.unwrap();
        assert!(Arc::ptr_eq(&by_id, &session));
        let by_transport = store.get_by_transport_id("t-1").await.unwrap();
        assert!(Arc::ptr_eq(&by_transport, &session));

        assert!(store.remove(session.session_id()).await.is_some());
        assert!(store.get_by_session_id(session.session_id()).await.is_none());
        assert!(store.get_by_transport_id("t-1").await.is_none());
        assert_eq!(store.binding_count().await, 0);
    }

    #[tokio::test]
    async fn test_existing_transport_is_reused() {
        let store = InMemorySessionStore::new();
        let (first, _) = store.get_or_create(None, Some("t-1"), &factory).await.unwrap();
        let (second, created) = store.get_or_create(None, Some("t-1"), &factory).await.unwrap();

        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_session() {
        let store = InMemorySessionStore::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .get_or_create(None, Some("shared"), &factory)
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().1 {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_rebind_moves_both_indexes() {
        let store = InMemorySessionStore::new();
        let (session, _) = store.get_or_create(None, Some("old"), &factory).await.unwrap();

        store.rebind(&session, Some("new")).await.unwrap();
        assert_eq!(session.transport_id().as_deref(), Some("new"));
        assert!(store.get_by_transport_id("old").await.is_none());
        assert!(store.get_by_transport_id("new").await.is_some());
        assert_eq!(store.binding_count().await, 1);

        store.rebind(&session, None).await.unwrap();
        assert!(session.transport_id().is_none());
        assert_eq!(store.binding_count().await, 0);
    }

    #[tokio::test]
    async fn test_transport_binding_is_single_owner() {
        let store = InMemorySessionStore::new();
        let (a, _) = store.get_or_create(None, Some("t-a"), &factory).await.unwrap();
        let (b, _) = store.get_or_create(None, Some("t-b"), &factory).await.unwrap();

        // b takes over a's connection
        store.rebind(&b, Some("t-a")).await.unwrap();
        assert!(a.transport_id().is_none());
        let owner = store.get_by_transport_id("t-a").await.unwrap();
        assert!(Arc::ptr_eq(&owner, &b));
        assert!(store.get_by_transport_id("t-b").await.is_none());
    }

    #[tokio::test]
    async fn test_rebind_removed_session_fails() {
        let store = InMemorySessionStore::new();
        let (session, _) = store.get_or_create(None, None, &factory).await.unwrap();
        store.remove(session.session_id()).await;

        assert!(matches!(
            store.rebind(&session, Some("t")).await,
            Err(SessionStoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_max_sessions() {
        let store = InMemorySessionStore::with_config(InMemoryConfig { max_sessions: 1 });
        store.get_or_create(None, None, &factory).await.unwrap();
        assert!(matches!(
            store.get_or_create(None, None, &factory).await,
            Err(SessionStoreError::MaxSessionsReached(1))
        ));
    }
}
