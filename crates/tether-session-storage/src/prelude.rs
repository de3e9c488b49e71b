//! Convenient re-exports for session store users

pub use crate::{
    BoxedSessionStore, InMemoryConfig, InMemorySessionStore, MessageSink, ServerSession,
    SessionError, SessionFactory, SessionInfo, SessionState, SessionStore, SessionStoreError,
    SinkError, StoreResult,
};
