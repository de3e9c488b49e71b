//! # Session Store
//!
//! Server-side session identity and the concurrent registry that maps
//! inbound messages to sessions.
//!
//! A [`ServerSession`] has a stable id chosen by the server and a
//! revocable binding to the physical connection (transport id) it is
//! currently reachable on. When that connection drops the session enters
//! a grace window; a reconnect inside the window rebinds it, otherwise
//! the close timer discards it.

// Core trait and types
mod error;
mod session;
mod sink;
mod traits;

pub use error::{SessionError, SessionStoreError, SinkError};
pub use session::{
    DEFAULT_PUSH_REQUEST_TIMEOUT, DEFAULT_RECONNECTION_TIMEOUT, ServerSession, SessionInfo,
    SessionState,
};
pub use sink::MessageSink;
/// Core session store traits and types for pluggable backend implementations
pub use traits::*;

// Implementations
pub mod in_memory;
pub mod prelude;

// Re-export for convenience
/// In-memory session store implementation
pub use in_memory::{InMemoryConfig, InMemorySessionStore};

/// Convenience type alias for session store results
pub type StoreResult<T> = std::result::Result<T, SessionStoreError>;
