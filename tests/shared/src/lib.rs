//! Shared E2E Testing Utilities for tether
//!
//! Starts an in-process tether server on an ephemeral port, with a
//! broker bridge on an in-memory broker, and provides the handlers and
//! client settings the integration tests share.

pub mod fixtures;
pub mod server;

// Re-export the main types for convenience
pub use fixtures::{DoublingHandler, TestFixtures, TestHandler};
pub use server::{SERVER_QUEUE, TestServer};

/// Install a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
