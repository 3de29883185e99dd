//! tether-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! The client keeps one WebSocket connection to a tether server.  When the
//! connection drops it reconnects after a pause and presents the session id
//! it was given, so the server can resume the postponed session instead of
//! starting a new one.

/// Infrastructure layer: the reconnecting WebSocket connection.
pub mod infrastructure;
