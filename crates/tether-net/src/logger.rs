//! Connection lifecycle logging collaborator.
//!
//! Listener, pool and handlers report lifecycle events (accepted, rejected,
//! handler failed, idle) through [`ConnectionLogger`] rather than calling
//! `tracing` directly, so that tests can assert on them with a mock and
//! embedders can route them elsewhere.  Logging never fails the caller.

use std::time::Duration;

use tracing::info;

/// Receives lifecycle events.  `elapsed` is the time the reported step took
/// (or zero when not meaningful).
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionLogger: Send + Sync {
    fn log(&self, component: &str, message: &str, elapsed: Duration);
}

/// Forwards lifecycle events to `tracing` at INFO level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl ConnectionLogger for TracingLogger {
    fn log(&self, component: &str, message: &str, elapsed: Duration) {
        info!(
            component,
            elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
            "{message}"
        );
    }
}
