//! Shared networking context handed to listeners and handlers.

use std::sync::Arc;

use crate::logger::{ConnectionLogger, TracingLogger};
use crate::select::{SelectConfig, SelectIo};
use crate::sessions::SessionTable;

/// The multiplexer, the postponed-session table and the lifecycle logger,
/// shared by every component of one server or client.
#[derive(Clone)]
pub struct NetContext {
    pub select: Arc<SelectIo>,
    pub sessions: Arc<SessionTable>,
    pub logger: Arc<dyn ConnectionLogger>,
}

impl NetContext {
    pub fn new(select: SelectConfig) -> Self {
        Self {
            select: Arc::new(SelectIo::new(select)),
            sessions: Arc::new(SessionTable::new()),
            logger: Arc::new(TracingLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn ConnectionLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Stops the multiplexer threads.
    pub fn shutdown(&self) {
        self.select.shutdown();
    }
}

impl Default for NetContext {
    fn default() -> Self {
        Self::new(SelectConfig::default())
    }
}
