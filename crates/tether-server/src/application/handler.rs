//! Connection handler abstractions.
//!
//! A [`HandlerFactory`] owns one or more listening ports.  For every accepted
//! connection the listener asks it for a [`ConnectionHandler`], which the
//! worker pool then runs to completion on one of its threads.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tether_net::{CancelToken, Endpoint, NetError, SecureUpgrade};
use thiserror::Error;

/// Short tag naming a kind of handler, used to target
/// [`crate::infrastructure::network::worker_pool::WorkerPool::stop_connection_handlers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerType(pub &'static str);

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Scheduling preference of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerCapability {
    /// Occupies one worker for its whole lifetime.
    Exclusive,
    /// Could share workers with other handlers.  Currently scheduled like
    /// `Exclusive`; the pool only counts these.
    Shareable,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error("handler cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// State every handler carries: its endpoint, its cancellation token and how
/// many times it was picked up from the pool queue.
#[derive(Debug)]
pub struct HandlerCore {
    endpoint: Arc<Endpoint>,
    cancel: CancelToken,
    redistributions: AtomicU32,
}

impl HandlerCore {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            cancel: CancelToken::new(),
            redistributions: AtomicU32::new(0),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn mark_redistributed(&self) {
        self.redistributions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn redistribution_count(&self) -> u32 {
        self.redistributions.load(Ordering::Relaxed)
    }
}

/// Per-connection protocol logic.
pub trait ConnectionHandler: Send {
    fn handler_type(&self) -> HandlerType;

    fn capability(&self) -> HandlerCapability {
        HandlerCapability::Exclusive
    }

    fn core(&self) -> &HandlerCore;

    /// Runs the connection to completion.  Should return promptly once
    /// [`ConnectionHandler::cancel_token`] is cancelled.
    fn handle(&mut self) -> Result<(), HandlerError>;

    fn endpoint(&self) -> &Arc<Endpoint> {
        self.core().endpoint()
    }

    fn cancel_token(&self) -> &CancelToken {
        self.core().cancel_token()
    }

    /// Called when the handler was queued and is now handed to a worker.
    fn on_redistributed(&self) {
        self.core().mark_redistributed();
    }

    fn redistribution_count(&self) -> u32 {
        self.core().redistribution_count()
    }
}

/// Creates handlers for the ports it owns.
#[cfg_attr(test, mockall::automock)]
pub trait HandlerFactory: Send + Sync {
    /// Ports to listen on; `0` asks for an ephemeral port.
    fn ports(&self) -> Vec<u16>;

    fn create_handler(&self, endpoint: Arc<Endpoint>) -> Result<Box<dyn ConnectionHandler>, HandlerError>;

    /// Whether connections on `port` must be wrapped by
    /// [`HandlerFactory::secure_upgrade`] before the handler sees them.
    fn is_secure_port(&self, _port: u16) -> bool {
        false
    }

    fn secure_upgrade(&self) -> Option<Arc<dyn SecureUpgrade>> {
        None
    }
}
