//! A set of listeners started and stopped together.

use tracing::warn;

use super::listener::{ConnectionListener, ListenerError};

#[derive(Default)]
pub struct Server {
    listeners: Vec<ConnectionListener>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: ConnectionListener) {
        self.listeners.push(listener);
    }

    pub fn listeners(&self) -> &[ConnectionListener] {
        &self.listeners
    }

    /// Starts every listener that is not running yet.  If one fails, the ones
    /// started by this call are stopped again and the error returned.
    pub fn start_listening(&self) -> Result<(), ListenerError> {
        let mut started: Vec<&ConnectionListener> = Vec::new();
        for listener in &self.listeners {
            if listener.is_running() {
                continue;
            }
            if let Err(e) = listener.start_listening() {
                warn!("listener failed to start, stopping {} started listener(s)", started.len());
                for listener in started {
                    listener.stop_listening();
                }
                return Err(e);
            }
            started.push(listener);
        }
        Ok(())
    }

    pub fn stop_listening(&self) {
        for listener in &self.listeners {
            listener.stop_listening();
        }
    }

    /// True while any listener is running.
    pub fn is_running(&self) -> bool {
        self.listeners.iter().any(ConnectionListener::is_running)
    }

    /// Ports of all running listeners, sorted.
    pub fn get_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.iter().flat_map(ConnectionListener::get_ports).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}
