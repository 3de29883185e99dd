//! Connection listener: binds the ports of its handler factories, accepts
//! connections on a dedicated thread and hands each one to its worker pool.
//!
//! ```text
//!   accept thread                          worker pool
//!   ─────────────                          ───────────
//!   poll(listeners, accept_poll_interval)
//!     accept ─▶ Endpoint ─▶ factory(port) ─▶ handler ─▶ add_connection_handler
//!   sweep expired sessions
//!   idle notice (throttled)
//! ```
//!
//! Listening sockets are kept as std listeners for accepting and registered
//! with a `mio::Poll` through a cloned handle, so accepted streams are plain
//! blocking `std::net::TcpStream`s.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use tether_net::{CancelToken, Endpoint, EndpointConfig, NetContext, Role};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::worker_pool::{PoolError, WorkerPool, WorkerPoolConfig};
use crate::application::handler::HandlerFactory;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_address: IpAddr,
    /// Longest the accept thread sleeps before re-checking cancellation.
    pub accept_poll_interval: Duration,
    /// Minimum spacing of "idle" notices.
    pub idle_log_interval: Duration,
    /// Time running handlers get to finish when the listener stops.
    pub shutdown_timeout: Duration,
    pub endpoint: EndpointConfig,
    pub pool: WorkerPoolConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            accept_poll_interval: Duration::from_millis(200),
            idle_log_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            endpoint: EndpointConfig::default(),
            pool: WorkerPoolConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listener is already running")]
    AlreadyRunning,

    #[error("no ports to listen on")]
    NoPorts,

    #[error("failed to set up readiness polling: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to spawn accept thread: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

struct Bound {
    listener: TcpListener,
    watched: mio::net::TcpListener,
    port: u16,
}

struct Running {
    cancel: CancelToken,
    ports: Vec<u16>,
    pool: Arc<WorkerPool>,
    join: JoinHandle<()>,
}

pub struct ConnectionListener {
    config: ListenerConfig,
    context: NetContext,
    factories: Vec<Arc<dyn HandlerFactory>>,
    running: Mutex<Option<Running>>,
}

impl ConnectionListener {
    pub fn new(config: ListenerConfig, context: NetContext) -> Self {
        Self {
            config,
            context,
            factories: Vec::new(),
            running: Mutex::new(None),
        }
    }

    /// Adds a factory; takes effect on the next [`ConnectionListener::start_listening`].
    pub fn add_factory(&mut self, factory: Arc<dyn HandlerFactory>) {
        self.factories.push(factory);
    }

    pub fn with_factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.add_factory(factory);
        self
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Binds every factory port, starts a worker pool and the accept thread.
    ///
    /// # Errors
    ///
    /// [`ListenerError::BindFailed`] if any port cannot be bound; ports bound
    /// before the failure are released again.
    pub fn start_listening(&self) -> Result<(), ListenerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ListenerError::AlreadyRunning);
        }

        let mut sockets = Vec::new();
        let mut routes: HashMap<u16, Arc<dyn HandlerFactory>> = HashMap::new();
        for factory in &self.factories {
            for port in factory.ports() {
                let bound = self.bind(port)?;
                routes.insert(bound.port, Arc::clone(factory));
                sockets.push(bound);
            }
        }
        if sockets.is_empty() {
            return Err(ListenerError::NoPorts);
        }

        let poll = Poll::new().map_err(ListenerError::Poll)?;
        for (index, bound) in sockets.iter_mut().enumerate() {
            poll.registry()
                .register(&mut bound.watched, Token(index), Interest::READABLE)
                .map_err(ListenerError::Poll)?;
        }

        let pool = Arc::new(WorkerPool::new(
            self.config.pool.clone(),
            Arc::clone(&self.context.logger),
        )?);
        let cancel = CancelToken::new();
        let ports: Vec<u16> = sockets.iter().map(|bound| bound.port).collect();

        let accept = AcceptLoop {
            poll,
            sockets,
            routes,
            pool: Arc::clone(&pool),
            cancel: cancel.clone(),
            context: self.context.clone(),
            config: self.config.clone(),
        };
        let join = thread::Builder::new()
            .name("tether-accept".into())
            .spawn(move || accept.run())
            .map_err(ListenerError::Spawn)?;

        info!("listening on {} port(s) {ports:?}", self.config.bind_address);
        *running = Some(Running {
            cancel,
            ports,
            pool,
            join,
        });
        Ok(())
    }

    /// Stops accepting, shuts the pool down and closes the listening sockets.
    /// Does nothing when not listening.
    ///
    /// The pool goes first: an accept thread waiting for queue space is only
    /// released once the pool refuses new handlers.
    pub fn stop_listening(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        running.pool.shutdown(self.config.shutdown_timeout);
        if running.join.join().is_err() {
            error!("accept thread panicked");
        }
        info!("stopped listening on port(s) {:?}", running.ports);
    }

    /// Bound ports while listening, empty otherwise.
    pub fn get_ports(&self) -> Vec<u16> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.ports.clone())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// The pool serving this listener's connections, while listening.
    pub fn pool(&self) -> Option<Arc<WorkerPool>> {
        self.running.lock().as_ref().map(|running| Arc::clone(&running.pool))
    }

    fn bind(&self, port: u16) -> Result<Bound, ListenerError> {
        let addr = SocketAddr::new(self.config.bind_address, port);
        let bind_failed = |source| ListenerError::BindFailed { addr, source };
        let listener = TcpListener::bind(addr).map_err(bind_failed)?;
        listener.set_nonblocking(true).map_err(bind_failed)?;
        let port = listener.local_addr().map_err(bind_failed)?.port();
        let watched = mio::net::TcpListener::from_std(listener.try_clone().map_err(bind_failed)?);
        debug!("bound {addr} as port {port}");
        Ok(Bound {
            listener,
            watched,
            port,
        })
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

/// What the accept loop does after a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptStep {
    /// Nothing left to accept until the next readiness event.
    Drained,
    /// Only the failing connection is lost; others may still be queued.
    Retry,
    Stop,
}

impl AcceptStep {
    fn after(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::WouldBlock => Self::Drained,
            io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                Self::Retry
            }
            _ => Self::Stop,
        }
    }
}

struct AcceptLoop {
    poll: Poll,
    sockets: Vec<Bound>,
    routes: HashMap<u16, Arc<dyn HandlerFactory>>,
    pool: Arc<WorkerPool>,
    cancel: CancelToken,
    context: NetContext,
    config: ListenerConfig,
}

impl AcceptLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        let mut last_notice = Instant::now();
        let mut accepted = 0u64;

        while !self.cancel.is_cancelled() {
            if let Err(e) = self.poll.poll(&mut events, Some(self.config.accept_poll_interval)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("accept poll failed, listener stops accepting: {e}");
                break;
            }
            let ready: Vec<usize> = events.iter().map(|event| event.token().0).collect();
            for index in ready {
                accepted += self.accept_all(index);
            }

            let swept = self.context.sessions.sweep_expired();
            if swept > 0 {
                debug!("swept {swept} expired session(s)");
            }

            if last_notice.elapsed() >= self.config.idle_log_interval {
                if accepted == 0 && self.pool.busy_count() == 0 {
                    self.context.logger.log(
                        "listener",
                        &format!(
                            "idle: no connections in the last {:?}, {} session(s) postponed",
                            self.config.idle_log_interval,
                            self.context.sessions.len()
                        ),
                        last_notice.elapsed(),
                    );
                }
                last_notice = Instant::now();
                accepted = 0;
            }
        }
        debug!("accept thread exiting");
    }

    /// Accepts until the listener would block.  Returns the number accepted.
    fn accept_all(&self, index: usize) -> u64 {
        let Some(bound) = self.sockets.get(index) else {
            return 0;
        };
        let mut accepted = 0;
        loop {
            match bound.listener.accept() {
                Ok((stream, peer)) => {
                    accepted += 1;
                    self.dispatch(stream, peer);
                }
                Err(e) => match AcceptStep::after(e.kind()) {
                    AcceptStep::Drained => break,
                    AcceptStep::Retry => {
                        debug!("accept on port {} dropped a connection: {e}", bound.port);
                    }
                    AcceptStep::Stop => {
                        warn!("accept on port {} failed: {e}", bound.port);
                        break;
                    }
                },
            }
        }
        accepted
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let started = Instant::now();
        let logger = &self.context.logger;
        if let Err(e) = stream.set_nonblocking(false) {
            logger.log("listener", &format!("dropping {peer}: {e}"), started.elapsed());
            return;
        }
        let endpoint = Endpoint::new(stream, self.config.endpoint);
        let Some(port) = endpoint.local_addr().map(|addr| addr.port()) else {
            logger.log("listener", &format!("dropping {peer}: no local address"), started.elapsed());
            endpoint.force_close();
            return;
        };
        let Some(factory) = self.routes.get(&port) else {
            logger.log(
                "listener",
                &format!("no handler factory for port {port}, dropping {peer}"),
                started.elapsed(),
            );
            endpoint.force_close();
            return;
        };

        if factory.is_secure_port(port) {
            let upgraded = match factory.secure_upgrade() {
                Some(upgrade) => endpoint
                    .upgrade_secure(upgrade.as_ref(), Role::Server)
                    .map_err(|e| e.to_string()),
                None => Err("no secure transport configured".to_string()),
            };
            if let Err(reason) = upgraded {
                logger.log(
                    "listener",
                    &format!("secure upgrade for {peer} on port {port} failed: {reason}"),
                    started.elapsed(),
                );
                endpoint.force_close();
                return;
            }
        }

        let handler = match factory.create_handler(Arc::clone(&endpoint)) {
            Ok(handler) => handler,
            Err(e) => {
                logger.log(
                    "listener",
                    &format!("handler creation for {peer} on port {port} failed: {e}"),
                    started.elapsed(),
                );
                endpoint.force_close();
                return;
            }
        };
        match self.pool.add_connection_handler(handler) {
            Ok(()) => logger.log(
                "listener",
                &format!("accepted {peer} on port {port} as endpoint {}", endpoint.id()),
                started.elapsed(),
            ),
            Err(e) => logger.log(
                "listener",
                &format!("could not schedule {peer}: {e}"),
                started.elapsed(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::handler::{
        ConnectionHandler, HandlerCore, HandlerError, HandlerType, MockHandlerFactory,
    };
    use std::io::Read;
    use tether_net::TracingLogger;

    struct ClosingHandler(HandlerCore);

    impl ConnectionHandler for ClosingHandler {
        fn handler_type(&self) -> HandlerType {
            HandlerType("closing")
        }

        fn core(&self) -> &HandlerCore {
            &self.0
        }

        fn handle(&mut self) -> Result<(), HandlerError> {
            self.0.endpoint().write_exactly(b"bye", Some(Duration::from_secs(1)))?;
            self.0.endpoint().close();
            Ok(())
        }
    }

    fn loopback_config() -> ListenerConfig {
        ListenerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_poll_interval: Duration::from_millis(50),
            pool: WorkerPoolConfig {
                initial_size: 1,
                max_size: 4,
                idle_page_size: 1,
                queue_capacity: 8,
            },
            ..ListenerConfig::default()
        }
    }

    fn context() -> NetContext {
        NetContext::default().with_logger(Arc::new(TracingLogger))
    }

    fn read_to_end(port: u16) -> Vec<u8> {
        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut received = Vec::new();
        let _ = client.read_to_end(&mut received);
        received
    }

    #[test]
    fn test_factory_handler_serves_accepted_connection() {
        // Arrange
        let mut factory = MockHandlerFactory::new();
        factory.expect_ports().return_const(vec![0u16]);
        factory.expect_is_secure_port().return_const(false);
        factory
            .expect_create_handler()
            .times(1)
            .returning(|endpoint| Ok(Box::new(ClosingHandler(HandlerCore::new(endpoint)))));
        let listener = ConnectionListener::new(loopback_config(), context()).with_factory(Arc::new(factory));

        // Act
        listener.start_listening().unwrap();
        let ports = listener.get_ports();
        let received = read_to_end(ports[0]);

        // Assert
        assert_eq!(ports.len(), 1);
        assert_ne!(ports[0], 0);
        assert_eq!(received, b"bye");
        listener.stop_listening();
    }

    #[test]
    fn test_failed_handler_creation_closes_connection_and_keeps_listening() {
        // Arrange
        let mut factory = MockHandlerFactory::new();
        factory.expect_ports().return_const(vec![0u16]);
        factory.expect_is_secure_port().return_const(false);
        let mut calls = 0;
        factory.expect_create_handler().times(2).returning(move |endpoint| {
            calls += 1;
            if calls == 1 {
                Err(HandlerError::Failed("refused".into()))
            } else {
                Ok(Box::new(ClosingHandler(HandlerCore::new(endpoint))))
            }
        });
        let listener = ConnectionListener::new(loopback_config(), context()).with_factory(Arc::new(factory));
        listener.start_listening().unwrap();
        let port = listener.get_ports()[0];

        // Act
        let refused = read_to_end(port);
        let served = read_to_end(port);

        // Assert
        assert!(refused.is_empty());
        assert_eq!(served, b"bye");
        assert!(listener.is_running());
        listener.stop_listening();
    }

    #[test]
    fn test_secure_port_without_upgrade_is_refused() {
        let mut factory = MockHandlerFactory::new();
        factory.expect_ports().return_const(vec![0u16]);
        factory.expect_is_secure_port().return_const(true);
        factory.expect_secure_upgrade().returning(|| None);
        factory.expect_create_handler().never();
        let listener = ConnectionListener::new(loopback_config(), context()).with_factory(Arc::new(factory));
        listener.start_listening().unwrap();

        let received = read_to_end(listener.get_ports()[0]);

        assert!(received.is_empty());
        listener.stop_listening();
    }

    #[test]
    fn test_bind_failure_releases_earlier_ports() {
        // Arrange
        let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = occupied.local_addr().unwrap().port();
        let free = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let free_port = free.local_addr().unwrap().port();
        drop(free);
        let mut factory = MockHandlerFactory::new();
        factory.expect_ports().return_const(vec![free_port, taken]);
        let listener = ConnectionListener::new(loopback_config(), context()).with_factory(Arc::new(factory));

        // Act
        let result = listener.start_listening();

        // Assert
        assert!(matches!(result, Err(ListenerError::BindFailed { .. })));
        assert!(!listener.is_running());
        assert!(TcpListener::bind((Ipv4Addr::LOCALHOST, free_port)).is_ok());
    }

    #[test]
    fn test_accept_keeps_draining_past_a_dropped_connection() {
        assert_eq!(AcceptStep::after(io::ErrorKind::WouldBlock), AcceptStep::Drained);
        assert_eq!(AcceptStep::after(io::ErrorKind::ConnectionAborted), AcceptStep::Retry);
        assert_eq!(AcceptStep::after(io::ErrorKind::ConnectionReset), AcceptStep::Retry);
        assert_eq!(AcceptStep::after(io::ErrorKind::Interrupted), AcceptStep::Retry);
        assert_eq!(AcceptStep::after(io::ErrorKind::PermissionDenied), AcceptStep::Stop);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut factory = MockHandlerFactory::new();
        factory.expect_ports().return_const(vec![0u16]);
        let listener = ConnectionListener::new(loopback_config(), context()).with_factory(Arc::new(factory));

        listener.start_listening().unwrap();

        assert!(matches!(listener.start_listening(), Err(ListenerError::AlreadyRunning)));
        listener.stop_listening();
        assert!(listener.get_ports().is_empty());
    }

    #[test]
    fn test_no_factories_means_no_ports() {
        let listener = ConnectionListener::new(loopback_config(), context());

        assert!(matches!(listener.start_listening(), Err(ListenerError::NoPorts)));
    }
}
