//! Listener start/stop lifecycle and worker pool capacity over real sockets.

mod common;

use std::net::{Ipv4Addr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_net::{Endpoint, EndpointConfig, NetContext, NetError};
use tether_server::application::handler::{
    ConnectionHandler, HandlerCore, HandlerError, HandlerFactory, HandlerType,
};
use tether_server::infrastructure::network::listener::ConnectionListener;
use tether_server::infrastructure::network::worker_pool::WorkerPoolConfig;

use common::{listener_config, wait_until};

const HOLDING: HandlerType = HandlerType("holding");

/// Holds its connection until the peer hangs up or the handler is cancelled,
/// reporting how often it was redistributed when it starts.
struct HoldingHandler {
    core: HandlerCore,
    started: mpsc::Sender<u32>,
}

impl ConnectionHandler for HoldingHandler {
    fn handler_type(&self) -> HandlerType {
        HOLDING
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle(&mut self) -> Result<(), HandlerError> {
        let _ = self.started.send(self.redistribution_count());
        let mut buf = [0u8; 64];
        while !self.core.cancel_token().is_cancelled() {
            match self.core.endpoint().read_with_timeout(&mut buf, Some(Duration::from_millis(50))) {
                Ok(_) => {}
                Err(e) if e.is_timeout() => {}
                Err(NetError::ConnectionBroken) => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.core.endpoint().force_close();
        Ok(())
    }
}

struct HoldingFactory {
    ports: Vec<u16>,
    started: Mutex<mpsc::Sender<u32>>,
}

impl HandlerFactory for HoldingFactory {
    fn ports(&self) -> Vec<u16> {
        self.ports.clone()
    }

    fn create_handler(&self, endpoint: Arc<Endpoint>) -> Result<Box<dyn ConnectionHandler>, HandlerError> {
        Ok(Box::new(HoldingHandler {
            core: HandlerCore::new(endpoint),
            started: self.started.lock().clone(),
        }))
    }
}

fn holding_listener(ports: Vec<u16>, pool: WorkerPoolConfig) -> (ConnectionListener, mpsc::Receiver<u32>) {
    let (tx, rx) = mpsc::channel();
    let factory = Arc::new(HoldingFactory {
        ports,
        started: Mutex::new(tx),
    });
    let mut config = listener_config(EndpointConfig::default());
    config.pool = pool;
    (ConnectionListener::new(config, NetContext::default()).with_factory(factory), rx)
}

fn connect(port: u16) -> TcpStream {
    TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap()
}

#[test]
fn test_ports_are_reported_only_while_listening() {
    // Arrange
    let (listener, _rx) = holding_listener(vec![0, 0], WorkerPoolConfig::default());
    assert!(listener.get_ports().is_empty());
    assert!(!listener.is_running());

    // Act
    listener.start_listening().unwrap();
    let ports = listener.get_ports();

    // Assert
    assert_eq!(ports.len(), 2);
    assert!(ports.iter().all(|port| *port != 0));
    assert!(listener.is_running());

    listener.stop_listening();
    assert!(listener.get_ports().is_empty());
    assert!(!listener.is_running());
    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, ports[0])).is_err());
}

#[test]
fn test_listener_can_be_restarted() {
    let (listener, rx) = holding_listener(vec![0], WorkerPoolConfig::default());
    listener.start_listening().unwrap();
    listener.stop_listening();

    listener.start_listening().unwrap();
    let _client = connect(listener.get_ports()[0]);

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    listener.stop_listening();
}

#[test]
fn test_pool_runs_n_without_queueing_and_queues_the_next() {
    // Arrange
    let capacity = 3;
    let pool = WorkerPoolConfig {
        initial_size: 0,
        max_size: capacity,
        idle_page_size: 0,
        queue_capacity: 4,
    };
    let (listener, rx) = holding_listener(vec![0], pool);
    listener.start_listening().unwrap();
    let port = listener.get_ports()[0];
    let pool = listener.pool().unwrap();

    // Act: N connections all run at once.
    let mut clients: Vec<TcpStream> = (0..capacity).map(|_| connect(port)).collect();
    for _ in 0..capacity {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    }

    // Assert
    assert_eq!(pool.busy_count(), capacity);
    assert_eq!(pool.queued_count(), 0);

    // Act: connection N+1 waits for a worker.
    clients.push(connect(port));
    wait_until(|| pool.queued_count() == 1);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    // Hanging up one client frees its worker for the queued handler.
    drop(clients.remove(0));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    wait_until(|| pool.queued_count() == 0);
    assert_eq!(pool.busy_count(), capacity);

    listener.stop_listening();
}

#[test]
fn test_stop_cancels_running_handlers() {
    let (listener, rx) = holding_listener(vec![0], WorkerPoolConfig::default());
    listener.start_listening().unwrap();
    let _client = connect(listener.get_ports()[0]);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let pool = listener.pool().unwrap();

    listener.stop_listening();

    assert_eq!(pool.busy_count(), 0);
    assert!(pool.is_shut_down());
}

#[test]
fn test_stop_returns_while_the_pool_is_saturated() {
    // Arrange: one worker, one queue slot, and a third connection that leaves
    // the accept thread waiting for queue space.
    let pool = WorkerPoolConfig {
        initial_size: 0,
        max_size: 1,
        idle_page_size: 0,
        queue_capacity: 1,
    };
    let (listener, rx) = holding_listener(vec![0], pool);
    listener.start_listening().unwrap();
    let port = listener.get_ports()[0];
    let pool = listener.pool().unwrap();
    let _clients: Vec<TcpStream> = (0..3).map(|_| connect(port)).collect();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    wait_until(|| pool.queued_count() == 1);
    std::thread::sleep(Duration::from_millis(200));

    // Act
    let listener = Arc::new(listener);
    let stopping = Arc::clone(&listener);
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        stopping.stop_listening();
        let _ = done_tx.send(());
    });

    // Assert
    assert!(
        done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "stop_listening blocked on a saturated pool"
    );
    assert!(!listener.is_running());
    assert!(pool.is_shut_down());
    assert_eq!(pool.busy_count(), 0);
}
