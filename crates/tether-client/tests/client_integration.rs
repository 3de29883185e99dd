//! Client connection against a real tether echo server over loopback.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tether_client::infrastructure::network::{ClientConnection, ClientConnectionConfig, ClientError, NetworkEvent};
use tether_net::{CancelToken, Message, NetContext, SessionConfig};
use tether_server::application::echo::{EchoConfig, WebSocketEchoFactory};
use tether_server::infrastructure::network::listener::{ConnectionListener, ListenerConfig};

struct Fixture {
    listener: ConnectionListener,
    context: NetContext,
    port: u16,
}

impl Fixture {
    fn start() -> Self {
        let context = NetContext::default();
        let echo = EchoConfig {
            session: SessionConfig {
                max_frame_size: 65_000,
                ..SessionConfig::default()
            },
            read_slice: Duration::from_millis(100),
            close_timeout: Duration::from_millis(300),
            ..EchoConfig::default()
        };
        let factory = Arc::new(WebSocketEchoFactory::new(vec![0], context.clone(), echo));
        let config = ListenerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_poll_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(2),
            ..ListenerConfig::default()
        };
        let listener = ConnectionListener::new(config, context.clone()).with_factory(factory);
        listener.start_listening().unwrap();
        let port = listener.get_ports()[0];
        Self { listener, context, port }
    }

    fn client_config(&self) -> ClientConnectionConfig {
        ClientConnectionConfig {
            url: format!("ws://127.0.0.1:{}/echo", self.port),
            reconnect_interval: Duration::from_millis(300),
            reply_timeout: Duration::from_secs(5),
            ..ClientConnectionConfig::default()
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.listener.stop_listening();
        self.context.shutdown();
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_round_trip_and_ping() {
    // Arrange
    let fixture = Fixture::start();
    let connection = ClientConnection::new(fixture.client_config()).unwrap();

    // Act
    let connected = connection.connect().unwrap();
    let reply = connection.round_trip("hello").unwrap();
    let rtt = connection.ping(b"probe").unwrap();

    // Assert
    assert!(!connected.resumed);
    assert!(connected.session_id.is_some());
    assert_eq!(reply, Message::Text("hello".into()));
    assert!(rtt < Duration::from_secs(5));
    connection.disconnect();
    assert!(!connection.is_connected());
    assert_eq!(connection.session_id(), None);
}

#[test]
fn test_reconnect_resumes_the_postponed_session() {
    // Arrange
    let fixture = Fixture::start();
    let connection = ClientConnection::new(fixture.client_config()).unwrap();
    let first = connection.connect().unwrap();
    let session_id = first.session_id.unwrap();
    connection.round_trip("before").unwrap();

    // Act
    connection.abort();
    wait_until(|| fixture.context.sessions.contains(&session_id));
    let second = connection.connect().unwrap();

    // Assert
    assert!(second.resumed);
    assert_eq!(second.session_id, Some(session_id));
    assert_eq!(connection.round_trip("after").unwrap(), Message::Text("after".into()));
}

#[test]
fn test_resumption_can_be_disabled() {
    let fixture = Fixture::start();
    let config = ClientConnectionConfig {
        resume: false,
        ..fixture.client_config()
    };
    let connection = ClientConnection::new(config).unwrap();
    let first = connection.connect().unwrap().session_id.unwrap();
    connection.abort();
    wait_until(|| fixture.context.sessions.contains(&first));

    let second = connection.connect().unwrap();

    assert!(!second.resumed);
    assert_ne!(second.session_id, Some(first));
}

#[test]
fn test_send_after_abort_reports_not_connected() {
    let fixture = Fixture::start();
    let connection = ClientConnection::new(fixture.client_config()).unwrap();
    connection.connect().unwrap();

    connection.abort();

    assert!(matches!(connection.send_text("lost"), Err(ClientError::NotConnected)));
}

#[test]
fn test_background_loop_reconnects_and_delivers_messages() {
    // Arrange
    let fixture = Fixture::start();
    let connection = Arc::new(ClientConnection::new(fixture.client_config()).unwrap());
    let cancel = CancelToken::new();
    let (events, join) = Arc::clone(&connection).start(cancel.clone()).unwrap();
    let timeout = Duration::from_secs(5);

    // Act & Assert: first connection.
    let NetworkEvent::Connected { resumed, session_id } = events.recv_timeout(timeout).unwrap() else {
        panic!("expected a connected event");
    };
    assert!(!resumed);
    connection.send_text("ping me back").unwrap();
    match events.recv_timeout(timeout).unwrap() {
        NetworkEvent::MessageReceived(message) => assert_eq!(message, Message::Text("ping me back".into())),
        other => panic!("expected a message, got {other:?}"),
    }

    // Dropping the socket makes the loop reconnect and resume.
    let session_id = session_id.unwrap();
    wait_until(|| connection.is_connected());
    connection.abort();
    assert!(matches!(events.recv_timeout(timeout).unwrap(), NetworkEvent::Disconnected));
    match events.recv_timeout(timeout).unwrap() {
        NetworkEvent::Connected { resumed, session_id: again } => {
            assert!(resumed);
            assert_eq!(again, Some(session_id));
        }
        other => panic!("expected a reconnect, got {other:?}"),
    }

    cancel.cancel();
    join.join().unwrap();
}
