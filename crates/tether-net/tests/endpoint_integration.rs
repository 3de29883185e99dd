//! Integration tests for endpoints, the multiplexer and postponed sessions.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_net::{Endpoint, EndpointConfig, NetError, SecureTransport, SelectConfig, SelectIo, SessionTable};

fn pair() -> (Arc<Endpoint>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (Endpoint::new(server, EndpointConfig::default()), client)
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn test_force_close_wakes_blocked_reader() {
    let (endpoint, _client) = pair();
    let reader = Arc::clone(&endpoint);
    let handle = std::thread::spawn(move || {
        let mut buf = [0u8; 16];
        reader.read_with_timeout(&mut buf, None)
    });
    std::thread::sleep(Duration::from_millis(50));

    endpoint.force_close();

    let result = handle.join().unwrap();
    assert!(matches!(result, Err(NetError::ConnectionBroken)));
}

/// Passes bytes through untouched, holding the transport for the whole read
/// like a real record layer would.
struct PassThrough;

impl SecureTransport for PassThrough {
    fn read(&mut self, socket: &TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut stream = socket;
        stream.read(buf)
    }

    fn write(&mut self, socket: &TcpStream, buf: &[u8]) -> std::io::Result<usize> {
        let mut stream = socket;
        stream.write(buf)
    }
}

fn close_from_another_thread(endpoint: Arc<Endpoint>) {
    let reader = Arc::clone(&endpoint);
    let handle = std::thread::spawn(move || {
        let mut buf = [0u8; 16];
        reader.read_with_timeout(&mut buf, None)
    });
    std::thread::sleep(Duration::from_millis(50));

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let closer = Arc::clone(&endpoint);
    std::thread::spawn(move || {
        closer.close();
        let _ = done_tx.send(());
    });

    assert!(
        done_rx.recv_timeout(Duration::from_secs(3)).is_ok(),
        "close() blocked behind a pending read"
    );
    assert!(matches!(handle.join().unwrap(), Err(NetError::ConnectionBroken)));
    assert!(endpoint.is_closed());
}

#[test]
fn test_close_from_another_thread_during_blocked_read() {
    let (endpoint, _client) = pair();
    close_from_another_thread(endpoint);
}

#[test]
fn test_close_from_another_thread_during_blocked_secure_read() {
    let (endpoint, _client) = pair();
    endpoint.set_secure_transport(Box::new(PassThrough));
    close_from_another_thread(endpoint);
}

#[test]
fn test_force_close_wakes_multiplexed_reader() {
    let select = SelectIo::new(SelectConfig::default());
    let (endpoint, _client) = pair();
    select.add_socket_for_reading(&endpoint).unwrap();
    let reader = Arc::clone(&endpoint);
    let handle = std::thread::spawn(move || {
        let mut buf = [0u8; 16];
        reader.read_with_timeout(&mut buf, None)
    });
    std::thread::sleep(Duration::from_millis(50));

    endpoint.force_close();

    assert!(matches!(handle.join().unwrap(), Err(NetError::ConnectionBroken)));
}

#[test]
fn test_many_multiplexed_endpoints_on_few_threads() {
    let select = Arc::new(SelectIo::new(SelectConfig {
        sockets_per_thread: 8,
        max_threads: 2,
        ..SelectConfig::default()
    }));
    let pairs: Vec<_> = (0..16).map(|_| pair()).collect();
    for (endpoint, _) in &pairs {
        select.add_socket_for_reading(endpoint).unwrap();
    }
    assert_eq!(select.thread_count(), 2);

    let readers: Vec<_> = pairs
        .iter()
        .map(|(endpoint, _)| {
            let endpoint = Arc::clone(endpoint);
            std::thread::spawn(move || {
                let mut buf = [0u8; 8];
                endpoint.read_exactly(&mut buf, Some(Duration::from_secs(5))).map(|_| buf)
            })
        })
        .collect();
    for (index, (_, client)) in pairs.iter().enumerate() {
        let mut client = client;
        client.write_all(format!("msg-{index:04}").as_bytes()).unwrap();
    }

    for (index, reader) in readers.into_iter().enumerate() {
        let buf = reader.join().unwrap().unwrap();
        assert_eq!(&buf, format!("msg-{index:04}").as_bytes());
    }
}

#[test]
fn test_watch_callback_sees_arrivals_until_it_declines() {
    let select = SelectIo::new(SelectConfig::default());
    let (endpoint, mut client) = pair();
    let received = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let sink = Arc::clone(&received);
    let counter = Arc::clone(&calls);
    select
        .add_socket_for_watching(&endpoint, move |endpoint, error| {
            counter.fetch_add(1, Ordering::SeqCst);
            if error.is_some() {
                return false;
            }
            let mut buf = [0u8; 64];
            match endpoint.read_with_timeout(&mut buf, Some(Duration::ZERO)) {
                Ok(n) => {
                    sink.lock().extend_from_slice(&buf[..n]);
                    !buf[..n].contains(&b'!')
                }
                Err(NetError::ResourceTemporarilyUnavailable) => true,
                Err(_) => false,
            }
        })
        .unwrap();

    client.write_all(b"one ").unwrap();
    assert!(wait_until(Duration::from_secs(5), || received.lock().len() == 4));
    client.write_all(b"two!").unwrap();
    assert!(wait_until(Duration::from_secs(5), || received.lock().len() == 8));

    assert_eq!(received.lock().as_slice(), b"one two!");
    assert!(wait_until(Duration::from_secs(5), || !endpoint.is_multiplexed()));
    assert_eq!(select.socket_count(), 0);
    assert!(calls.load(Ordering::SeqCst) >= 2);
}

#[test]
fn test_watch_callback_learns_about_peer_close() {
    let select = SelectIo::new(SelectConfig::default());
    let (endpoint, client) = pair();
    let saw_failure = Arc::new(AtomicUsize::new(0));

    let flag = Arc::clone(&saw_failure);
    select
        .add_socket_for_watching(&endpoint, move |endpoint, error| {
            let mut buf = [0u8; 16];
            let failed = error.is_some()
                || matches!(
                    endpoint.read_with_timeout(&mut buf, Some(Duration::ZERO)),
                    Err(NetError::ConnectionBroken)
                );
            if failed {
                flag.fetch_add(1, Ordering::SeqCst);
            }
            !failed
        })
        .unwrap();

    drop(client);

    assert!(wait_until(Duration::from_secs(5), || saw_failure.load(Ordering::SeqCst) == 1));
    assert!(wait_until(Duration::from_secs(5), || select.socket_count() == 0));
}

#[test]
fn test_postponed_session_resumes_on_multiplexer() {
    let select = SelectIo::new(SelectConfig::default());
    let table = SessionTable::new();
    let (endpoint, _old_client) = pair();
    select.add_socket_for_reading(&endpoint).unwrap();
    let id = table.postpone(&endpoint).unwrap();
    assert_eq!(select.socket_count(), 0);

    let (fresh, mut client) = pair();
    let resumed = table.resume(id, &fresh).unwrap();
    select.add_socket_for_reading(&resumed).unwrap();

    client.write_all(b"back").unwrap();
    let mut buf = [0u8; 4];
    resumed.read_exactly(&mut buf, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(&buf, b"back");
    assert_eq!(resumed.session_id(), id);
}
