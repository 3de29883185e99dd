//! Shared fixtures for the server integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tether_core::WsUrl;
use tether_net::{EndpointConfig, NetContext, SessionConfig};
use tether_server::application::echo::{EchoConfig, WebSocketEchoFactory};
use tether_server::infrastructure::network::listener::{ConnectionListener, ListenerConfig};
use tether_server::infrastructure::network::server::Server;
use tether_server::infrastructure::network::worker_pool::WorkerPoolConfig;

pub const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// An echo server on an ephemeral loopback port, stopped on drop.
pub struct EchoServer {
    pub server: Server,
    pub context: NetContext,
    pub port: u16,
}

impl EchoServer {
    pub fn start(echo: EchoConfig, endpoint: EndpointConfig) -> Self {
        let context = NetContext::default();
        let factory = Arc::new(WebSocketEchoFactory::new(vec![0], context.clone(), echo));
        let listener = ConnectionListener::new(listener_config(endpoint), context.clone()).with_factory(factory);
        let mut server = Server::new();
        server.add_listener(listener);
        server.start_listening().unwrap();
        let port = server.get_ports()[0];
        Self { server, context, port }
    }

    pub fn url(&self) -> WsUrl {
        WsUrl::parse(&format!("ws://127.0.0.1:{}/echo", self.port)).unwrap()
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.server.stop_listening();
        self.context.shutdown();
    }
}

pub fn listener_config(endpoint: EndpointConfig) -> ListenerConfig {
    ListenerConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        accept_poll_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        endpoint,
        pool: WorkerPoolConfig {
            initial_size: 2,
            max_size: 16,
            idle_page_size: 2,
            queue_capacity: 16,
        },
        ..ListenerConfig::default()
    }
}

/// Echo settings with a 65000-byte frame limit and short close waits.
pub fn echo_config() -> EchoConfig {
    EchoConfig {
        session: SessionConfig {
            max_frame_size: 65_000,
            ..SessionConfig::default()
        },
        read_slice: Duration::from_millis(100),
        close_timeout: Duration::from_millis(300),
        ..EchoConfig::default()
    }
}

pub fn client_config() -> SessionConfig {
    SessionConfig {
        max_frame_size: 65_000,
        ..SessionConfig::default()
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}
