//! WebSocket echo handler.
//!
//! Every text or binary message received is sent straight back.  The handler
//! also keeps sessions alive across reconnects:
//!
//! 1. The `101` response carries `X-Tether-Session: <uuid>` and
//!    `X-Tether-Resumed: true|false`.
//! 2. When the peer drops, or stays silent after a keep-alive ping, the
//!    endpoint is postponed in the shared [`SessionTable`].
//! 3. A client that reconnects with `X-Tether-Session: <uuid>` gets its old
//!    endpoint (and the per-session message counter stored on it) back.
//!
//! [`SessionTable`]: tether_net::SessionTable

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_core::{CloseCode, HandshakeRequest, HeaderMap};
pub use tether_core::{RESUMED_HEADER, SESSION_HEADER};
use tether_net::websocket::{complete_handshake, read_handshake_request, reject_handshake};
use tether_net::{Endpoint, Message, NetContext, NetError, Role, SecureUpgrade, SessionConfig, WebSocketSession};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handler::{ConnectionHandler, HandlerCore, HandlerError, HandlerFactory, HandlerType};

pub const ECHO_HANDLER: HandlerType = HandlerType("websocket-echo");

/// Tunables of the echo handler.
#[derive(Debug, Clone)]
pub struct EchoConfig {
    pub session: SessionConfig,
    pub handshake_timeout: Duration,
    /// Silence after which a ping is sent; a second silent period postpones
    /// the session.
    pub keepalive: Duration,
    /// Upper bound on a single receive, so cancellation is noticed promptly.
    pub read_slice: Duration,
    pub close_timeout: Duration,
    /// Route reads through the shared multiplexer instead of blocking reads.
    pub multiplexed: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(30),
            read_slice: Duration::from_millis(250),
            close_timeout: Duration::from_secs(2),
            multiplexed: false,
        }
    }
}

/// Per-session state kept on the endpoint, so it survives postpone/resume.
#[derive(Debug, Default)]
pub struct EchoStats {
    messages: AtomicU64,
}

impl EchoStats {
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    fn record(&self) -> u64 {
        self.messages.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The stats attached to `endpoint`, creating them on first use.
    pub fn of(endpoint: &Endpoint) -> Arc<EchoStats> {
        if let Some(stats) = endpoint
            .session_state()
            .and_then(|state| state.downcast::<EchoStats>().ok())
        {
            return stats;
        }
        let stats = Arc::new(EchoStats::default());
        endpoint.set_session_state(stats.clone());
        stats
    }
}

pub struct WebSocketEchoFactory {
    ports: Vec<u16>,
    context: NetContext,
    config: EchoConfig,
    secure_ports: Vec<u16>,
    secure: Option<Arc<dyn SecureUpgrade>>,
}

impl WebSocketEchoFactory {
    pub fn new(ports: Vec<u16>, context: NetContext, config: EchoConfig) -> Self {
        Self {
            ports,
            context,
            config,
            secure_ports: Vec::new(),
            secure: None,
        }
    }

    /// Serves `ports` through `upgrade` as well as the plain ports.
    pub fn with_secure_ports(mut self, ports: Vec<u16>, upgrade: Arc<dyn SecureUpgrade>) -> Self {
        self.secure_ports = ports;
        self.secure = Some(upgrade);
        self
    }
}

impl HandlerFactory for WebSocketEchoFactory {
    fn ports(&self) -> Vec<u16> {
        self.ports.iter().chain(&self.secure_ports).copied().collect()
    }

    fn create_handler(&self, endpoint: Arc<Endpoint>) -> Result<Box<dyn ConnectionHandler>, HandlerError> {
        Ok(Box::new(WebSocketEchoHandler {
            core: HandlerCore::new(endpoint),
            context: self.context.clone(),
            config: self.config.clone(),
            active: None,
        }))
    }

    fn is_secure_port(&self, port: u16) -> bool {
        self.secure_ports.contains(&port)
    }

    fn secure_upgrade(&self) -> Option<Arc<dyn SecureUpgrade>> {
        self.secure.clone()
    }
}

pub struct WebSocketEchoHandler {
    core: HandlerCore,
    context: NetContext,
    config: EchoConfig,
    /// The endpoint actually serving the peer; differs from the accepted one
    /// after a resume.
    active: Option<Arc<Endpoint>>,
}

impl ConnectionHandler for WebSocketEchoHandler {
    fn handler_type(&self) -> HandlerType {
        ECHO_HANDLER
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle(&mut self) -> Result<(), HandlerError> {
        let result = self.serve();
        if result.is_err() {
            if let Some(active) = &self.active {
                active.force_close();
            }
            self.core.endpoint().force_close();
        }
        result
    }
}

impl WebSocketEchoHandler {
    fn serve(&mut self) -> Result<(), HandlerError> {
        let accepted = Arc::clone(self.core.endpoint());
        accepted.use_endpoint()?;
        let timeout = Some(self.config.handshake_timeout);

        let request = read_handshake_request(&accepted, timeout)?;
        if let Err(e) = request.validate() {
            reject_handshake(&accepted, 400, "Bad Request", timeout)?;
            return Err(NetError::from(e).into());
        }

        let (endpoint, resumed) = self.resolve_session(accepted, &request);
        self.active = Some(Arc::clone(&endpoint));

        let mut extra = HeaderMap::new();
        extra.insert(SESSION_HEADER, endpoint.session_id().to_string());
        extra.insert(RESUMED_HEADER, resumed.to_string());
        complete_handshake(&endpoint, &request, &extra, timeout)?;

        let session = WebSocketSession::new(Arc::clone(&endpoint), Role::Server, self.config.session.clone());
        session.mark_open()?;
        if self.config.multiplexed {
            self.context.select.add_socket_for_reading(&endpoint)?;
        }
        info!(
            "endpoint {}: websocket session {} open (resumed: {resumed}, path: {})",
            endpoint.id(),
            endpoint.session_id(),
            request.path
        );

        self.echo_loop(&session)
    }

    /// Swaps the accepted socket into the postponed session the client asks
    /// for, when there is one.
    fn resolve_session(&self, accepted: Arc<Endpoint>, request: &HandshakeRequest) -> (Arc<Endpoint>, bool) {
        let Some(raw) = request.headers.get(SESSION_HEADER) else {
            return (accepted, false);
        };
        let Ok(session_id) = Uuid::parse_str(raw.trim()) else {
            debug!("endpoint {}: ignoring malformed session id {raw:?}", accepted.id());
            return (accepted, false);
        };
        match self.context.sessions.resume(session_id, &accepted) {
            Ok(endpoint) => {
                if let Err(e) = endpoint.use_endpoint() {
                    warn!("session {session_id}: resumed endpoint unusable: {e}");
                }
                (endpoint, true)
            }
            Err(e) => {
                info!("session {session_id} not resumed: {e}");
                (accepted, false)
            }
        }
    }

    fn echo_loop(&self, session: &WebSocketSession) -> Result<(), HandlerError> {
        let endpoint = session.endpoint();
        let stats = EchoStats::of(endpoint);
        let cancel = self.core.cancel_token();
        let mut ping_sent_at: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                debug!("endpoint {}: cancelled, closing session", endpoint.id());
                if let Err(e) = session.close(CloseCode::GOING_AWAY, "server shutting down", self.config.close_timeout) {
                    debug!("endpoint {}: close handshake incomplete: {e}", endpoint.id());
                }
                return Ok(());
            }

            match session.receive_message(Some(self.config.read_slice)) {
                Ok(Message::Text(text)) => {
                    ping_sent_at = None;
                    let count = stats.record();
                    debug!("endpoint {}: echoing text message #{count}", endpoint.id());
                    session.send_text(&text)?;
                }
                Ok(Message::Binary(data)) => {
                    ping_sent_at = None;
                    let count = stats.record();
                    debug!("endpoint {}: echoing binary message #{count} ({} bytes)", endpoint.id(), data.len());
                    session.send_binary(&data)?;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => ping_sent_at = None,
                Ok(Message::Close(reason)) => {
                    info!(
                        "endpoint {}: peer closed session after {} messages ({reason:?})",
                        endpoint.id(),
                        stats.messages()
                    );
                    return Ok(());
                }
                Err(e) if e.is_timeout() => {
                    if endpoint.idle_for() < self.config.keepalive {
                        continue;
                    }
                    if ping_sent_at.is_some() {
                        self.postpone(endpoint, "keep-alive ping unanswered");
                        return Ok(());
                    }
                    session.send_ping(b"keepalive")?;
                    ping_sent_at = Some(Instant::now());
                }
                Err(e) if e.is_connection_lost() && !endpoint.is_closed() => {
                    self.postpone(endpoint, "peer dropped");
                    return Ok(());
                }
                Err(NetError::ConnectionBroken) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn postpone(&self, endpoint: &Arc<Endpoint>, why: &str) {
        match self.context.sessions.postpone(endpoint) {
            Ok(session_id) => info!("endpoint {}: {why}, session {session_id} postponed", endpoint.id()),
            Err(e) => {
                debug!("endpoint {}: {why}, could not postpone: {e}", endpoint.id());
                endpoint.force_close();
            }
        }
    }
}
