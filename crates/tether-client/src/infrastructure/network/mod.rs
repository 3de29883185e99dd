//! Network infrastructure for the client application.
//!
//! Architecture:
//! - [`ClientConnection`] owns at most one open [`WebSocketSession`] at a time.
//! - Request/response helpers ([`ClientConnection::round_trip`],
//!   [`ClientConnection::ping`]) serve the command-line client.
//! - [`ClientConnection::start`] runs a reconnect loop on its own thread and
//!   delivers [`NetworkEvent`]s over a channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tether_core::{CloseCode, HandshakeError, HeaderMap, WsUrl, RESUMED_HEADER, SESSION_HEADER};
use tether_net::{CancelToken, Message, NetError, SessionConfig, WebSocketConnector, WebSocketSession};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server URL: {0}")]
    InvalidUrl(#[from] HandshakeError),

    #[error("failed to connect to {url}: {source}")]
    ConnectFailed {
        url: String,
        #[source]
        source: NetError,
    },

    #[error("not connected")]
    NotConnected,

    /// The server ended the session with a Close frame.
    #[error("session closed by server")]
    Closed,

    #[error("no reply within {0:?}")]
    NoReply(Duration),

    #[error(transparent)]
    Net(#[from] NetError),
}

impl ClientError {
    /// Whether reconnecting might help.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::NotConnected | Self::Closed | Self::ConnectFailed { .. } => true,
            Self::Net(e) => e.is_connection_lost(),
            Self::InvalidUrl(_) | Self::NoReply(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConnectionConfig {
    /// `ws://host:port/path` of the server.
    pub url: String,
    /// Pause between reconnect attempts.
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Default wait for replies in [`ClientConnection::round_trip`] and
    /// [`ClientConnection::ping`].
    pub reply_timeout: Duration,
    /// Largest frame this client sends.
    pub max_frame_size: usize,
    /// Ask the server to resume the previous session on reconnect.
    pub resume: bool,
}

impl Default for ClientConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/".to_string(),
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(10),
            max_frame_size: 64 * 1024,
            resume: true,
        }
    }
}

/// Events emitted by the reconnect loop.
#[derive(Debug)]
pub enum NetworkEvent {
    Connected { session_id: Option<Uuid>, resumed: bool },
    MessageReceived(Message),
    Disconnected,
}

/// Outcome of a successful [`ClientConnection::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    pub session_id: Option<Uuid>,
    pub resumed: bool,
}

const RECEIVE_SLICE: Duration = Duration::from_millis(250);

pub struct ClientConnection {
    config: ClientConnectionConfig,
    url: WsUrl,
    connector: WebSocketConnector,
    session: Mutex<Option<Arc<WebSocketSession>>>,
    session_id: Mutex<Option<Uuid>>,
}

impl ClientConnection {
    /// Creates a (not yet connected) connection.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidUrl`] when `config.url` is not a `ws://` or
    /// `wss://` URL.
    pub fn new(config: ClientConnectionConfig) -> Result<Self, ClientError> {
        let url = WsUrl::parse(&config.url)?;
        let connector = WebSocketConnector::new(SessionConfig {
            max_frame_size: config.max_frame_size,
            ..SessionConfig::default()
        })
        .with_connect_timeout(config.connect_timeout)
        .with_handshake_timeout(config.handshake_timeout);
        Ok(Self {
            config,
            url,
            connector,
            session: Mutex::new(None),
            session_id: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConnectionConfig {
        &self.config
    }

    /// The session id the server assigned last.
    pub fn session_id(&self) -> Option<Uuid> {
        *self.session_id.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Opens a new WebSocket session, replacing any current one.  Presents
    /// the previous session id when resumption is enabled.
    pub fn connect(&self) -> Result<Connected, ClientError> {
        if let Some(old) = self.session.lock().take() {
            old.force_close();
        }

        let mut headers = HeaderMap::new();
        if self.config.resume {
            if let Some(id) = self.session_id() {
                headers.insert(SESSION_HEADER, id.to_string());
            }
        }
        let (session, response) =
            self.connector
                .connect(&self.url, &headers)
                .map_err(|source| ClientError::ConnectFailed {
                    url: self.config.url.clone(),
                    source,
                })?;

        let session_id = response
            .headers
            .get(SESSION_HEADER)
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok());
        let resumed = response
            .headers
            .get(RESUMED_HEADER)
            .is_some_and(|raw| raw.eq_ignore_ascii_case("true"));
        if session_id.is_some() {
            *self.session_id.lock() = session_id;
        }
        *self.session.lock() = Some(Arc::new(session));

        info!(
            "connected to {} (session: {}, resumed: {resumed})",
            self.config.url,
            session_id.map_or_else(|| "none".to_string(), |id| id.to_string())
        );
        Ok(Connected { session_id, resumed })
    }

    /// Keeps calling [`ClientConnection::connect`] every `reconnect_interval`
    /// until it succeeds, `attempts` are used up or `cancel` fires.
    pub fn connect_with_retry(&self, attempts: Option<u32>, cancel: &CancelToken) -> Result<Connected, ClientError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.connect() {
                Ok(connected) => return Ok(connected),
                Err(e) if attempts.is_some_and(|max| attempt >= max) => return Err(e),
                Err(e) => {
                    warn!("connect attempt {attempt} failed: {e}; retrying in {:?}", self.config.reconnect_interval);
                    if cancel.wait_timeout(self.config.reconnect_interval) {
                        return Err(e);
                    }
                }
            }
        }
    }

    pub fn send_text(&self, text: &str) -> Result<(), ClientError> {
        self.with_session(|session| session.send_text(text))
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), ClientError> {
        self.with_session(|session| session.send_binary(data))
    }

    pub fn send_ping(&self, payload: &[u8]) -> Result<(), ClientError> {
        self.with_session(|session| session.send_ping(payload))
    }

    /// Waits for the next message.  A lost connection clears the session so
    /// the next [`ClientConnection::connect`] can resume it.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Message, ClientError> {
        let session = self.current()?;
        match session.receive_message(timeout) {
            Ok(Message::Close(reason)) => {
                debug!("server closed the session: {reason:?}");
                self.forget(&session);
                Err(ClientError::Closed)
            }
            Ok(message) => Ok(message),
            Err(e) if e.is_timeout() => Err(e.into()),
            Err(e) => {
                self.forget(&session);
                Err(e.into())
            }
        }
    }

    /// Sends `text` and waits for the next text or binary message.
    pub fn round_trip(&self, text: &str) -> Result<Message, ClientError> {
        self.send_text(text)?;
        let deadline = Instant::now() + self.config.reply_timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ClientError::NoReply(self.config.reply_timeout));
            }
            match self.receive(Some(left)) {
                Ok(message @ (Message::Text(_) | Message::Binary(_))) => return Ok(message),
                Ok(_) => continue,
                Err(ClientError::Net(e)) if e.is_timeout() => {
                    return Err(ClientError::NoReply(self.config.reply_timeout))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends a ping and returns the time until the matching pong.
    pub fn ping(&self, payload: &[u8]) -> Result<Duration, ClientError> {
        let sent = Instant::now();
        self.send_ping(payload)?;
        let deadline = sent + self.config.reply_timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ClientError::NoReply(self.config.reply_timeout));
            }
            match self.receive(Some(left)) {
                Ok(Message::Pong(echoed)) if echoed == payload => return Ok(sent.elapsed()),
                Ok(_) => continue,
                Err(ClientError::Net(e)) if e.is_timeout() => {
                    return Err(ClientError::NoReply(self.config.reply_timeout))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs the closing handshake and forgets the session id.
    pub fn disconnect(&self) {
        if let Some(session) = self.session.lock().take() {
            if let Err(e) = session.close(CloseCode::NORMAL, "client done", self.config.reply_timeout) {
                debug!("close handshake incomplete: {e}");
            }
        }
        self.session_id.lock().take();
    }

    /// Drops the socket without a closing handshake, as a network failure
    /// would.  The session id is kept for resumption.
    pub fn abort(&self) {
        if let Some(session) = self.session.lock().take() {
            session.force_close();
        }
    }

    /// Runs a reconnect loop on a background thread until `cancel` fires.
    /// Incoming messages and connection changes arrive on the returned
    /// channel.
    pub fn start(self: Arc<Self>, cancel: CancelToken) -> std::io::Result<(Receiver<NetworkEvent>, JoinHandle<()>)> {
        let (tx, rx) = channel::unbounded();
        let join = thread::Builder::new()
            .name("tether-client".into())
            .spawn(move || self.run(&cancel, &tx))?;
        Ok((rx, join))
    }

    fn run(&self, cancel: &CancelToken, tx: &Sender<NetworkEvent>) {
        while !cancel.is_cancelled() {
            match self.connect() {
                Ok(Connected { session_id, resumed }) => {
                    if tx.send(NetworkEvent::Connected { session_id, resumed }).is_err() {
                        break;
                    }
                    self.pump(cancel, tx);
                    if cancel.is_cancelled() {
                        self.disconnect();
                        break;
                    }
                    let _ = tx.send(NetworkEvent::Disconnected);
                    info!("disconnected; reconnecting in {:?}", self.config.reconnect_interval);
                }
                Err(e) => warn!("{e}"),
            }
            if cancel.wait_timeout(self.config.reconnect_interval) {
                break;
            }
        }
        debug!("reconnect loop finished");
    }

    /// Forwards messages until the connection is lost or `cancel` fires.
    fn pump(&self, cancel: &CancelToken, tx: &Sender<NetworkEvent>) {
        while !cancel.is_cancelled() {
            match self.receive(Some(RECEIVE_SLICE)) {
                Ok(message) => {
                    if tx.send(NetworkEvent::MessageReceived(message)).is_err() {
                        return;
                    }
                }
                Err(ClientError::Net(e)) if e.is_timeout() => {}
                Err(e) => {
                    debug!("receive loop ended: {e}");
                    return;
                }
            }
        }
    }

    fn current(&self) -> Result<Arc<WebSocketSession>, ClientError> {
        self.session.lock().clone().ok_or(ClientError::NotConnected)
    }

    fn with_session(&self, send: impl FnOnce(&WebSocketSession) -> Result<(), NetError>) -> Result<(), ClientError> {
        let session = self.current()?;
        send(&session).map_err(|e| {
            if e.is_connection_lost() {
                self.forget(&session);
            }
            ClientError::from(e)
        })
    }

    /// Clears `session` if it is still the current one.
    fn forget(&self, session: &Arc<WebSocketSession>) {
        let mut current = self.session.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
            current.take();
        }
        drop(current);
        session.force_close();
    }
}
