//! Client side of the opening handshake.

use std::sync::Arc;
use std::time::Duration;

use tether_core::{HandshakeError, HandshakeRequest, HandshakeResponse, HeaderMap, WsUrl};
use tracing::debug;

use crate::endpoint::{Endpoint, EndpointConfig};
use crate::error::NetError;
use crate::secure::{Role, SecureUpgrade};
use crate::websocket::session::{SessionConfig, WebSocketSession};
use crate::websocket::upgrade::read_header_block;

/// Opens client WebSocket sessions.
#[derive(Clone)]
pub struct WebSocketConnector {
    session: SessionConfig,
    endpoint: EndpointConfig,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    secure: Option<Arc<dyn SecureUpgrade>>,
}

impl WebSocketConnector {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session,
            endpoint: EndpointConfig::default(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            secure: None,
        }
    }

    pub fn with_endpoint_config(mut self, config: EndpointConfig) -> Self {
        self.endpoint = config;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Secure transport used for `wss://` URLs.
    pub fn with_secure_upgrade(mut self, upgrade: Arc<dyn SecureUpgrade>) -> Self {
        self.secure = Some(upgrade);
        self
    }

    /// Connects, performs the opening handshake and returns an open session
    /// with the server's response (whose headers the caller may inspect).
    pub fn connect(&self, url: &WsUrl, extra_headers: &HeaderMap) -> Result<(WebSocketSession, HandshakeResponse), NetError> {
        let endpoint = Endpoint::connect(url.authority(), self.connect_timeout, self.endpoint)?;
        if url.secure {
            let upgrade = self
                .secure
                .as_ref()
                .ok_or_else(|| NetError::InvalidParameter("wss:// needs a secure transport".into()))?;
            endpoint.upgrade_secure(upgrade.as_ref(), Role::Client)?;
        }

        let mut request = HandshakeRequest::new(&url.authority(), &url.path);
        for (name, value) in extra_headers.iter() {
            request.headers.insert(name, value);
        }
        let key = request
            .key()
            .map(str::to_owned)
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;

        let timeout = Some(self.handshake_timeout);
        endpoint.write_exactly(&request.to_bytes(), timeout)?;
        let response = read_header_block(&endpoint, timeout, HandshakeResponse::parse)?;
        if let Err(e) = response.validate(&key) {
            debug!("handshake with {} rejected: {e}", url.authority());
            endpoint.force_close();
            return Err(e.into());
        }

        let session = WebSocketSession::new(endpoint, Role::Client, self.session.clone());
        session.mark_open()?;
        Ok((session, response))
    }
}
