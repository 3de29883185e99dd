//! WebSocket opening handshake (RFC 6455 §4).
//!
//! The handshake is a single HTTP/1.1 exchange:
//!
//! ```text
//! client → GET /path HTTP/1.1
//!          Host: example.com:8080
//!          Upgrade: websocket
//!          Connection: Upgrade
//!          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//!          Sec-WebSocket-Version: 13
//!
//! server → HTTP/1.1 101 Switching Protocols
//!          Upgrade: websocket
//!          Connection: Upgrade
//!          Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! Only the subset of HTTP needed for this exchange is handled here: a start
//! line plus `Name: value` headers, terminated by an empty line.  Bodies,
//! chunked encoding and header folding are not supported.

use std::fmt::Write as _;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this implementation speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Upper bound on the size of a request or response header block.
pub const MAX_HEADER_BLOCK: usize = 16 * 1024;

/// Request header naming a postponed session to resume; the `101` response
/// carries the session id actually in use.
pub const SESSION_HEADER: &str = "X-Tether-Session";

/// Response header telling whether the requested session was resumed.
pub const RESUMED_HEADER: &str = "X-Tether-Resumed";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake header block exceeds {MAX_HEADER_BLOCK} bytes")]
    HeaderTooLarge,

    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("missing or invalid {0} header")]
    MissingHeader(&'static str),

    #[error("unsupported WebSocket version {0:?}")]
    UnsupportedVersion(String),

    #[error("server answered with HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("Sec-WebSocket-Accept does not match the request key")]
    AcceptKeyMismatch,

    #[error("invalid WebSocket URL: {0}")]
    InvalidUrl(String),
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Generates a random `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_websocket_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Computes `Sec-WebSocket-Accept` for a client key:
/// `base64(SHA-1(key + GUID))`.
///
/// # Examples
///
/// ```rust
/// use tether_core::compute_acceptance_key;
///
/// assert_eq!(
///     compute_acceptance_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_acceptance_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

// ── Headers ───────────────────────────────────────────────────────────────────

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header, replacing any existing header with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the comma-separated header `name` contains `token`
    /// (case-insensitive), e.g. `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name).is_some_and(|value| {
            value
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write_to(&self, out: &mut String) {
        for (name, value) in &self.entries {
            // Writing into a String cannot fail.
            let _ = write!(out, "{name}: {value}\r\n");
        }
    }
}

/// Returns the length of the header block (including the terminating blank
/// line) if `buf` contains a complete one.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Splits a complete header block into its start line and headers.
fn parse_header_block(buf: &[u8]) -> Result<Option<(String, HeaderMap, usize)>, HandshakeError> {
    let end = match find_header_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEADER_BLOCK => return Err(HandshakeError::HeaderTooLarge),
        None => return Ok(None),
    };
    if end > MAX_HEADER_BLOCK {
        return Err(HandshakeError::HeaderTooLarge);
    }

    let text = std::str::from_utf8(&buf[..end - 4])
        .map_err(|_| HandshakeError::Malformed("header block is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines.next().unwrap_or_default().to_string();

    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::Malformed(format!("header line without colon: {line:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HandshakeError::Malformed("empty header name".into()));
        }
        headers.entries.push((name.to_string(), value.trim().to_string()));
    }
    Ok(Some((start_line, headers, end)))
}

// ── Request ───────────────────────────────────────────────────────────────────

/// Client opening request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
}

impl HandshakeRequest {
    /// Builds a request for `path` on `host` with a freshly generated key.
    pub fn new(host: &str, path: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Host", host);
        headers.insert("Upgrade", "websocket");
        headers.insert("Connection", "Upgrade");
        headers.insert("Sec-WebSocket-Key", generate_websocket_key());
        headers.insert("Sec-WebSocket-Version", WEBSOCKET_VERSION);
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            headers,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.headers.get("Sec-WebSocket-Key")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.path);
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Parses a request from the start of `buf`.
    ///
    /// Returns `Ok(None)` while the header block is incomplete, otherwise the
    /// request and the number of bytes it occupied.  Bytes after that belong
    /// to the WebSocket stream.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HandshakeError> {
        let Some((start_line, headers, consumed)) = parse_header_block(buf)? else {
            return Ok(None);
        };
        let mut parts = start_line.split_whitespace();
        let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(HandshakeError::Malformed(format!("bad request line: {start_line:?}")));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(HandshakeError::Malformed(format!("unsupported HTTP version {version}")));
        }
        let request = Self {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        };
        Ok(Some((request, consumed)))
    }

    /// Checks that this is a well-formed WebSocket upgrade and returns its key.
    pub fn validate(&self) -> Result<&str, HandshakeError> {
        if self.method != "GET" {
            return Err(HandshakeError::Malformed(format!(
                "upgrade must use GET, got {}",
                self.method
            )));
        }
        if !self.headers.has_token("Upgrade", "websocket") {
            return Err(HandshakeError::MissingHeader("Upgrade"));
        }
        if !self.headers.has_token("Connection", "upgrade") {
            return Err(HandshakeError::MissingHeader("Connection"));
        }
        match self.headers.get("Sec-WebSocket-Version") {
            Some(WEBSOCKET_VERSION) => {}
            Some(other) => return Err(HandshakeError::UnsupportedVersion(other.to_string())),
            None => return Err(HandshakeError::MissingHeader("Sec-WebSocket-Version")),
        }
        let key = self
            .key()
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
        match STANDARD.decode(key) {
            Ok(nonce) if nonce.len() == 16 => Ok(key),
            _ => Err(HandshakeError::MissingHeader("Sec-WebSocket-Key")),
        }
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// Server answer to an opening request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl HandshakeResponse {
    /// `101 Switching Protocols` for a validated request key.
    pub fn accept(key: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Upgrade", "websocket");
        headers.insert("Connection", "Upgrade");
        headers.insert("Sec-WebSocket-Accept", compute_acceptance_key(key));
        Self {
            status: 101,
            reason: "Switching Protocols".to_string(),
            headers,
        }
    }

    /// An error response that closes the connection.
    pub fn reject(status: u16, reason: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", "close");
        headers.insert("Sec-WebSocket-Version", WEBSOCKET_VERSION);
        headers.insert("Content-Length", "0");
        Self {
            status,
            reason: reason.to_string(),
            headers,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Parses a response; same contract as [`HandshakeRequest::parse`].
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HandshakeError> {
        let Some((start_line, headers, consumed)) = parse_header_block(buf)? else {
            return Ok(None);
        };
        let mut parts = start_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(HandshakeError::Malformed(format!("bad status line: {start_line:?}")));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| HandshakeError::Malformed(format!("bad status line: {start_line:?}")))?;
        let reason = parts.next().unwrap_or_default().to_string();
        Ok(Some((
            Self {
                status,
                reason,
                headers,
            },
            consumed,
        )))
    }

    /// Verifies that the server accepted the upgrade for `key`.
    pub fn validate(&self, key: &str) -> Result<(), HandshakeError> {
        if self.status != 101 {
            return Err(HandshakeError::UnexpectedStatus(self.status));
        }
        if !self.headers.has_token("Upgrade", "websocket") {
            return Err(HandshakeError::MissingHeader("Upgrade"));
        }
        if !self.headers.has_token("Connection", "upgrade") {
            return Err(HandshakeError::MissingHeader("Connection"));
        }
        match self.headers.get("Sec-WebSocket-Accept") {
            Some(accept) if accept == compute_acceptance_key(key) => Ok(()),
            Some(_) => Err(HandshakeError::AcceptKeyMismatch),
            None => Err(HandshakeError::MissingHeader("Sec-WebSocket-Accept")),
        }
    }
}

// ── URLs ──────────────────────────────────────────────────────────────────────

/// A parsed `ws://` or `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl WsUrl {
    pub fn parse(url: &str) -> Result<Self, HandshakeError> {
        let invalid = || HandshakeError::InvalidUrl(url.to_string());
        let (secure, rest) = if let Some(rest) = url.strip_prefix("ws://") {
            (false, rest)
        } else if let Some(rest) = url.strip_prefix("wss://") {
            (true, rest)
        } else {
            return Err(invalid());
        };

        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };
        let default_port = if secure { 443 } else { 80 };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // IPv6 literal: [::1]:8080
            let close = bracketed.find(']').ok_or_else(invalid)?;
            let host = &bracketed[..close];
            let port = match &bracketed[close + 1..] {
                "" => default_port,
                tail => tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(invalid)?,
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
                None => (authority, default_port),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// `host:port` suitable for socket address resolution and the Host header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for WsUrl {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
