//! Server side of the opening handshake over a blocking [`Endpoint`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_core::{HandshakeError, HandshakeRequest, HandshakeResponse, HeaderMap};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::NetError;
use crate::secure::Role;
use crate::websocket::session::{SessionConfig, WebSocketSession};

const READ_CHUNK: usize = 1024;

/// Reads one HTTP header block and parses it with `parse`.  Bytes past the
/// block are pushed back into the endpoint for the frame reader.
pub(crate) fn read_header_block<T>(
    endpoint: &Endpoint,
    timeout: Option<Duration>,
    parse: impl Fn(&[u8]) -> Result<Option<(T, usize)>, HandshakeError>,
) -> Result<T, NetError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some((parsed, consumed)) = parse(&buf)? {
            endpoint.unread(&buf[consumed..]);
            return Ok(parsed);
        }
        let remaining = match deadline {
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(NetError::ReadTimedOut);
                }
                Some(left)
            }
            None => None,
        };
        let n = endpoint.read_with_timeout(&mut chunk, remaining)?;
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Reads the client's opening request.
pub fn read_handshake_request(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<HandshakeRequest, NetError> {
    read_header_block(endpoint, timeout, HandshakeRequest::parse)
}

/// Validates `request` and answers `101 Switching Protocols`, adding
/// `extra_headers` to the response.  An invalid request is answered with
/// `400 Bad Request` and the error returned.
pub fn complete_handshake(
    endpoint: &Endpoint,
    request: &HandshakeRequest,
    extra_headers: &HeaderMap,
    timeout: Option<Duration>,
) -> Result<(), NetError> {
    let key = match request.validate() {
        Ok(key) => key,
        Err(e) => {
            debug!("endpoint {}: rejecting upgrade: {e}", endpoint.id());
            reject_handshake(endpoint, 400, "Bad Request", timeout)?;
            return Err(e.into());
        }
    };
    let mut response = HandshakeResponse::accept(key);
    for (name, value) in extra_headers.iter() {
        response.headers.insert(name, value);
    }
    endpoint.write_exactly(&response.to_bytes(), timeout)
}

/// Sends an HTTP error response.  The caller closes the endpoint.
pub fn reject_handshake(endpoint: &Endpoint, status: u16, reason: &str, timeout: Option<Duration>) -> Result<(), NetError> {
    endpoint.write_exactly(&HandshakeResponse::reject(status, reason).to_bytes(), timeout)
}

/// Reads the request, accepts it and returns an open server session along
/// with the request (for its path and headers).
pub fn accept_websocket(
    endpoint: Arc<Endpoint>,
    config: SessionConfig,
    timeout: Option<Duration>,
) -> Result<(WebSocketSession, HandshakeRequest), NetError> {
    let request = read_handshake_request(&endpoint, timeout)?;
    complete_handshake(&endpoint, &request, &HeaderMap::new(), timeout)?;
    let session = WebSocketSession::new(endpoint, Role::Server, config);
    session.mark_open()?;
    Ok((session, request))
}
