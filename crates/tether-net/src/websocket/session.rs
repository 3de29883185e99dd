//! WebSocket session over an [`Endpoint`].
//!
//! # State machine
//!
//! ```text
//! Connecting ──mark_open──▶ Open ──send_close──▶ Closing ──peer Close──▶ Closed
//!                             │                                           ▲
//!                             └──────────── peer Close (mirrored) ────────┘
//! ```
//!
//! While `Open`, a received Ping is answered with a Pong carrying the same
//! payload and a received Close is mirrored back before the session closes.
//! While `Closing` only the peer's Close is awaited; Pings are not answered.
//! Any malformed frame ends the session.
//!
//! # Sending
//!
//! [`WebSocketSession::send_message`] sends a whole message, split into
//! frames no larger than `max_frame_size`.  Long messages can also be
//! streamed: [`WebSocketSession::start_message`] declares the total length and
//! sends the first chunk, [`WebSocketSession::continue_message`] sends the
//! rest; the final frame is marked once the declared length has been sent.
//!
//! # Receiving
//!
//! [`WebSocketSession::handle_frame`] consumes one frame from a byte buffer
//! and reports what it was; [`WebSocketSession::receive_message`] drives it
//! from the endpoint and reassembles fragmented messages.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_core::{
    decode_frame, encode_fragments, encode_message, generate_masking_key, CloseCode, CloseReason,
    Frame, Opcode,
};
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::NetError;
use crate::secure::Role;

const MIN_READ: usize = 512;
const MAX_READ: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest frame (header included) this side sends.
    pub max_frame_size: usize,
    /// Largest reassembled message this side accepts.
    pub max_message_size: usize,
    /// Reject RSV bits, non-minimal lengths and wrongly masked frames.
    pub strict: bool,
    pub write_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
            strict: true,
            write_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// A complete message as returned by [`WebSocketSession::receive_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// The peer closed; the session is now closed.
    Close(Option<CloseReason>),
}

/// What one handled frame turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A data frame (first fragment, continuation or whole message).
    Data {
        opcode: Opcode,
        fin: bool,
        payload: Vec<u8>,
    },
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
    /// A control frame that needs no action in the current state.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The buffer holds only part of a frame; nothing was consumed.
    NeedMoreData { needed: u64 },
    Consumed { consumed: usize, event: SessionEvent },
}

struct StreamedMessage {
    remaining: u64,
}

#[derive(Default)]
struct Incoming {
    buffer: Vec<u8>,
    fragments: Option<(Opcode, Vec<u8>)>,
}

pub struct WebSocketSession {
    endpoint: Arc<Endpoint>,
    role: Role,
    config: SessionConfig,
    state: Mutex<SessionState>,
    streamed: Mutex<Option<StreamedMessage>>,
    send_lock: Mutex<()>,
    incoming: Mutex<Incoming>,
}

impl fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("endpoint", &self.endpoint.id())
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl WebSocketSession {
    /// A session in `Connecting` state; call [`Self::mark_open`] once the
    /// opening handshake is done.
    pub fn new(endpoint: Arc<Endpoint>, role: Role, config: SessionConfig) -> Self {
        Self {
            endpoint,
            role,
            config,
            state: Mutex::new(SessionState::Connecting),
            streamed: Mutex::new(None),
            send_lock: Mutex::new(()),
            incoming: Mutex::new(Incoming::default()),
        }
    }

    pub fn mark_open(&self) -> Result<(), NetError> {
        let mut state = self.state.lock();
        if *state != SessionState::Connecting {
            return Err(NetError::InvalidState(format!("cannot open a session that is {:?}", *state)));
        }
        *state = SessionState::Open;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn masks(&self) -> bool {
        self.role == Role::Client
    }

    fn ensure_open(&self) -> Result<(), NetError> {
        match self.state() {
            SessionState::Open => Ok(()),
            other => Err(NetError::InvalidState(format!("session is {other:?}"))),
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Sends a complete text or binary message.
    pub fn send_message(&self, payload: &[u8], is_text: bool) -> Result<(), NetError> {
        self.ensure_open()?;
        let streamed = self.streamed.lock();
        if streamed.is_some() {
            return Err(NetError::InvalidState("a streamed message is in progress".into()));
        }
        let frames = encode_message(data_opcode(is_text), payload, self.config.max_frame_size, self.masks())?;
        self.write_frames(&frames)
    }

    pub fn send_text(&self, text: &str) -> Result<(), NetError> {
        self.send_message(text.as_bytes(), true)
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), NetError> {
        self.send_message(data, false)
    }

    /// Starts a message of `total_len` bytes and sends `first_chunk` of it.
    pub fn start_message(&self, total_len: u64, is_text: bool, first_chunk: &[u8]) -> Result<(), NetError> {
        self.ensure_open()?;
        let mut streamed = self.streamed.lock();
        if streamed.is_some() {
            return Err(NetError::InvalidState("a streamed message is in progress".into()));
        }
        let sent = first_chunk.len() as u64;
        if sent > total_len {
            return Err(NetError::InvalidParameter(format!(
                "first chunk of {sent} bytes exceeds the declared length {total_len}"
            )));
        }
        let remaining = total_len - sent;
        let frames = encode_fragments(
            data_opcode(is_text),
            first_chunk,
            self.config.max_frame_size,
            self.masks(),
            remaining == 0,
        )?;
        self.write_frames(&frames)?;
        if remaining > 0 {
            *streamed = Some(StreamedMessage { remaining });
        }
        Ok(())
    }

    /// Sends the next chunk of a message begun with [`Self::start_message`].
    pub fn continue_message(&self, chunk: &[u8]) -> Result<(), NetError> {
        self.ensure_open()?;
        let mut streamed = self.streamed.lock();
        let Some(message) = streamed.as_mut() else {
            return Err(NetError::InvalidState("no message has been started".into()));
        };
        let sent = chunk.len() as u64;
        if sent > message.remaining {
            return Err(NetError::InvalidParameter(format!(
                "chunk of {sent} bytes exceeds the {} bytes remaining",
                message.remaining
            )));
        }
        let remaining = message.remaining - sent;
        let frames = encode_fragments(
            Opcode::Continuation,
            chunk,
            self.config.max_frame_size,
            self.masks(),
            remaining == 0,
        )?;
        self.write_frames(&frames)?;
        if remaining == 0 {
            *streamed = None;
        } else {
            message.remaining = remaining;
        }
        Ok(())
    }

    pub fn send_ping(&self, payload: &[u8]) -> Result<(), NetError> {
        self.ensure_open()?;
        self.write_control(Opcode::Ping, payload)
    }

    pub fn send_pong(&self, payload: &[u8]) -> Result<(), NetError> {
        self.ensure_open()?;
        self.write_control(Opcode::Pong, payload)
    }

    /// Starts the closing handshake: sends Close and moves to `Closing`.
    pub fn send_close(&self, code: CloseCode, reason: &str) -> Result<(), NetError> {
        let payload = CloseReason::new(code, reason).encode()?;
        {
            let mut state = self.state.lock();
            if *state != SessionState::Open {
                return Err(NetError::InvalidState(format!("session is {:?}", *state)));
            }
            *state = SessionState::Closing;
        }
        self.write_control(Opcode::Close, &payload)
    }

    fn write_control(&self, opcode: Opcode, payload: &[u8]) -> Result<(), NetError> {
        let frame = Frame::new(opcode, payload)
            .with_masking_key(self.masks().then(generate_masking_key))
            .encode()?;
        self.write_frames(&[frame])
    }

    fn write_frames(&self, frames: &[Vec<u8>]) -> Result<(), NetError> {
        let _serial = self.send_lock.lock();
        for frame in frames {
            self.endpoint.write_exactly(frame, self.config.write_timeout)?;
        }
        Ok(())
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Consumes one frame from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Any protocol violation: the session is closed (with a best-effort
    /// Close 1002) and the error returned.
    pub fn handle_frame(&self, bytes: &[u8]) -> Result<FrameOutcome, NetError> {
        let state = self.state();
        if matches!(state, SessionState::Connecting | SessionState::Closed) {
            return Err(NetError::InvalidState(format!("cannot handle frames while {state:?}")));
        }

        let (frame, consumed) = match decode_frame(bytes, self.config.strict) {
            Ok(decoded) => decoded,
            Err(e) if e.is_incomplete() => {
                return Ok(FrameOutcome::NeedMoreData {
                    needed: e.needed().unwrap_or(1),
                })
            }
            Err(e) => return Err(self.fail(CloseCode::PROTOCOL_ERROR, e.into())),
        };

        if self.config.strict {
            let masked = frame.masking_key.is_some();
            match self.role {
                Role::Server if !masked => {
                    return Err(self.fail(CloseCode::PROTOCOL_ERROR, NetError::InvalidPayload("client frame is not masked")))
                }
                Role::Client if masked => {
                    return Err(self.fail(CloseCode::PROTOCOL_ERROR, NetError::InvalidPayload("server frame is masked")))
                }
                _ => {}
            }
        }

        let payload = frame.unmasked_payload();
        let event = match frame.opcode {
            Opcode::Ping if state == SessionState::Open => {
                self.write_control(Opcode::Pong, &payload)?;
                SessionEvent::Ping(payload)
            }
            Opcode::Ping => SessionEvent::Ignored,
            Opcode::Pong => SessionEvent::Pong(payload),
            Opcode::Close => {
                let reason = match CloseReason::parse(&payload) {
                    Ok(reason) => reason,
                    Err(e) => return Err(self.fail(CloseCode::PROTOCOL_ERROR, e.into())),
                };
                self.on_peer_close(state, &payload);
                SessionEvent::Close(reason)
            }
            opcode => SessionEvent::Data {
                opcode,
                fin: frame.fin,
                payload,
            },
        };
        Ok(FrameOutcome::Consumed { consumed, event })
    }

    fn on_peer_close(&self, state: SessionState, payload: &[u8]) {
        if state == SessionState::Open {
            if let Err(e) = self.write_control(Opcode::Close, payload) {
                debug!("endpoint {}: could not mirror close: {e}", self.endpoint.id());
            }
        }
        *self.state.lock() = SessionState::Closed;
        self.endpoint.force_close();
    }

    /// Reads from the endpoint until a complete message or control frame
    /// arrives.  Partial input is kept across calls, so a timed-out call can
    /// simply be retried.
    pub fn receive_message(&self, timeout: Option<Duration>) -> Result<Message, NetError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut incoming = self.incoming.lock();
        loop {
            if self.state() == SessionState::Closed {
                return Err(NetError::ConnectionBroken);
            }
            match self.handle_frame(&incoming.buffer)? {
                FrameOutcome::NeedMoreData { needed } => {
                    let buffered = incoming.buffer.len() as u64;
                    if buffered + needed > self.config.max_message_size as u64 + 14 {
                        return Err(self.fail(
                            CloseCode::MESSAGE_TOO_BIG,
                            NetError::MessageTooLarge {
                                limit: self.config.max_message_size,
                            },
                        ));
                    }
                    let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
                    let want = usize::try_from(needed).unwrap_or(MAX_READ).clamp(MIN_READ, MAX_READ);
                    let start = incoming.buffer.len();
                    incoming.buffer.resize(start + want, 0);
                    match self.endpoint.read_with_timeout(&mut incoming.buffer[start..], remaining) {
                        Ok(n) => incoming.buffer.truncate(start + n),
                        Err(e) => {
                            incoming.buffer.truncate(start);
                            return Err(e);
                        }
                    }
                }
                FrameOutcome::Consumed { consumed, event } => {
                    incoming.buffer.drain(..consumed);
                    if let Some(message) = self.assemble(&mut incoming, event)? {
                        return Ok(message);
                    }
                }
            }
        }
    }

    fn assemble(&self, incoming: &mut Incoming, event: SessionEvent) -> Result<Option<Message>, NetError> {
        let (opcode, fin, payload) = match event {
            SessionEvent::Data { opcode, fin, payload } => (opcode, fin, payload),
            SessionEvent::Ping(payload) => return Ok(Some(Message::Ping(payload))),
            SessionEvent::Pong(payload) => return Ok(Some(Message::Pong(payload))),
            SessionEvent::Close(reason) => return Ok(Some(Message::Close(reason))),
            SessionEvent::Ignored => return Ok(None),
        };

        let (opcode, data) = match (opcode, incoming.fragments.take()) {
            (Opcode::Continuation, Some((first, mut data))) => {
                data.extend_from_slice(&payload);
                (first, data)
            }
            (Opcode::Continuation, None) => {
                return Err(self.fail(
                    CloseCode::PROTOCOL_ERROR,
                    NetError::InvalidPayload("continuation frame without a message"),
                ))
            }
            (_, Some(_)) => {
                return Err(self.fail(
                    CloseCode::PROTOCOL_ERROR,
                    NetError::InvalidPayload("new message started inside a fragmented one"),
                ))
            }
            (opcode, None) => (opcode, payload),
        };

        if data.len() > self.config.max_message_size {
            return Err(self.fail(
                CloseCode::MESSAGE_TOO_BIG,
                NetError::MessageTooLarge {
                    limit: self.config.max_message_size,
                },
            ));
        }
        if !fin {
            incoming.fragments = Some((opcode, data));
            return Ok(None);
        }
        match opcode {
            Opcode::Text => match String::from_utf8(data) {
                Ok(text) => Ok(Some(Message::Text(text))),
                Err(_) => Err(self.fail(
                    CloseCode::INVALID_PAYLOAD,
                    NetError::InvalidPayload("text message is not UTF-8"),
                )),
            },
            _ => Ok(Some(Message::Binary(data))),
        }
    }

    // ── Closing ──────────────────────────────────────────────────────────────

    /// Runs the closing handshake: sends Close (unless one was already sent),
    /// waits up to `timeout` for the peer's Close, then closes the endpoint.
    pub fn close(&self, code: CloseCode, reason: &str, timeout: Duration) -> Result<(), NetError> {
        match self.state() {
            SessionState::Closed => return Ok(()),
            SessionState::Connecting => {
                self.force_close();
                return Ok(());
            }
            SessionState::Closing => {}
            SessionState::Open => {
                if let Err(e) = self.send_close(code, reason) {
                    self.force_close();
                    return Err(e);
                }
            }
        }

        let deadline = Instant::now() + timeout;
        while self.state() != SessionState::Closed {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                debug!("endpoint {}: peer did not answer close", self.endpoint.id());
                break;
            }
            match self.receive_message(Some(left)) {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        self.force_close();
        Ok(())
    }

    pub fn force_close(&self) {
        *self.state.lock() = SessionState::Closed;
        self.endpoint.force_close();
    }

    /// Ends the session after a protocol violation.
    fn fail(&self, code: CloseCode, error: NetError) -> NetError {
        warn!("endpoint {}: closing session: {error}", self.endpoint.id());
        if self.state() == SessionState::Open {
            if let Ok(payload) = CloseReason::new(code, "").encode() {
                if let Err(e) = self.write_control(Opcode::Close, &payload) {
                    debug!("endpoint {}: close frame not sent: {e}", self.endpoint.id());
                }
            }
        }
        self.force_close();
        error
    }
}

fn data_opcode(is_text: bool) -> Opcode {
    if is_text {
        Opcode::Text
    } else {
        Opcode::Binary
    }
}
