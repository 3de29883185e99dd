//! Per-connection endpoint.
//!
//! An [`Endpoint`] owns one connected TCP socket (optionally wrapped by a
//! [`SecureTransport`]) and offers blocking reads and writes with optional
//! timeouts.  It is shared as `Arc<Endpoint>`: a handler thread does the I/O
//! while any other thread may close it.
//!
//! # I/O modes
//!
//! Exactly one mode governs reads at any instant:
//!
//! - **Blocking** – reads go straight to the socket; timeouts use the socket's
//!   read timeout, and a zero timeout toggles non-blocking mode for a single
//!   attempt.
//! - **Multiplexed** – the socket is registered with a [`crate::SelectIo`]
//!   thread, which performs the read on the caller's behalf while the caller
//!   waits.
//! - **Watched** – a watch callback owns the socket; reads are non-blocking.
//!
//! # Lifecycle
//!
//! `Active → (Postponed → Active)* → Closed`.  Postponing detaches the socket
//! but keeps the endpoint (and its session id and session state) alive for
//! `postpone_timeout`, so a reconnecting peer can resume it.

use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Token;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::NetError;
use crate::secure::{Role, SecureTransport, SecureUpgrade};
use crate::select::SelectHandle;

/// How long [`Endpoint::close`] waits for a secure transport held by
/// in-flight I/O before giving up on the closing notification.
const SECURE_CLOSE_WAIT: Duration = Duration::from_millis(100);

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Timeouts governing idle detection, postponement and graceful close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    /// How long an endpoint may sit unused before it counts as idle.
    /// Zero disables idle detection.
    pub idle_timeout: Duration,
    /// How long a postponed endpoint may wait to be resumed.
    pub postpone_timeout: Duration,
    /// How long [`Endpoint::close`] drains input after half-closing.
    pub linger: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            postpone_timeout: Duration::from_secs(120),
            linger: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Active,
    Postponed,
    Closed,
}

#[derive(Clone)]
pub(crate) enum IoMode {
    Blocking,
    Multiplexed(SelectHandle),
    Watched(SelectHandle),
}

impl IoMode {
    fn handle(&self) -> Option<&SelectHandle> {
        match self {
            Self::Blocking => None,
            Self::Multiplexed(handle) | Self::Watched(handle) => Some(handle),
        }
    }
}

/// A socket taken out of one endpoint so it can be attached to another,
/// together with any bytes already read from it and its secure transport.
pub struct DetachedSocket {
    pub(crate) stream: TcpStream,
    pub(crate) pending_input: Vec<u8>,
    pub(crate) secure: Option<Box<dyn SecureTransport>>,
}

struct Lifecycle {
    state: EndpointState,
    in_use: bool,
    last_activity: Instant,
    postponed_at: Option<Instant>,
    session_id: Option<Uuid>,
}

pub struct Endpoint {
    id: u64,
    config: EndpointConfig,
    socket: RwLock<Option<TcpStream>>,
    mode: Mutex<IoMode>,
    secure: Mutex<Option<Box<dyn SecureTransport>>>,
    lifecycle: Mutex<Lifecycle>,
    pending_input: Mutex<Vec<u8>>,
    session_state: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

impl Endpoint {
    /// Wraps a connected socket.  The socket is used in blocking mode.
    pub fn new(stream: TcpStream, config: EndpointConfig) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not disable Nagle on new endpoint: {e}");
        }
        Arc::new(Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            socket: RwLock::new(Some(stream)),
            mode: Mutex::new(IoMode::Blocking),
            secure: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: EndpointState::Active,
                in_use: false,
                last_activity: Instant::now(),
                postponed_at: None,
                session_id: None,
            }),
            pending_input: Mutex::new(Vec::new()),
            session_state: Mutex::new(None),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        })
    }

    /// Connects to the first reachable address `addr` resolves to.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        timeout: Duration,
        config: EndpointConfig,
    ) -> Result<Arc<Self>, NetError> {
        let mut last_error = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => return Ok(Self::new(stream, config)),
                Err(e) => {
                    debug!("connect to {candidate} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .map(NetError::Io)
            .unwrap_or_else(|| NetError::InvalidParameter("address resolved to nothing".into())))
    }

    // ── Identity and state ───────────────────────────────────────────────────

    /// Process-unique id; never reused.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn state(&self) -> EndpointState {
        self.lifecycle.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.read().as_ref().and_then(|s| s.peer_addr().ok())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.read().as_ref().and_then(|s| s.local_addr().ok())
    }

    /// The session id under which this endpoint can be postponed and resumed.
    /// Assigned on first use.
    pub fn session_id(&self) -> Uuid {
        *self
            .lifecycle
            .lock()
            .session_id
            .get_or_insert_with(Uuid::new_v4)
    }

    /// Opaque per-session state kept across postpone/resume.
    pub fn session_state(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.session_state.lock().clone()
    }

    pub fn set_session_state(&self, state: Arc<dyn Any + Send + Sync>) {
        *self.session_state.lock() = Some(state);
    }

    pub fn is_multiplexed(&self) -> bool {
        !matches!(*self.mode.lock(), IoMode::Blocking)
    }

    // ── Secure transport ─────────────────────────────────────────────────────

    pub fn set_secure_transport(&self, transport: Box<dyn SecureTransport>) {
        *self.secure.lock() = Some(transport);
    }

    /// Runs `upgrade` over the socket and installs the resulting transport.
    pub fn upgrade_secure(&self, upgrade: &dyn SecureUpgrade, role: Role) -> Result<(), NetError> {
        let transport = self.with_socket(|socket| upgrade.upgrade(socket, role))?;
        self.set_secure_transport(transport);
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.secure.lock().is_some()
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Pushes bytes back so the next reads return them before socket data.
    pub fn unread(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut pending = self.pending_input.lock();
        pending.splice(0..0, bytes.iter().copied());
    }

    /// Reads at least one byte into `buf`.
    ///
    /// `timeout`: `None` waits indefinitely, `Some(Duration::ZERO)` makes one
    /// non-blocking attempt.
    ///
    /// # Errors
    ///
    /// - [`NetError::ReadTimedOut`] when the timeout elapses.
    /// - [`NetError::ResourceTemporarilyUnavailable`] when a zero-timeout
    ///   attempt finds no data.
    /// - [`NetError::ConnectionBroken`] on end of stream or a closed endpoint.
    pub fn read_with_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Err(NetError::InvalidParameter("empty read buffer".into()));
        }
        let _serial = self.read_lock.lock();
        self.read_locked(buf, timeout)
    }

    /// Fills `buf` completely within one overall `timeout`.
    pub fn read_exactly(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<(), NetError> {
        let _serial = self.read_lock.lock();
        let mut clock = Deadline::new(timeout);
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = clock.next(NetError::ReadTimedOut)?;
            filled += self.read_locked(&mut buf[filled..], remaining)?;
        }
        Ok(())
    }

    fn read_locked(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, NetError> {
        if let Some(n) = self.take_pending(buf) {
            self.touch();
            return Ok(n);
        }
        self.ensure_active()?;

        let mode = self.mode.lock().clone();
        let n = match mode {
            IoMode::Blocking => self.read_blocking(buf, timeout)?,
            IoMode::Multiplexed(handle) => {
                let data = handle.read(buf.len(), timeout)?;
                buf[..data.len()].copy_from_slice(&data);
                data.len()
            }
            IoMode::Watched(_) => match self.read_raw(buf) {
                Ok(0) => return Err(NetError::ConnectionBroken),
                Ok(n) => n,
                Err(e) => return Err(NetError::from_read(e, true)),
            },
        };
        self.touch();
        Ok(n)
    }

    fn read_blocking(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, NetError> {
        let polling = timeout.is_some_and(|t| t.is_zero());
        self.with_socket(|socket| {
            if polling {
                socket.set_nonblocking(true)
            } else {
                socket.set_read_timeout(timeout)
            }
        })?;

        let result = self.read_raw(buf);

        if polling {
            self.restore_blocking();
        }
        match result {
            Ok(0) => Err(NetError::ConnectionBroken),
            Ok(n) => Ok(n),
            Err(e) => Err(NetError::from_read(e, polling)),
        }
    }

    fn take_pending(&self, buf: &mut [u8]) -> Option<usize> {
        let mut pending = self.pending_input.lock();
        if pending.is_empty() {
            return None;
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.drain(..n);
        Some(n)
    }

    fn restore_blocking(&self) {
        if let Err(e) = self.with_socket(|socket| socket.set_nonblocking(false)) {
            debug!("endpoint {}: could not restore blocking mode: {e}", self.id);
        }
    }

    /// One read from the socket or its secure transport, in whatever blocking
    /// mode the socket is in.  Used directly by the multiplexer threads.
    pub(crate) fn read_raw(&self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.socket.read();
        let socket = guard
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        loop {
            let mut secure = self.secure.lock();
            let result = match secure.as_mut() {
                Some(transport) => transport.read(socket, buf),
                None => MutexGuard::unlocked(&mut secure, || {
                    let mut stream: &TcpStream = socket;
                    stream.read(buf)
                }),
            };
            match result {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Performs one write, which may be partial.  Same timeout conventions as
    /// [`Endpoint::read_with_timeout`].
    pub fn write_with_timeout(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize, NetError> {
        let _serial = self.write_lock.lock();
        self.write_locked(buf, timeout)
    }

    /// Writes all of `buf` within one overall `timeout`.
    pub fn write_exactly(&self, buf: &[u8], timeout: Option<Duration>) -> Result<(), NetError> {
        let _serial = self.write_lock.lock();
        let mut clock = Deadline::new(timeout);
        let mut written = 0;
        while written < buf.len() {
            let remaining = clock.next(NetError::WriteTimedOut)?;
            written += self.write_locked(&buf[written..], remaining)?;
        }
        Ok(())
    }

    fn write_locked(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_active()?;

        let mode = self.mode.lock().clone();
        let n = match mode.handle() {
            None => self.write_blocking(buf, timeout)?,
            Some(handle) => self.write_nonblocking(handle, buf, timeout)?,
        };
        self.touch();
        Ok(n)
    }

    fn write_blocking(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize, NetError> {
        let polling = timeout.is_some_and(|t| t.is_zero());
        self.with_socket(|socket| {
            if polling {
                socket.set_nonblocking(true)
            } else {
                socket.set_write_timeout(timeout)
            }
        })?;

        let result = self.write_raw(buf);

        if polling {
            self.restore_blocking();
        }
        match result {
            Ok(0) => Err(NetError::ConnectionBroken),
            Ok(n) => Ok(n),
            Err(e) => Err(NetError::from_write(e, polling)),
        }
    }

    fn write_nonblocking(
        &self,
        handle: &SelectHandle,
        buf: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, NetError> {
        let polling = timeout.is_some_and(|t| t.is_zero());
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.write_raw(buf) {
                Ok(0) => return Err(NetError::ConnectionBroken),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if polling {
                        return Err(NetError::ResourceTemporarilyUnavailable);
                    }
                    handle.wait_writable(deadline)?;
                }
                Err(e) => return Err(NetError::from_write(e, false)),
            }
        }
    }

    fn write_raw(&self, buf: &[u8]) -> io::Result<usize> {
        let guard = self.socket.read();
        let socket = guard
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        loop {
            let mut secure = self.secure.lock();
            let result = match secure.as_mut() {
                Some(transport) => transport.write(socket, buf),
                None => MutexGuard::unlocked(&mut secure, || {
                    let mut stream: &TcpStream = socket;
                    stream.write(buf)
                }),
            };
            match result {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    // ── Closing ──────────────────────────────────────────────────────────────

    /// Cooperative close: lets the secure transport say goodbye, half-closes
    /// the write side, drains input for up to `linger`, then force-closes.
    /// Idempotent, and safe to call while another thread is blocked in I/O on
    /// this endpoint: a secure transport busy with that I/O is skipped and
    /// the socket closed outright.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let blocking = !self.is_multiplexed();
        {
            let guard = self.socket.read();
            if let Some(socket) = guard.as_ref() {
                match self.secure.try_lock_for(SECURE_CLOSE_WAIT) {
                    Some(mut secure) => {
                        if let Some(transport) = secure.as_mut() {
                            if let Err(e) = transport.close(socket) {
                                debug!("endpoint {}: secure close failed: {e}", self.id);
                            }
                        }
                    }
                    None => {
                        debug!("endpoint {}: secure transport busy, closing without notification", self.id);
                        drop(guard);
                        self.force_close();
                        return;
                    }
                }
                if let Err(e) = socket.shutdown(Shutdown::Write) {
                    debug!("endpoint {}: half-close failed: {e}", self.id);
                }
            }
        }
        if blocking {
            self.drain_input(Instant::now() + self.config.linger);
        }
        self.force_close();
    }

    fn drain_input(&self, deadline: Instant) {
        let mut scratch = [0u8; 1024];
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let guard = self.socket.read();
            let Some(socket) = guard.as_ref() else { break };
            if socket.set_read_timeout(Some(deadline - now)).is_err() {
                break;
            }
            let mut stream: &TcpStream = socket;
            match stream.read(&mut scratch) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    /// Closes immediately.  Any thread blocked reading this endpoint wakes up
    /// with [`NetError::ConnectionBroken`].  Idempotent.
    pub fn force_close(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == EndpointState::Closed {
                return;
            }
            lifecycle.state = EndpointState::Closed;
            lifecycle.in_use = false;
        }
        self.release_socket();
        self.session_state.lock().take();
        debug!("endpoint {} closed", self.id);
    }

    fn release_socket(&self) {
        if let Some(socket) = self.socket.read().as_ref() {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                debug!("endpoint {}: shutdown failed: {e}", self.id);
            }
        }
        let mode = std::mem::replace(&mut *self.mode.lock(), IoMode::Blocking);
        if let Some(handle) = mode.handle() {
            handle.detach();
        }
        self.socket.write().take();
        self.secure.lock().take();
        self.pending_input.lock().clear();
    }

    // ── Use marking ──────────────────────────────────────────────────────────

    /// Marks the endpoint in use if it is active and nobody else is using it.
    pub fn try_to_use(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != EndpointState::Active || lifecycle.in_use {
            return false;
        }
        lifecycle.in_use = true;
        lifecycle.last_activity = Instant::now();
        true
    }

    /// Marks the endpoint in use unconditionally.
    pub fn use_endpoint(&self) -> Result<(), NetError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != EndpointState::Active {
            return Err(NetError::InvalidState(format!(
                "endpoint {} is {:?}",
                self.id, lifecycle.state
            )));
        }
        lifecycle.in_use = true;
        lifecycle.last_activity = Instant::now();
        Ok(())
    }

    /// Releases the in-use mark; the idle clock starts now.
    pub fn un_use(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.in_use = false;
        lifecycle.last_activity = Instant::now();
    }

    pub fn is_in_use(&self) -> bool {
        self.lifecycle.lock().in_use
    }

    /// Time since the last successful I/O or use-marking change.
    pub fn idle_for(&self) -> Duration {
        self.lifecycle.lock().last_activity.elapsed()
    }

    /// Active, not in use, and unused for longer than `idle_timeout`.
    pub fn is_idle_expired(&self) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.state == EndpointState::Active
            && !lifecycle.in_use
            && !self.config.idle_timeout.is_zero()
            && lifecycle.last_activity.elapsed() > self.config.idle_timeout
    }

    fn touch(&self) {
        self.lifecycle.lock().last_activity = Instant::now();
    }

    fn ensure_active(&self) -> Result<(), NetError> {
        match self.lifecycle.lock().state {
            EndpointState::Active => Ok(()),
            EndpointState::Postponed | EndpointState::Closed => Err(NetError::ConnectionBroken),
        }
    }

    // ── Postpone / resume ────────────────────────────────────────────────────

    /// Detaches and closes the socket but keeps the endpoint resumable under
    /// its session id for `postpone_timeout`.
    pub fn postpone(&self) -> Result<Uuid, NetError> {
        let session_id = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != EndpointState::Active {
                return Err(NetError::InvalidState(format!(
                    "cannot postpone endpoint {} while {:?}",
                    self.id, lifecycle.state
                )));
            }
            lifecycle.state = EndpointState::Postponed;
            lifecycle.postponed_at = Some(Instant::now());
            lifecycle.in_use = false;
            *lifecycle.session_id.get_or_insert_with(Uuid::new_v4)
        };
        self.release_socket();
        debug!("endpoint {} postponed as session {session_id}", self.id);
        Ok(session_id)
    }

    /// Postponed for longer than `postpone_timeout`.
    pub fn is_postpone_expired(&self) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.state == EndpointState::Postponed
            && lifecycle
                .postponed_at
                .is_some_and(|at| at.elapsed() > self.config.postpone_timeout)
    }

    /// Attaches a new socket to a postponed endpoint.
    ///
    /// # Errors
    ///
    /// [`NetError::SessionExpired`] when the postpone window has passed (the
    /// endpoint is then closed), [`NetError::InvalidState`] when the endpoint
    /// is not postponed.
    pub fn resume(&self, detached: DetachedSocket) -> Result<(), NetError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != EndpointState::Postponed {
            return Err(NetError::InvalidState(format!(
                "cannot resume endpoint {} while {:?}",
                self.id, lifecycle.state
            )));
        }
        let expired = lifecycle
            .postponed_at
            .map_or(true, |at| at.elapsed() > self.config.postpone_timeout);
        if expired {
            lifecycle.state = EndpointState::Closed;
            drop(lifecycle);
            self.session_state.lock().take();
            return Err(NetError::SessionExpired);
        }

        *self.socket.write() = Some(detached.stream);
        *self.secure.lock() = detached.secure;
        *self.pending_input.lock() = detached.pending_input;
        *self.mode.lock() = IoMode::Blocking;
        lifecycle.state = EndpointState::Active;
        lifecycle.postponed_at = None;
        lifecycle.last_activity = Instant::now();
        debug!("endpoint {} resumed", self.id);
        Ok(())
    }

    /// Takes the socket out of this endpoint without closing the connection,
    /// leaving this endpoint closed.
    pub fn detach_socket(&self) -> Result<DetachedSocket, NetError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != EndpointState::Active {
                return Err(NetError::ConnectionBroken);
            }
            lifecycle.state = EndpointState::Closed;
            lifecycle.in_use = false;
        }
        let mode = std::mem::replace(&mut *self.mode.lock(), IoMode::Blocking);
        if let Some(handle) = mode.handle() {
            handle.detach();
        }
        let stream = self.socket.write().take().ok_or(NetError::ConnectionBroken)?;
        stream.set_nonblocking(false)?;
        Ok(DetachedSocket {
            stream,
            pending_input: std::mem::take(&mut *self.pending_input.lock()),
            secure: self.secure.lock().take(),
        })
    }

    // ── Multiplexer plumbing ─────────────────────────────────────────────────

    fn with_socket<T>(&self, f: impl FnOnce(&TcpStream) -> io::Result<T>) -> Result<T, NetError> {
        let guard = self.socket.read();
        let socket = guard.as_ref().ok_or(NetError::ConnectionBroken)?;
        Ok(f(socket)?)
    }

    pub(crate) fn try_clone_socket(&self) -> Result<TcpStream, NetError> {
        self.with_socket(TcpStream::try_clone)
    }

    pub(crate) fn enter_select_mode(&self, mode: IoMode) -> Result<(), NetError> {
        self.ensure_active()?;
        let mut current = self.mode.lock();
        if !matches!(*current, IoMode::Blocking) {
            return Err(NetError::InvalidState(format!(
                "endpoint {} is already registered with the multiplexer",
                self.id
            )));
        }
        self.with_socket(|socket| socket.set_nonblocking(true))?;
        *current = mode;
        Ok(())
    }

    /// Returns to blocking mode if `(thread, token)` is the current registration.
    pub(crate) fn leave_select_mode(&self, thread: u64, token: Token) {
        let mut mode = self.mode.lock();
        let registered = mode
            .handle()
            .is_some_and(|handle| handle.identity() == (thread, token));
        if registered {
            *mode = IoMode::Blocking;
            drop(mode);
            self.restore_blocking();
        }
    }
}

/// Tracks one overall deadline across several I/O calls.
struct Deadline {
    at: Option<Instant>,
    attempted: bool,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| Instant::now() + t),
            attempted: false,
        }
    }

    /// Time left for the next call; the first call always gets to try, even
    /// with a zero timeout.
    fn next(&mut self, expired: NetError) -> Result<Option<Duration>, NetError> {
        let Some(at) = self.at else {
            return Ok(None);
        };
        let left = at.saturating_duration_since(Instant::now());
        if left.is_zero() && self.attempted {
            return Err(expired);
        }
        self.attempted = true;
        Ok(Some(left))
    }
}
