//! Readiness multiplexer.
//!
//! [`SelectIo`] lets a few OS threads watch many sockets.  Each
//! [`SelectThread`] owns a `mio::Poll`, a waker, and the sockets registered
//! with it.  Two registration kinds exist:
//!
//! - **read** ([`SelectIo::add_socket_for_reading`]): an endpoint's blocking
//!   reads are posted to the thread, which performs them when the socket turns
//!   readable and wakes the waiting caller.
//! - **watch** ([`SelectIo::add_socket_for_watching`]): a callback runs on the
//!   select thread whenever data arrives; returning `false` unregisters it.
//!
//! # Readiness bookkeeping
//!
//! `mio` is edge-triggered, so every action keeps sticky `readable` and
//! `writable` hints.  A hint is set by an event and cleared only when an
//! operation hits `WouldBlock`.  Pending operations are retried on each pass
//! while their hint is set, and time out on their own deadlines.
//!
//! # Threads
//!
//! Threads are created on demand: a registration goes to the first thread
//! below `sockets_per_thread`; when all are full a new thread starts, up to
//! `max_threads`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::TcpStream as MioStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::endpoint::{Endpoint, IoMode};
use crate::error::NetError;

const WAKER_TOKEN: Token = Token(usize::MAX);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Callback invoked on the select thread when a watched socket has data, or
/// with `Some(error)` when the socket failed.  Returning `false` unregisters.
pub type WatchCallback = Box<dyn FnMut(&Arc<Endpoint>, Option<&NetError>) -> bool + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectConfig {
    pub sockets_per_thread: usize,
    pub max_threads: usize,
    /// Upper bound on how long a thread sleeps between deadline checks.
    pub poll_interval: Duration,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            sockets_per_thread: 512,
            max_threads: 16,
            poll_interval: Duration::from_millis(100),
        }
    }
}

// ── Multiplexer ──────────────────────────────────────────────────────────────

pub struct SelectIo {
    config: SelectConfig,
    threads: Mutex<Vec<Arc<SelectThread>>>,
}

impl SelectIo {
    pub fn new(config: SelectConfig) -> Self {
        Self {
            config,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SelectConfig {
        &self.config
    }

    /// Registers an endpoint so its reads are performed by a select thread.
    ///
    /// # Errors
    ///
    /// [`NetError::TooManySockets`] when every thread is full and no more may
    /// be started; [`NetError::InvalidState`] when the endpoint is already
    /// registered.
    pub fn add_socket_for_reading(&self, endpoint: &Arc<Endpoint>) -> Result<SelectHandle, NetError> {
        self.register(endpoint, ActionKind::Read)
    }

    /// Registers an endpoint whose arrivals are handled by `callback` on the
    /// select thread.
    pub fn add_socket_for_watching<F>(&self, endpoint: &Arc<Endpoint>, callback: F) -> Result<SelectHandle, NetError>
    where
        F: FnMut(&Arc<Endpoint>, Option<&NetError>) -> bool + Send + 'static,
    {
        self.register(endpoint, ActionKind::Watch(Some(Box::new(callback))))
    }

    /// Unregisters the endpoint behind `handle` and returns it to blocking mode.
    pub fn remove_socket(&self, handle: &SelectHandle) {
        handle.remove();
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn socket_count(&self) -> usize {
        self.threads.lock().iter().map(|t| t.len()).sum()
    }

    /// Stops every select thread.  Registered endpoints fall back to blocking
    /// mode; pending operations fail with [`NetError::ConnectionBroken`].
    pub fn shutdown(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            thread.stop();
        }
    }

    fn register(&self, endpoint: &Arc<Endpoint>, kind: ActionKind) -> Result<SelectHandle, NetError> {
        let mut threads = self.threads.lock();
        let thread = match threads.iter().find(|t| t.len() < self.config.sockets_per_thread) {
            Some(thread) => Arc::clone(thread),
            None if threads.len() < self.config.max_threads => {
                let thread = SelectThread::spawn(threads.len(), &self.config)?;
                threads.push(Arc::clone(&thread));
                info!("select thread {} started ({} total)", thread.index, threads.len());
                thread
            }
            None => {
                warn!(
                    "select capacity exhausted: {} threads x {} sockets",
                    self.config.max_threads, self.config.sockets_per_thread
                );
                return Err(NetError::TooManySockets);
            }
        };

        let handle = SelectHandle {
            token: thread.allocate_token(),
            thread,
        };
        let mode = match kind {
            ActionKind::Read => IoMode::Multiplexed(handle.clone()),
            ActionKind::Watch(_) => IoMode::Watched(handle.clone()),
        };
        endpoint.enter_select_mode(mode)?;

        let inserted = endpoint.try_clone_socket().and_then(|stream| {
            handle
                .thread
                .insert(handle.token, MioStream::from_std(stream), kind, Arc::downgrade(endpoint))
        });
        if let Err(e) = inserted {
            let (thread_id, token) = handle.identity();
            endpoint.leave_select_mode(thread_id, token);
            return Err(e);
        }
        debug!(
            "endpoint {} registered on select thread {}",
            endpoint.id(),
            handle.thread.index
        );
        Ok(handle)
    }
}

impl Drop for SelectIo {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// A registration of one endpoint with one select thread.
#[derive(Clone)]
pub struct SelectHandle {
    thread: Arc<SelectThread>,
    token: Token,
}

impl SelectHandle {
    /// Reads up to `len` bytes through the select thread.
    ///
    /// A zero `timeout` performs a single attempt and fails with
    /// [`NetError::ResourceTemporarilyUnavailable`] when nothing is buffered.
    pub fn read(&self, len: usize, timeout: Option<Duration>) -> Result<Vec<u8>, NetError> {
        self.thread.post_read(self.token, len, timeout)?.wait()
    }

    /// Blocks until the socket may be writable again or `deadline` passes.
    pub fn wait_writable(&self, deadline: Option<Instant>) -> Result<(), NetError> {
        self.thread.post_writable(self.token, deadline)?.wait().map(|_| ())
    }

    /// Unregisters and returns the endpoint to blocking mode.
    pub fn remove(&self) {
        if let Some(endpoint) = self.thread.remove(self.token) {
            endpoint.leave_select_mode(self.thread.id, self.token);
        }
    }

    /// Unregisters without touching the endpoint's mode.
    pub(crate) fn detach(&self) {
        self.thread.remove(self.token);
    }

    pub fn thread_index(&self) -> usize {
        self.thread.index
    }

    pub(crate) fn identity(&self) -> (u64, Token) {
        (self.thread.id, self.token)
    }
}

// ── Per-thread state ─────────────────────────────────────────────────────────

struct Completion {
    result: Mutex<Option<Result<Vec<u8>, NetError>>>,
    ready: Condvar,
}

impl Completion {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn complete(&self, result: Result<Vec<u8>, NetError>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Result<Vec<u8>, NetError> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.ready.wait(&mut slot);
        }
    }
}

struct PendingRead {
    len: usize,
    deadline: Option<Instant>,
    polling: bool,
    completion: Arc<Completion>,
}

struct PendingWritable {
    deadline: Option<Instant>,
    completion: Arc<Completion>,
}

enum ActionKind {
    Read,
    /// `None` while the callback is running outside the lock.
    Watch(Option<WatchCallback>),
}

struct Action {
    stream: MioStream,
    endpoint: Weak<Endpoint>,
    kind: ActionKind,
    read: Option<PendingRead>,
    writable: Option<PendingWritable>,
    readable_hint: bool,
    writable_hint: bool,
    /// Error observed while no operation was waiting; delivered to the next one.
    pending_error: Option<NetError>,
    failed: bool,
    last_os_error: Option<i32>,
}

impl Action {
    fn has_immediate_work(&self) -> bool {
        let watch_ready = matches!(self.kind, ActionKind::Watch(Some(_))) && self.readable_hint;
        (self.read.is_some() && (self.readable_hint || self.failed || self.pending_error.is_some()))
            || (self.writable.is_some() && self.writable_hint)
            || watch_ready
    }

    fn next_deadline(&self) -> Option<Instant> {
        let read = self.read.as_ref().and_then(|r| r.deadline);
        let write = self.writable.as_ref().and_then(|w| w.deadline);
        match (read, write) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn fail_pending(&mut self) {
        if let Some(read) = self.read.take() {
            read.completion.complete(Err(NetError::ConnectionBroken));
        }
        if let Some(writable) = self.writable.take() {
            writable.completion.complete(Err(NetError::ConnectionBroken));
        }
    }
}

struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

struct CallbackRun {
    token: Token,
    endpoint: Weak<Endpoint>,
    callback: WatchCallback,
    error: Option<NetError>,
}

struct SelectThread {
    id: u64,
    index: usize,
    registry: Registry,
    waker: Waker,
    actions: Mutex<HashMap<Token, Action>>,
    running: AtomicBool,
    next_token: AtomicUsize,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SelectThread {
    fn spawn(index: usize, config: &SelectConfig) -> Result<Arc<Self>, NetError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let thread = Arc::new(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            index,
            registry,
            waker,
            actions: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            next_token: AtomicUsize::new(0),
            join: Mutex::new(None),
        });

        let worker = Arc::clone(&thread);
        let poll_interval = config.poll_interval;
        let join = std::thread::Builder::new()
            .name(format!("tether-select-{index}"))
            .spawn(move || worker.run(poll, poll_interval))?;
        *thread.join.lock() = Some(join);
        Ok(thread)
    }

    fn len(&self) -> usize {
        self.actions.lock().len()
    }

    fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, token: Token, mut stream: MioStream, kind: ActionKind, endpoint: Weak<Endpoint>) -> Result<(), NetError> {
        self.registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        self.actions.lock().insert(
            token,
            Action {
                stream,
                endpoint,
                kind,
                read: None,
                writable: None,
                readable_hint: false,
                writable_hint: true,
                pending_error: None,
                failed: false,
                last_os_error: None,
            },
        );
        self.wake();
        Ok(())
    }

    fn remove(&self, token: Token) -> Option<Arc<Endpoint>> {
        let mut action = self.actions.lock().remove(&token)?;
        if let Err(e) = self.registry.deregister(&mut action.stream) {
            debug!("select thread {}: deregister failed: {e}", self.index);
        }
        action.fail_pending();
        debug!(
            "select thread {}: token {} removed (last os error {:?})",
            self.index, token.0, action.last_os_error
        );
        action.endpoint.upgrade()
    }

    fn post_read(&self, token: Token, len: usize, timeout: Option<Duration>) -> Result<Arc<Completion>, NetError> {
        let completion = Completion::new();
        {
            let mut actions = self.actions.lock();
            let action = actions.get_mut(&token).ok_or(NetError::ConnectionBroken)?;
            if !matches!(action.kind, ActionKind::Read) {
                return Err(NetError::InvalidState("socket is registered for watching".into()));
            }
            if let Some(err) = action.pending_error.take() {
                action.failed = true;
                return Err(err);
            }
            if action.failed {
                return Err(NetError::ConnectionBroken);
            }
            if action.read.is_some() {
                return Err(NetError::InvalidState("a read is already pending".into()));
            }
            action.read = Some(PendingRead {
                len,
                deadline: timeout.map(|t| Instant::now() + t),
                polling: timeout.is_some_and(|t| t.is_zero()),
                completion: Arc::clone(&completion),
            });
            // Retry once regardless of the last edge; the hint may be stale.
            action.readable_hint = true;
        }
        self.wake();
        Ok(completion)
    }

    fn post_writable(&self, token: Token, deadline: Option<Instant>) -> Result<Arc<Completion>, NetError> {
        let completion = Completion::new();
        {
            let mut actions = self.actions.lock();
            let action = actions.get_mut(&token).ok_or(NetError::ConnectionBroken)?;
            if action.failed {
                return Err(NetError::ConnectionBroken);
            }
            if action.writable.is_some() {
                return Err(NetError::InvalidState("a write wait is already pending".into()));
            }
            action.writable = Some(PendingWritable {
                deadline,
                completion: Arc::clone(&completion),
            });
        }
        self.wake();
        Ok(completion)
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("select thread {}: wake failed: {e}", self.index);
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake();
        if let Some(join) = self.join.lock().take() {
            if join.thread().id() != std::thread::current().id() && join.join().is_err() {
                error!("select thread {} panicked", self.index);
            }
        }
    }

    // ── Loop ─────────────────────────────────────────────────────────────────

    fn run(&self, mut poll: Poll, poll_interval: Duration) {
        let mut events = Events::with_capacity(256);
        while self.running.load(Ordering::Acquire) {
            let timeout = self.next_timeout(poll_interval);
            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("select thread {}: poll failed: {e}", self.index);
                break;
            }
            let ready: Vec<(Token, Readiness)> = events
                .iter()
                .filter(|event| event.token() != WAKER_TOKEN)
                .map(|event| (event.token(), Readiness::from(event)))
                .collect();
            self.service(&ready);
        }
        self.release_all();
        debug!("select thread {} stopped", self.index);
    }

    fn next_timeout(&self, poll_interval: Duration) -> Duration {
        let actions = self.actions.lock();
        if actions.values().any(Action::has_immediate_work) {
            return Duration::ZERO;
        }
        let now = Instant::now();
        actions
            .values()
            .filter_map(Action::next_deadline)
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(poll_interval, Duration::min)
    }

    fn service(&self, ready: &[(Token, Readiness)]) {
        let mut callbacks = Vec::new();
        {
            let mut actions = self.actions.lock();
            for (token, readiness) in ready {
                let Some(action) = actions.get_mut(token) else { continue };
                action.readable_hint |= readiness.readable;
                action.writable_hint |= readiness.writable;
                if readiness.error {
                    Self::handle_error(action);
                }
            }
            for (token, action) in actions.iter_mut() {
                Self::do_action(*token, action, &mut callbacks);
            }
            let now = Instant::now();
            for action in actions.values_mut() {
                Self::expire(action, now);
            }
            actions.retain(|_, action| {
                let alive = action.endpoint.strong_count() > 0;
                if !alive {
                    let _ = self.registry.deregister(&mut action.stream);
                    action.fail_pending();
                }
                alive
            });
        }
        for run in callbacks {
            self.run_callback(run);
        }
    }

    fn handle_error(action: &mut Action) {
        let err = match action.stream.take_error() {
            Ok(Some(err)) => err,
            Ok(None) => io::Error::from(io::ErrorKind::ConnectionReset),
            Err(err) => err,
        };
        action.last_os_error = err.raw_os_error();
        let mapped = NetError::from_read(err, false);
        if let Some(writable) = action.writable.take() {
            writable.completion.complete(Err(NetError::ConnectionBroken));
        }
        action.pending_error = Some(mapped);
        action.readable_hint = true;
    }

    fn do_action(token: Token, action: &mut Action, callbacks: &mut Vec<CallbackRun>) {
        if action.writable_hint {
            if let Some(writable) = action.writable.take() {
                action.writable_hint = false;
                writable.completion.complete(Ok(Vec::new()));
            }
        }

        if matches!(action.kind, ActionKind::Read) {
            if action.read.is_none() {
                return;
            }
            if let Some(err) = action.pending_error.take() {
                action.failed = true;
                Self::finish_read(action, Err(err));
                return;
            }
            if action.failed {
                Self::finish_read(action, Err(NetError::ConnectionBroken));
                return;
            }
            if !action.readable_hint {
                return;
            }
            let Some(endpoint) = action.endpoint.upgrade() else {
                Self::finish_read(action, Err(NetError::ConnectionBroken));
                return;
            };
            let len = action.read.as_ref().map_or(0, |r| r.len);
            let mut buf = vec![0u8; len];
            match endpoint.read_raw(&mut buf) {
                Ok(0) => {
                    action.failed = true;
                    Self::finish_read(action, Err(NetError::ConnectionBroken));
                }
                Ok(n) => {
                    buf.truncate(n);
                    Self::finish_read(action, Ok(buf));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    action.readable_hint = false;
                }
                Err(e) => {
                    action.last_os_error = e.raw_os_error();
                    action.failed = true;
                    Self::finish_read(action, Err(NetError::from_read(e, false)));
                }
            }
            return;
        }

        if !action.readable_hint {
            return;
        }
        if let ActionKind::Watch(slot) = &mut action.kind {
            if let Some(callback) = slot.take() {
                action.readable_hint = false;
                callbacks.push(CallbackRun {
                    token,
                    endpoint: action.endpoint.clone(),
                    callback,
                    error: action.pending_error.take(),
                });
            }
        }
    }

    fn finish_read(action: &mut Action, result: Result<Vec<u8>, NetError>) {
        if let Some(read) = action.read.take() {
            read.completion.complete(result);
        }
    }

    fn expire(action: &mut Action, now: Instant) {
        if action.read.as_ref().and_then(|r| r.deadline).is_some_and(|d| now >= d) {
            if let Some(read) = action.read.take() {
                let err = if read.polling {
                    NetError::ResourceTemporarilyUnavailable
                } else {
                    NetError::ReadTimedOut
                };
                read.completion.complete(Err(err));
            }
        }
        if action.writable.as_ref().and_then(|w| w.deadline).is_some_and(|d| now >= d) {
            if let Some(writable) = action.writable.take() {
                writable.completion.complete(Err(NetError::WriteTimedOut));
            }
        }
    }

    fn run_callback(&self, run: CallbackRun) {
        let CallbackRun {
            token,
            endpoint,
            mut callback,
            error,
        } = run;
        let failed = error.is_some();
        let keep = match endpoint.upgrade() {
            Some(endpoint) => callback(&endpoint, error.as_ref()) && !failed,
            None => false,
        };

        if !keep {
            if let Some(endpoint) = self.remove(token) {
                endpoint.leave_select_mode(self.id, token);
            }
            return;
        }

        let mut actions = self.actions.lock();
        // The callback may have unregistered itself.
        let Some(action) = actions.get_mut(&token) else { return };
        if let ActionKind::Watch(slot) = &mut action.kind {
            *slot = Some(callback);
        }
        let mut probe = [0u8; 1];
        match action.stream.peek(&mut probe) {
            Ok(0) => {
                action.pending_error = Some(NetError::ConnectionBroken);
                action.readable_hint = true;
            }
            Ok(_) => action.readable_hint = true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                action.last_os_error = e.raw_os_error();
                action.pending_error = Some(NetError::from_read(e, false));
                action.readable_hint = true;
            }
        }
    }

    fn release_all(&self) {
        let drained: Vec<(Token, Action)> = self.actions.lock().drain().collect();
        for (token, mut action) in drained {
            let _ = self.registry.deregister(&mut action.stream);
            action.fail_pending();
            if let Some(endpoint) = action.endpoint.upgrade() {
                endpoint.leave_select_mode(self.id, token);
            }
        }
    }
}
