//! Worker pool running connection handlers to completion.
//!
//! # Scheduling
//!
//! A handler handed to [`WorkerPool::add_connection_handler`] goes to the most
//! recently idle worker if there is one, otherwise to a freshly spawned worker
//! while the pool is below `max_size`, otherwise to a FIFO queue.  A worker
//! that finishes a handler takes the next queued one before going idle, so the
//! queue drains without any dispatcher thread.  When the queue is full the
//! caller blocks until a worker frees a slot; handlers are never dropped.
//!
//! Idle workers above `initial_size + idle_page_size` are retired, oldest
//! first.
//!
//! # Locking
//!
//! All bookkeeping lives in one `Mutex<PoolState>`.  Workers park on
//! `Shared::assigned` and check their own slot when woken; the lock is
//! released while a handler runs.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tether_net::{CancelToken, ConnectionLogger, Endpoint};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::handler::{ConnectionHandler, HandlerCapability, HandlerType};

pub type WorkerId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Workers started up front.
    pub initial_size: usize,
    /// Hard cap on concurrently running handlers.
    pub max_size: usize,
    /// Idle workers kept above `initial_size` before trimming.
    pub idle_page_size: usize,
    /// Handlers that may wait for a worker before callers block.
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 4,
            max_size: 64,
            idle_page_size: 4,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

enum Assignment {
    Run(Box<dyn ConnectionHandler>),
    Retire,
}

struct WorkerSlot {
    assignment: Option<Assignment>,
    join: Option<JoinHandle<()>>,
}

/// What the pool remembers about a running handler.
struct BusyInfo {
    handler_type: HandlerType,
    cancel: CancelToken,
    endpoint: Arc<Endpoint>,
}

impl BusyInfo {
    fn of(handler: &dyn ConnectionHandler) -> Self {
        Self {
            handler_type: handler.handler_type(),
            cancel: handler.cancel_token().clone(),
            endpoint: Arc::clone(handler.endpoint()),
        }
    }
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, WorkerSlot>,
    /// Front is the worker idle the longest.
    idle: VecDeque<WorkerId>,
    busy: HashMap<WorkerId, BusyInfo>,
    queue: VecDeque<Box<dyn ConnectionHandler>>,
    next_id: WorkerId,
    shareable_accepted: u64,
    shut_down: bool,
}

struct Shared {
    config: WorkerPoolConfig,
    logger: Arc<dyn ConnectionLogger>,
    state: Mutex<PoolState>,
    /// Workers wait here for an assignment.
    assigned: Condvar,
    /// Blocked producers wait here for queue space.
    queue_space: Condvar,
    /// Signalled whenever a worker finishes a handler.
    finished: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Creates the pool and starts `initial_size` idle workers.
    pub fn new(config: WorkerPoolConfig, logger: Arc<dyn ConnectionLogger>) -> Result<Self, PoolError> {
        if config.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1"));
        }
        if config.initial_size > config.max_size {
            return Err(PoolError::InvalidConfig("initial_size exceeds max_size"));
        }
        let pool = Self {
            shared: Arc::new(Shared {
                config,
                logger,
                state: Mutex::new(PoolState::default()),
                assigned: Condvar::new(),
                queue_space: Condvar::new(),
                finished: Condvar::new(),
            }),
        };
        {
            let mut state = pool.shared.state.lock();
            for _ in 0..pool.shared.config.initial_size {
                let id = pool.spawn_worker(&mut state, None)?;
                state.idle.push_back(id);
            }
        }
        debug!("worker pool started with {} workers", pool.shared.config.initial_size);
        Ok(pool)
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Schedules `handler`, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// [`PoolError::ShutDown`] once [`WorkerPool::shutdown`] has started; the
    /// handler's endpoint is closed.  [`PoolError::Spawn`] when a needed
    /// worker thread could not be started.
    pub fn add_connection_handler(&self, handler: Box<dyn ConnectionHandler>) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if handler.capability() == HandlerCapability::Shareable {
            state.shareable_accepted += 1;
        }
        loop {
            if state.shut_down {
                drop(state);
                handler.endpoint().force_close();
                return Err(PoolError::ShutDown);
            }
            if let Some(id) = state.idle.pop_back() {
                state.busy.insert(id, BusyInfo::of(handler.as_ref()));
                if let Some(slot) = state.workers.get_mut(&id) {
                    slot.assignment = Some(Assignment::Run(handler));
                }
                self.shared.assigned.notify_all();
                return Ok(());
            }
            if state.workers.len() < self.shared.config.max_size {
                let busy = BusyInfo::of(handler.as_ref());
                let id = self.spawn_worker(&mut state, Some(Assignment::Run(handler)))?;
                state.busy.insert(id, busy);
                return Ok(());
            }
            if state.queue.len() < self.shared.config.queue_capacity {
                state.queue.push_back(handler);
                return Ok(());
            }
            debug!("worker pool queue full, waiting for a free slot");
            self.shared.queue_space.wait(&mut state);
        }
    }

    /// Cancels running handlers of `handler_type`, on every worker or only on
    /// `worker`.  Returns how many were asked to stop.
    pub fn stop_connection_handlers(&self, handler_type: HandlerType, worker: Option<WorkerId>) -> usize {
        let state = self.shared.state.lock();
        let mut stopped = 0;
        for (id, info) in &state.busy {
            if info.handler_type == handler_type && worker.map_or(true, |w| w == *id) {
                info.cancel.cancel();
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!("asked {stopped} {handler_type} handler(s) to stop");
        }
        stopped
    }

    /// Retires idle workers above `initial_size + idle_page_size`.  Returns how
    /// many were retired.
    pub fn trim_idle(&self) -> usize {
        let mut state = self.shared.state.lock();
        Self::trim_locked(&self.shared, &mut state)
    }

    /// Stops the pool: running handlers are cancelled and given `timeout` to
    /// finish before their endpoints are force-closed, queued handlers are
    /// dropped with their endpoints closed, and every worker is joined.
    pub fn shutdown(&self, timeout: Duration) {
        let (joins, queued) = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            for info in state.busy.values() {
                info.cancel.cancel();
            }
            let queued: Vec<_> = state.queue.drain(..).collect();
            let idle: Vec<_> = state.idle.drain(..).collect();
            for id in idle {
                if let Some(slot) = state.workers.get_mut(&id) {
                    slot.assignment = Some(Assignment::Retire);
                }
            }
            let joins: Vec<_> = state.workers.values_mut().filter_map(|slot| slot.join.take()).collect();
            self.shared.assigned.notify_all();
            self.shared.queue_space.notify_all();
            (joins, queued)
        };

        for handler in &queued {
            handler.endpoint().force_close();
        }
        drop(queued);

        let deadline = Instant::now() + timeout;
        {
            let mut state = self.shared.state.lock();
            while !state.busy.is_empty() {
                if self.shared.finished.wait_until(&mut state, deadline).timed_out() {
                    warn!(
                        "{} handler(s) still running after {timeout:?}, closing their endpoints",
                        state.busy.len()
                    );
                    for info in state.busy.values() {
                        info.endpoint.force_close();
                    }
                    break;
                }
            }
        }

        for join in joins {
            if join.join().is_err() {
                error!("worker thread panicked outside a handler");
            }
        }
        info!("worker pool shut down");
    }

    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    pub fn busy_count(&self) -> usize {
        self.shared.state.lock().busy.len()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Shareable handlers accepted since the pool started.
    pub fn shareable_count(&self) -> u64 {
        self.shared.state.lock().shareable_accepted
    }

    /// Workers currently running a handler, with the handler's type.
    pub fn busy_workers(&self) -> Vec<(WorkerId, HandlerType)> {
        let state = self.shared.state.lock();
        let mut busy: Vec<_> = state.busy.iter().map(|(id, info)| (*id, info.handler_type)).collect();
        busy.sort_by_key(|(id, _)| *id);
        busy
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shut_down
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn spawn_worker(&self, state: &mut PoolState, assignment: Option<Assignment>) -> Result<WorkerId, PoolError> {
        let id = state.next_id;
        state.next_id += 1;
        state.workers.insert(id, WorkerSlot { assignment, join: None });

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("tether-worker-{id}"))
            .spawn(move || worker_loop(&shared, id));
        match spawned {
            Ok(join) => {
                if let Some(slot) = state.workers.get_mut(&id) {
                    slot.join = Some(join);
                }
                debug!("worker {id} started");
                Ok(id)
            }
            Err(e) => {
                if let Some(WorkerSlot {
                    assignment: Some(Assignment::Run(handler)),
                    ..
                }) = state.workers.remove(&id)
                {
                    handler.endpoint().force_close();
                }
                error!("failed to spawn worker {id}: {e}");
                Err(PoolError::Spawn(e))
            }
        }
    }

    fn trim_locked(shared: &Shared, state: &mut PoolState) -> usize {
        let keep = shared.config.initial_size + shared.config.idle_page_size;
        let mut retired = 0;
        while state.idle.len() > keep {
            let Some(id) = state.idle.pop_front() else { break };
            if let Some(slot) = state.workers.get_mut(&id) {
                slot.assignment = Some(Assignment::Retire);
                retired += 1;
            }
        }
        if retired > 0 {
            debug!("retiring {retired} idle worker(s)");
            shared.assigned.notify_all();
        }
        retired
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}

fn worker_loop(shared: &Shared, id: WorkerId) {
    let mut state = shared.state.lock();
    loop {
        let assignment = loop {
            if let Some(assignment) = state.workers.get_mut(&id).and_then(|slot| slot.assignment.take()) {
                break assignment;
            }
            shared.assigned.wait(&mut state);
        };
        let mut handler = match assignment {
            Assignment::Run(handler) => handler,
            Assignment::Retire => break,
        };

        loop {
            MutexGuard::unlocked(&mut state, || run_handler(shared, id, handler.as_mut()));
            drop(handler);
            state.busy.remove(&id);
            shared.finished.notify_all();

            if state.shut_down {
                break;
            }
            match state.queue.pop_front() {
                Some(next) => {
                    shared.queue_space.notify_one();
                    next.on_redistributed();
                    state.busy.insert(id, BusyInfo::of(next.as_ref()));
                    handler = next;
                }
                None => break,
            }
        }

        if state.shut_down {
            break;
        }
        state.idle.push_back(id);
        WorkerPool::trim_locked(shared, &mut state);
    }
    state.workers.remove(&id);
    debug!("worker {id} retired");
}

fn run_handler(shared: &Shared, id: WorkerId, handler: &mut dyn ConnectionHandler) {
    let started = Instant::now();
    let handler_type = handler.handler_type();
    let endpoint_id = handler.endpoint().id();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle()));
    let message = match outcome {
        Ok(Ok(())) => {
            debug!(worker = id, "{handler_type} handler for endpoint {endpoint_id} finished");
            return;
        }
        Ok(Err(e)) => {
            warn!(worker = id, "{handler_type} handler for endpoint {endpoint_id} failed: {e}");
            format!("{handler_type} handler for endpoint {endpoint_id} failed: {e}")
        }
        Err(_) => {
            error!(worker = id, "{handler_type} handler for endpoint {endpoint_id} panicked");
            handler.endpoint().force_close();
            format!("{handler_type} handler for endpoint {endpoint_id} panicked")
        }
    };
    shared.logger.log("pool", &message, started.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::handler::{HandlerCore, HandlerError};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use tether_net::{EndpointConfig, TracingLogger};

    const TEST_HANDLER: HandlerType = HandlerType("test");

    /// Runs until its token is cancelled, optionally failing or panicking.
    struct WaitingHandler {
        core: HandlerCore,
        started: mpsc::Sender<u32>,
        fail: bool,
        panic: bool,
    }

    impl ConnectionHandler for WaitingHandler {
        fn handler_type(&self) -> HandlerType {
            TEST_HANDLER
        }

        fn core(&self) -> &HandlerCore {
            &self.core
        }

        fn handle(&mut self) -> Result<(), HandlerError> {
            let _ = self.started.send(self.redistribution_count());
            if self.panic {
                panic!("handler blew up");
            }
            if self.fail {
                return Err(HandlerError::Failed("requested failure".into()));
            }
            while !self.core.cancel_token().wait_timeout(Duration::from_millis(20)) {}
            Ok(())
        }
    }

    struct Fixture {
        listener: TcpListener,
        _clients: Vec<TcpStream>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                listener: TcpListener::bind("127.0.0.1:0").unwrap(),
                _clients: Vec::new(),
            }
        }

        fn endpoint(&mut self) -> Arc<Endpoint> {
            let client = TcpStream::connect(self.listener.local_addr().unwrap()).unwrap();
            let (server, _) = self.listener.accept().unwrap();
            self._clients.push(client);
            Endpoint::new(server, EndpointConfig::default())
        }

        fn handler(&mut self, started: &mpsc::Sender<u32>) -> Box<dyn ConnectionHandler> {
            Box::new(WaitingHandler {
                core: HandlerCore::new(self.endpoint()),
                started: started.clone(),
                fail: false,
                panic: false,
            })
        }
    }

    fn pool(initial: usize, max: usize) -> WorkerPool {
        WorkerPool::new(
            WorkerPoolConfig {
                initial_size: initial,
                max_size: max,
                idle_page_size: 0,
                queue_capacity: 16,
            },
            Arc::new(TracingLogger),
        )
        .unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_rejects_inconsistent_config() {
        let config = WorkerPoolConfig {
            initial_size: 5,
            max_size: 2,
            ..WorkerPoolConfig::default()
        };
        assert!(matches!(
            WorkerPool::new(config, Arc::new(TracingLogger)),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_initial_workers_start_idle() {
        let pool = pool(3, 8);

        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn test_grows_to_max_then_queues() {
        // Arrange
        let pool = pool(1, 2);
        let mut fixture = Fixture::new();
        let (tx, rx) = mpsc::channel();

        // Act
        for _ in 0..3 {
            pool.add_connection_handler(fixture.handler(&tx)).unwrap();
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Assert
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.busy_count(), 2);
        assert_eq!(pool.queued_count(), 1);

        pool.stop_connection_handlers(TEST_HANDLER, None);
        let redistributions = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(redistributions, 1);
        pool.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_shutdown_releases_a_caller_waiting_for_queue_space() {
        // Arrange: one busy worker and a full queue.
        let pool = Arc::new(
            WorkerPool::new(
                WorkerPoolConfig {
                    initial_size: 0,
                    max_size: 1,
                    idle_page_size: 0,
                    queue_capacity: 1,
                },
                Arc::new(TracingLogger),
            )
            .unwrap(),
        );
        let mut fixture = Fixture::new();
        let (tx, rx) = mpsc::channel();
        pool.add_connection_handler(fixture.handler(&tx)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.add_connection_handler(fixture.handler(&tx)).unwrap();
        let blocked = fixture.handler(&tx);
        let waiting = Arc::clone(&pool);
        let caller = thread::spawn(move || waiting.add_connection_handler(blocked));
        thread::sleep(Duration::from_millis(100));
        assert!(!caller.is_finished());

        // Act
        pool.shutdown(Duration::from_secs(2));

        // Assert
        assert!(matches!(caller.join().unwrap(), Err(PoolError::ShutDown)));
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn test_stop_targets_a_single_worker() {
        let pool = pool(0, 4);
        let mut fixture = Fixture::new();
        let (tx, rx) = mpsc::channel();
        pool.add_connection_handler(fixture.handler(&tx)).unwrap();
        pool.add_connection_handler(fixture.handler(&tx)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let (first, _) = pool.busy_workers()[0];

        let stopped = pool.stop_connection_handlers(TEST_HANDLER, Some(first));

        assert_eq!(stopped, 1);
        wait_until(|| pool.busy_count() == 1);
        assert_eq!(pool.stop_connection_handlers(HandlerType("other"), None), 0);
        pool.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_failing_and_panicking_handlers_leave_worker_usable() {
        // Arrange
        let pool = pool(1, 1);
        let mut fixture = Fixture::new();
        let (tx, rx) = mpsc::channel();
        let failing = Box::new(WaitingHandler {
            core: HandlerCore::new(fixture.endpoint()),
            started: tx.clone(),
            fail: true,
            panic: false,
        });
        let panicking_endpoint = fixture.endpoint();
        let panicking = Box::new(WaitingHandler {
            core: HandlerCore::new(Arc::clone(&panicking_endpoint)),
            started: tx.clone(),
            fail: false,
            panic: true,
        });

        // Act
        pool.add_connection_handler(failing).unwrap();
        pool.add_connection_handler(panicking).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        wait_until(|| pool.idle_count() == 1);

        // Assert
        assert!(panicking_endpoint.is_closed());
        pool.add_connection_handler(fixture.handler(&tx)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.busy_count(), 1);
        pool.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_idle_workers_are_trimmed() {
        let pool = pool(0, 4);
        let mut fixture = Fixture::new();
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            pool.add_connection_handler(fixture.handler(&tx)).unwrap();
        }
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        pool.stop_connection_handlers(TEST_HANDLER, None);

        wait_until(|| pool.worker_count() == 0);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.trim_idle(), 0);
    }

    #[test]
    fn test_shutdown_closes_queued_endpoints_and_refuses_new_work() {
        // Arrange
        let pool = pool(0, 1);
        let mut fixture = Fixture::new();
        let (tx, rx) = mpsc::channel();
        pool.add_connection_handler(fixture.handler(&tx)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let queued_endpoint = fixture.endpoint();
        pool.add_connection_handler(Box::new(WaitingHandler {
            core: HandlerCore::new(Arc::clone(&queued_endpoint)),
            started: tx.clone(),
            fail: false,
            panic: false,
        }))
        .unwrap();

        // Act
        pool.shutdown(Duration::from_secs(2));

        // Assert
        assert!(queued_endpoint.is_closed());
        assert_eq!(pool.busy_count(), 0);
        assert_eq!(pool.worker_count(), 0);
        let late = fixture.handler(&tx);
        let late_endpoint = Arc::clone(late.endpoint());
        assert!(matches!(pool.add_connection_handler(late), Err(PoolError::ShutDown)));
        assert!(late_endpoint.is_closed());
    }

    #[test]
    fn test_shareable_handlers_are_counted() {
        struct Shareable(HandlerCore);
        impl ConnectionHandler for Shareable {
            fn handler_type(&self) -> HandlerType {
                TEST_HANDLER
            }
            fn capability(&self) -> HandlerCapability {
                HandlerCapability::Shareable
            }
            fn core(&self) -> &HandlerCore {
                &self.0
            }
            fn handle(&mut self) -> Result<(), HandlerError> {
                Ok(())
            }
        }

        let pool = pool(1, 1);
        let mut fixture = Fixture::new();

        pool.add_connection_handler(Box::new(Shareable(HandlerCore::new(fixture.endpoint()))))
            .unwrap();

        assert_eq!(pool.shareable_count(), 1);
        wait_until(|| pool.idle_count() == 1);
    }
}
