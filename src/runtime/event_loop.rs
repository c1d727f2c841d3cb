//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS.
//!
//! One reactor thread owns the listening socket and every session. Complete
//! frames are handed to the worker pool; replies come back through each
//! session's outbound queue and a [`Waker`].
//!
//! ## Lifecycle
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. A supervisor
//! thread keeps (re)binding after I/O failures with a capped back-off until
//! [`Listener::stop`] is called.

use crate::config::Config;
use crate::error::PoolError;
use crate::message::{InjectionSink, Packer};
use crate::protocols::frame::RequestHandler;
use crate::runtime::reply::{Notifier, Outbound, ReplySender};
use crate::runtime::session::{Session, WriteOutcome};
use crate::runtime::WorkerPool;
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const LISTEN_BACKLOG: i32 = 1024;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Listener lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct LifecycleInner {
    state: LifecycleState,
    local_addr: Option<SocketAddr>,
    waker: Option<Arc<Waker>>,
}

/// State machine shared by the host-facing handle and the reactor thread.
struct Lifecycle {
    inner: Mutex<LifecycleInner>,
    changed: Condvar,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                state: LifecycleState::Stopped,
                local_addr: None,
                waker: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> LifecycleState {
        self.lock().state
    }

    fn stop_requested(&self) -> bool {
        self.state() == LifecycleState::Stopping
    }

    /// Starting -> Running. Fails if a stop arrived while binding.
    fn mark_running(&self, local_addr: SocketAddr, waker: Arc<Waker>) -> bool {
        let mut inner = self.lock();
        if inner.state != LifecycleState::Starting {
            return false;
        }
        inner.state = LifecycleState::Running;
        inner.local_addr = Some(local_addr);
        inner.waker = Some(waker);
        self.changed.notify_all();
        true
    }

    /// Running -> Starting after the reactor failed. Returns whether it had
    /// been running.
    fn mark_restarting(&self) -> bool {
        let mut inner = self.lock();
        inner.local_addr = None;
        inner.waker = None;
        if inner.state == LifecycleState::Running {
            inner.state = LifecycleState::Starting;
            self.changed.notify_all();
            return true;
        }
        false
    }

    fn mark_stopped(&self) {
        let mut inner = self.lock();
        inner.state = LifecycleState::Stopped;
        inner.local_addr = None;
        inner.waker = None;
        self.changed.notify_all();
    }

    /// Sleep up to `timeout`, returning early with `true` on a stop request.
    fn wait_for_stop(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let (inner, _) = self
            .changed
            .wait_timeout_while(inner, timeout, |i| i.state != LifecycleState::Stopping)
            .unwrap_or_else(PoisonError::into_inner);
        inner.state == LifecycleState::Stopping
    }
}

/// Everything the reactor thread needs, shared with the host handle.
struct ListenerShared {
    config: Config,
    pool: WorkerPool,
    packer: Arc<dyn Packer>,
    sink: Arc<dyn InjectionSink>,
    lifecycle: Lifecycle,
}

/// ISO-8583 TCP listener.
///
/// Owns the worker pool and the reactor thread. Dropping the listener stops
/// it and shuts the pool down.
pub struct Listener {
    shared: Arc<ListenerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(config: Config, packer: Arc<dyn Packer>, sink: Arc<dyn InjectionSink>) -> Self {
        let pool = WorkerPool::new(config.pool);
        Self {
            shared: Arc::new(ListenerShared {
                config,
                pool,
                packer,
                sink,
                lifecycle: Lifecycle::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start listening on a background reactor thread.
    ///
    /// Returns once the thread is running; binding happens there and is
    /// retried on failure. Does nothing unless the listener is stopped.
    ///
    /// A listen address that cannot be parsed fails here with
    /// `InvalidInput` and leaves the listener stopped.
    pub fn start(&self) -> io::Result<()> {
        if let Err(e) = self.shared.config.listen_addr() {
            error!(host = %self.shared.config.host, error = %e, "Invalid listen address");
            return Err(io::Error::new(io::ErrorKind::InvalidInput, e));
        }

        let mut thread_slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut inner = self.shared.lifecycle.lock();
            if inner.state != LifecycleState::Stopped {
                warn!(state = ?inner.state, "Listener already started");
                return Ok(());
            }
            inner.state = LifecycleState::Starting;
        }

        // Reap a supervisor from a previous run.
        if let Some(handle) = thread_slot.take() {
            let _ = handle.join();
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("iso8583-reactor".to_string())
            .spawn(move || supervise(&shared));

        match spawned {
            Ok(handle) => {
                *thread_slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.lifecycle.mark_stopped();
                Err(e)
            }
        }
    }

    /// Stop listening and force-close every connection.
    ///
    /// In-flight worker tasks are not waited for; their replies are
    /// discarded. Calling this on a stopped listener is a no-op.
    pub fn stop(&self) {
        let waker = {
            let mut inner = self.shared.lifecycle.lock();
            match inner.state {
                LifecycleState::Starting | LifecycleState::Running => {
                    info!("Stopping listener");
                    inner.state = LifecycleState::Stopping;
                    self.shared.lifecycle.changed.notify_all();
                    inner.waker.clone()
                }
                LifecycleState::Stopping | LifecycleState::Stopped => None,
            }
        };

        if let Some(waker) = waker {
            if let Err(e) = waker.wake() {
                error!(error = %e, "Failed to wake reactor for shutdown");
            }
        }

        self.join();
    }

    /// Block until the reactor thread exits.
    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Reactor thread panicked");
                self.shared.lifecycle.mark_stopped();
            }
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lifecycle.lock().local_addr
    }

    /// Wait until the listener is running and return its bound address.
    pub fn await_running(&self, timeout: Duration) -> Option<SocketAddr> {
        let lifecycle = &self.shared.lifecycle;
        let inner = lifecycle.lock();
        let (inner, _) = lifecycle
            .changed
            .wait_timeout_while(inner, timeout, |i| {
                matches!(i.state, LifecycleState::Starting) && i.local_addr.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            LifecycleState::Running => inner.local_addr,
            _ => None,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
        self.shared.pool.shutdown();
    }
}

/// Reactor thread body: keep serving until a stop is requested.
fn supervise(shared: &ListenerShared) {
    let max_backoff = shared.config.retry_backoff_max.max(INITIAL_BACKOFF);
    let mut backoff = INITIAL_BACKOFF;

    while !shared.lifecycle.stop_requested() {
        match serve(shared) {
            Ok(()) => break,
            Err(e) => {
                if shared.lifecycle.mark_restarting() {
                    backoff = INITIAL_BACKOFF;
                }
                error!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Server IO error");
                if shared.lifecycle.wait_for_stop(backoff) {
                    break;
                }
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }

    shared.lifecycle.mark_stopped();
    info!("Server stopped");
}

/// Bind, run the event loop until stopped, then tear everything down.
fn serve(shared: &ListenerShared) -> io::Result<()> {
    let addr = shared
        .config
        .listen_addr()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    info!(addr = %addr, "Starting server");

    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let mut listener = TcpListener::from_std(create_listener(addr)?);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let local_addr = listener.local_addr()?;

    let (ready_tx, ready_rx) = unbounded();
    let mut reactor = Reactor {
        shared,
        poll,
        listener,
        sessions: Slab::with_capacity(shared.config.max_connections.min(1024)),
        notifier: Notifier::new(ready_tx, Arc::clone(&waker)),
        ready: ready_rx,
        backlog: Vec::new(),
    };

    if !shared.lifecycle.mark_running(local_addr, waker) {
        reactor.shutdown();
        return Ok(());
    }

    info!(addr = %local_addr, "ISO8583 server started");
    let result = reactor.run();
    reactor.shutdown();
    result
}

/// Create the listening socket with address reuse so restarts can rebind.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

struct Reactor<'a> {
    shared: &'a ListenerShared,
    poll: Poll,
    listener: TcpListener,
    sessions: Slab<Session<TcpStream>>,
    notifier: Notifier,
    /// Connections whose outbound queue became non-empty.
    ready: Receiver<usize>,
    /// Connections that used their read budget with bytes possibly left.
    backlog: Vec<usize>,
}

impl Reactor<'_> {
    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.shared.config.event_capacity);

        loop {
            trace!("Waiting for events");
            // Leftover reads must not wait for a new edge.
            let timeout = (!self.backlog.is_empty()).then_some(Duration::ZERO);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => self.flush_ready(),
                    Token(conn_id) => self.handle_connection_event(conn_id, event),
                }
            }

            for conn_id in std::mem::take(&mut self.backlog) {
                self.resume_read(conn_id);
            }

            if self.shared.lifecycle.stop_requested() {
                return Ok(());
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.accept(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn accept(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        info!(peer = %peer, "Connection made");

        let allow_list = &self.shared.config.allow_list;
        if !allow_list.permits(peer.ip()) {
            warn!(peer = %peer, "Closed connection made from unknown host");
            return;
        }

        if self.sessions.len() >= self.shared.config.max_connections {
            warn!(peer = %peer, "Connection limit reached");
            return;
        }

        let entry = self.sessions.vacant_entry();
        let conn_id = entry.key();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(conn_id), Interest::READABLE)
        {
            error!(peer = %peer, error = %e, "Failed to register connection");
            return;
        }

        let outbound = Arc::new(Outbound::new(conn_id, peer, Some(self.notifier.clone())));
        entry.insert(Session::new(
            stream,
            peer,
            self.shared.config.framing,
            outbound,
        ));

        debug!(conn_id, peer = %peer, "Accepted connection");
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &mio::event::Event) {
        if !self.sessions.contains(conn_id) {
            return;
        }

        if event.is_readable() {
            if let Err(e) = self.handle_readable(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id);
                return;
            }
        }

        // Re-check connection exists (may have been removed)
        if !self.sessions.contains(conn_id) {
            return;
        }

        if event.is_writable() {
            if let Err(e) = self.flush(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id);
            }
        }
    }

    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return Ok(());
        };

        let outcome = session.on_readable()?;
        let reply = session.reply_handle();

        for frame in outcome.frames {
            self.dispatch(frame, ReplySender::new(reply.clone(), Arc::clone(&self.shared.packer)));
        }

        if outcome.eof {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed by peer"));
        }
        if outcome.more && !self.backlog.contains(&conn_id) {
            self.backlog.push(conn_id);
        }
        Ok(())
    }

    fn resume_read(&mut self, conn_id: usize) {
        if !self.sessions.contains(conn_id) {
            return;
        }
        if let Err(e) = self.handle_readable(conn_id) {
            debug!(conn_id, error = %e, "Connection error");
            self.close_connection(conn_id);
        }
    }

    /// Hand a frame to the worker pool. Never blocks; a saturated pool drops it.
    fn dispatch(&self, frame: Bytes, reply: ReplySender) {
        let peer = reply.peer_addr();
        let len = frame.len();
        let handler = RequestHandler::new(
            frame,
            reply,
            Arc::clone(&self.shared.packer),
            Arc::clone(&self.shared.sink),
        );

        let submitted = self.shared.pool.submit(move || {
            if let Err(e) = handler.run() {
                error!(peer = %peer, len, error = %e, "Request handler failed, message dropped");
            }
        });

        match submitted {
            Ok(()) => {}
            Err(PoolError::Overloaded) => {
                error!(peer = %peer, "Worker pool has reached the maximum capacity, dropping frame");
            }
            Err(e) => error!(peer = %peer, error = %e, "Could not dispatch frame"),
        }
    }

    /// Flush sessions whose queues were filled by workers.
    fn flush_ready(&mut self) {
        let ready: Vec<usize> = self.ready.try_iter().collect();
        for conn_id in ready {
            if !self.sessions.contains(conn_id) {
                continue;
            }
            if let Err(e) = self.flush(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id);
            }
        }
    }

    /// Write what can be written; keep WRITABLE interest only while blocked.
    fn flush(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return Ok(());
        };

        let want_writable = session.on_writable()? == WriteOutcome::Blocked;
        if want_writable != session.write_interest {
            let interest = if want_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.poll
                .registry()
                .reregister(session.stream_mut(), Token(conn_id), interest)?;
            session.write_interest = want_writable;
        }
        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut session) = self.sessions.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(session.stream_mut());
            info!(conn_id, peer = %session.peer_addr(), "Connection closed");
        }
    }

    /// Close the listening socket and force-close every session.
    fn shutdown(&mut self) {
        let _ = self.poll.registry().deregister(&mut self.listener);

        let ids: Vec<usize> = self.sessions.iter().map(|(id, _)| id).collect();
        for conn_id in ids {
            if let Some(session) = self.sessions.get(conn_id) {
                info!(conn_id, peer = %session.peer_addr(), "Closing socket");
            }
            self.close_connection(conn_id);
        }
        debug!("Reactor shut down");
    }
}
