//! Outbound reply path.
//!
//! Worker threads never touch a socket. A reply is pushed onto the owning
//! session's [`Outbound`] queue, and the reactor is woken to flush it.

use crate::error::ReplyError;
use crate::message::{Packer, StructuredMessage};
use crate::protocols::frame::MAX_BODY_LEN;
use bytes::Bytes;
use crossbeam_channel::Sender;
use mio::Waker;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Wakes the reactor for a connection whose queue became non-empty.
#[derive(Clone)]
pub(crate) struct Notifier {
    ready: Sender<usize>,
    waker: Arc<Waker>,
}

impl Notifier {
    pub(crate) fn new(ready: Sender<usize>, waker: Arc<Waker>) -> Self {
        Self { ready, waker }
    }

    fn notify(&self, conn_id: usize) {
        // The reactor may already be gone during shutdown; nothing to do then.
        if self.ready.send(conn_id).is_ok() {
            if let Err(e) = self.waker.wake() {
                warn!(conn_id, error = %e, "Failed to wake reactor");
            }
        }
    }
}

/// Per-connection outbound queue shared between workers and the reactor.
///
/// Payloads are stored unframed; the session frames each one when it is
/// written.
pub(crate) struct Outbound {
    conn_id: usize,
    peer: SocketAddr,
    queue: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
    notifier: Option<Notifier>,
}

impl Outbound {
    pub(crate) fn new(conn_id: usize, peer: SocketAddr, notifier: Option<Notifier>) -> Self {
        Self {
            conn_id,
            peer,
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            notifier,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, payload: Bytes) -> Result<(), ReplyError> {
        if payload.len() > MAX_BODY_LEN {
            return Err(ReplyError::PayloadTooLarge(payload.len()));
        }

        let was_empty = {
            let mut queue = self.lock();
            // Checked under the lock so a concurrent close cannot strand the payload.
            if self.closed.load(Ordering::Acquire) {
                return Err(ReplyError::SessionClosed);
            }
            let was_empty = queue.is_empty();
            queue.push_back(payload);
            was_empty
        };

        if was_empty {
            if let Some(notifier) = &self.notifier {
                notifier.notify(self.conn_id);
            }
        }
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<Bytes> {
        self.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Mark closed and discard anything still queued.
    pub(crate) fn close(&self) {
        let mut queue = self.lock();
        self.closed.store(true, Ordering::Release);
        if !queue.is_empty() {
            debug!(conn_id = self.conn_id, dropped = queue.len(), "Discarding queued replies");
            queue.clear();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Handle for queueing raw reply payloads on one session.
#[derive(Clone)]
pub struct ReplyHandle {
    outbound: Arc<Outbound>,
}

impl ReplyHandle {
    pub(crate) fn new(outbound: Arc<Outbound>) -> Self {
        Self { outbound }
    }

    /// Queue a payload for transmission. The header is added on write.
    ///
    /// Replies are sent in the order they are queued. On a closed session the
    /// payload is discarded and [`ReplyError::SessionClosed`] is returned.
    pub fn enqueue_reply(&self, payload: impl Into<Bytes>) -> Result<(), ReplyError> {
        self.outbound.push(payload.into())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.outbound.peer
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("conn_id", &self.outbound.conn_id)
            .field("peer", &self.outbound.peer)
            .field("closed", &self.outbound.is_closed())
            .finish()
    }
}

/// Reply route handed to the injection sink.
///
/// Packs structured replies with the listener's packer and queues them on
/// the connection the request arrived on.
#[derive(Clone)]
pub struct ReplySender {
    handle: ReplyHandle,
    packer: Arc<dyn Packer>,
}

impl ReplySender {
    pub fn new(handle: ReplyHandle, packer: Arc<dyn Packer>) -> Self {
        Self { handle, packer }
    }

    /// Pack `message` and queue it for the originating connection.
    pub fn send_back(&self, message: &StructuredMessage) -> Result<(), ReplyError> {
        let payload = self.packer.encode(message)?;
        debug!(peer = %self.handle.peer_addr(), len = payload.len(), "Queueing reply");
        self.handle.enqueue_reply(payload)
    }

    /// Queue an already-packed payload.
    pub fn send_raw(&self, payload: impl Into<Bytes>) -> Result<(), ReplyError> {
        self.handle.enqueue_reply(payload)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl std::fmt::Debug for ReplySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySender")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
