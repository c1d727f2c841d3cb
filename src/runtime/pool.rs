//! Bounded worker pool for decode-and-dispatch tasks.
//!
//! Threads are started on demand: up to `core_threads` before anything is
//! queued, then up to `max_threads` once the queue is full. Threads above the
//! core count retire after `keep_alive` without work. Submission never
//! blocks; a saturated pool rejects the task with [`PoolError::Overloaded`].

use crate::error::PoolError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Resolved pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub core_threads: usize,
    pub max_threads: usize,
    pub keep_alive: Duration,
    pub queue_len: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_threads: 4,
            max_threads: 16,
            keep_alive: Duration::from_secs(60),
            queue_len: 1024,
        }
    }
}

impl PoolConfig {
    /// Clamp to a usable shape: at least one thread, and max not below core.
    fn normalized(mut self) -> Self {
        if self.max_threads == 0 {
            warn!("max_threads of 0 is not usable, using 1");
            self.max_threads = 1;
        }
        if self.max_threads < self.core_threads {
            warn!(
                core = self.core_threads,
                max = self.max_threads,
                "max_threads below core_threads, raising max_threads"
            );
            self.max_threads = self.core_threads;
        }
        self
    }
}

struct PoolShared {
    config: PoolConfig,
    live: AtomicUsize,
    next_id: AtomicUsize,
}

impl PoolShared {
    /// Count a new thread if fewer than `limit` are alive.
    fn reserve(&self, limit: usize) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            })
            .is_ok()
    }

    /// Give up an idle thread if the pool is above its core size.
    fn try_retire(&self) -> bool {
        let core = self.config.core_threads;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live > core).then(|| live - 1)
            })
            .is_ok()
    }
}

/// Thread pool with a bounded task queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let config = config.normalized();
        let (sender, receiver) = bounded(config.queue_len);

        debug!(
            core = config.core_threads,
            max = config.max_threads,
            keep_alive_secs = config.keep_alive.as_secs(),
            queue_len = config.queue_len,
            "Worker pool created"
        );

        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            shared: Arc::new(PoolShared {
                config,
                live: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Hand a task to the pool without blocking.
    ///
    /// A rejected task is dropped and never retried.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(PoolError::ShutDown)?;
        let config = &self.shared.config;
        let job: Job = Box::new(task);

        if self.shared.reserve(config.core_threads) {
            return self.spawn_worker(Some(job));
        }

        match sender.try_send(job) {
            Ok(()) => {
                // Core size may be zero; queued work still needs a thread.
                // Pairs with the fence in `retire_idle`.
                fence(Ordering::SeqCst);
                if self.shared.live.load(Ordering::Acquire) == 0
                    && self.shared.reserve(config.max_threads)
                {
                    self.spawn_worker(None)?;
                }
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                if self.shared.reserve(config.max_threads) {
                    self.spawn_worker(Some(job))
                } else {
                    Err(PoolError::Overloaded)
                }
            }
            Err(TrySendError::Disconnected(_)) => Err(PoolError::ShutDown),
        }
    }

    /// A thread slot must already be reserved.
    fn spawn_worker(&self, first: Option<Job>) -> Result<(), PoolError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.receiver.clone();
        let shared = Arc::clone(&self.shared);

        let spawned = thread::Builder::new()
            .name(format!("iso8583-worker-{id}"))
            .spawn(move || worker_loop(id, first, receiver, shared));

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                error!(worker = id, error = %e, "Failed to spawn worker");
                Err(PoolError::Spawn(e))
            }
        }
    }

    /// Stop accepting tasks. Queued tasks still run; idle workers exit.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            debug!("Worker pool shutting down");
        }
    }

    /// Threads currently alive.
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, first: Option<Job>, receiver: Receiver<Job>, shared: Arc<PoolShared>) {
    debug!(worker = id, "Worker started");

    if let Some(job) = first {
        run_job(id, job);
    }

    loop {
        let above_core = shared.live.load(Ordering::Acquire) > shared.config.core_threads;
        let next = if above_core {
            receiver.recv_timeout(shared.config.keep_alive)
        } else {
            receiver.recv().map_err(|_| RecvTimeoutError::Disconnected)
        };

        match next {
            Ok(job) => run_job(id, job),
            Err(RecvTimeoutError::Timeout) => {
                if retire_idle(&shared, &receiver) {
                    debug!(worker = id, "Idle worker retired");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                shared.live.fetch_sub(1, Ordering::AcqRel);
                debug!(worker = id, "Worker stopped");
                return;
            }
        }
    }
}

/// Retire an idle thread above core size.
///
/// A task queued while the count was dropping may have seen this thread as
/// alive and not started another, so the slot is taken back when the queue
/// is not empty.
fn retire_idle(shared: &PoolShared, receiver: &Receiver<Job>) -> bool {
    if !shared.try_retire() {
        return false;
    }
    fence(Ordering::SeqCst);
    if receiver.is_empty() {
        return true;
    }
    !shared.reserve(shared.config.max_threads)
}

fn run_job(id: usize, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(worker = id, "Task panicked");
    }
}
