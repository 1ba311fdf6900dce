//! Cross-thread event queue.
//!
//! The equeue moves readiness notifications from event-loop threads to the
//! single dispatcher. Each participating thread registers once for a
//! [`ModuleToken`] and gets its own bounded ring; the dispatcher holds the
//! process-wide [`SchedulerToken`] and drains every ring with round-robin
//! fairness. Ring slots are published lock-free; mutex/condvar pairs are
//! reserved for the full/empty blocking transitions.
//!
//! A full ring blocks its producer inside [`Equeue::put`]. That is the
//! system's sole backpressure mechanism: a slow dispatcher stalls the
//! event loops instead of growing an unbounded backlog.

mod ring;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::pipe::PipeHandle;

use ring::SingleWriterRing;

/// Smallest per-token ring capacity.
pub const MIN_QUEUE_SIZE: usize = 2;

/// Largest per-token ring capacity.
pub const MAX_QUEUE_SIZE: usize = 65_536;

/// Maximum number of module tokens alive at once.
pub const MAX_TOKENS: usize = 1_024;

/// Interval at which blocked participants recheck kill flags.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Identifies one posted offload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffloadTicket(pub u64);

impl fmt::Display for OffloadTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OffloadTicket({})", self.0)
    }
}

/// One queued notification.
#[derive(Debug)]
pub enum Event {
    /// A transport accepted a new request: the request's input end and the
    /// response's output end, ready for scheduling.
    Io {
        /// Pipe end the request body is read from.
        input: PipeHandle,
        /// Pipe end the response is written into.
        output: PipeHandle,
    },
    /// An offloaded task fragment finished on the async pool.
    Task(OffloadTicket),
}

/// Errors raised by the event queue
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EqueueError {
    /// The queue was killed; no further events flow
    #[error("Event queue is shut down")]
    Shutdown,

    /// A scheduler token is already alive
    #[error("A scheduler token already exists")]
    DispatcherExists,

    /// The module token table is exhausted
    #[error("No more module tokens available")]
    TokenExhausted,
}

/// Per-token state: the ring plus the producer-side blocking machinery.
struct TokenQueue {
    ring: SingleWriterRing<Event>,
    space_lock: Mutex<()>,
    space: Condvar,
    producer_waiting: AtomicBool,
}

impl TokenQueue {
    fn new(capacity: usize) -> Self {
        Self {
            ring: SingleWriterRing::new(capacity),
            space_lock: Mutex::new(()),
            space: Condvar::new(),
            producer_waiting: AtomicBool::new(false),
        }
    }

    fn notify_space(&self) {
        if self.producer_waiting.load(Ordering::Acquire) {
            let _guard = self
                .space_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.space.notify_all();
        }
    }
}

/// A producer's registration with the queue.
///
/// Deliberately neither `Clone` nor `Copy`: `put` takes the token by
/// unique borrow, which pins each ring to a single writer at a time.
pub struct ModuleToken {
    queue: Arc<TokenQueue>,
}

impl fmt::Debug for ModuleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleToken")
            .field("capacity", &self.queue.ring.capacity())
            .finish_non_exhaustive()
    }
}

/// The dispatcher's registration; at most one exists at a time.
///
/// Dropping the token releases the dispatcher seat for a successor.
pub struct SchedulerToken {
    cursor: usize,
    seat: Arc<AtomicBool>,
}

impl fmt::Debug for SchedulerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerToken")
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl Drop for SchedulerToken {
    fn drop(&mut self) {
        self.seat.store(false, Ordering::Release);
    }
}

/// The cross-thread event queue.
pub struct Equeue {
    queues: RwLock<Vec<Arc<TokenQueue>>>,
    /// True while a `SchedulerToken` is alive.
    seat: Arc<AtomicBool>,
    dispatcher_waiting: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
    killed: AtomicBool,
}

impl Default for Equeue {
    fn default() -> Self {
        Self::new()
    }
}

impl Equeue {
    /// Creates an empty queue with no registered participants.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(Vec::new()),
            seat: Arc::new(AtomicBool::new(false)),
            dispatcher_waiting: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            killed: AtomicBool::new(false),
        }
    }

    /// Registers a producer and allocates its ring.
    ///
    /// `size` is clamped to `[MIN_QUEUE_SIZE, MAX_QUEUE_SIZE]` and rounded
    /// up to the next power of two; the capacity is then fixed for the
    /// token's lifetime.
    ///
    /// # Errors
    ///
    /// [`EqueueError::TokenExhausted`] once [`MAX_TOKENS`] rings exist,
    /// [`EqueueError::Shutdown`] after [`kill`](Self::kill).
    pub fn module_token(&self, size: usize) -> Result<ModuleToken, EqueueError> {
        if self.killed.load(Ordering::Acquire) {
            return Err(EqueueError::Shutdown);
        }
        let capacity = size
            .clamp(MIN_QUEUE_SIZE, MAX_QUEUE_SIZE)
            .next_power_of_two();

        let mut queues = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if queues.len() >= MAX_TOKENS {
            return Err(EqueueError::TokenExhausted);
        }
        let queue = Arc::new(TokenQueue::new(capacity));
        queues.push(Arc::clone(&queue));
        tracing::trace!(capacity, tokens = queues.len(), "Issued module token");
        Ok(ModuleToken { queue })
    }

    /// Claims the dispatcher seat.
    ///
    /// # Errors
    ///
    /// [`EqueueError::DispatcherExists`] while another token is alive.
    pub fn scheduler_token(&self) -> Result<SchedulerToken, EqueueError> {
        if self
            .seat
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EqueueError::DispatcherExists);
        }
        Ok(SchedulerToken {
            cursor: 0,
            seat: Arc::clone(&self.seat),
        })
    }

    /// Appends one event to the token's ring.
    ///
    /// Blocks while the ring is full; a parked producer is the intended
    /// backpressure on a slow dispatcher.
    ///
    /// # Errors
    ///
    /// [`EqueueError::Shutdown`] once the queue is killed; the event is
    /// dropped in that case.
    pub fn put(&self, token: &mut ModuleToken, event: Event) -> Result<(), EqueueError> {
        let queue = &token.queue;
        let mut event = event;
        loop {
            if self.killed.load(Ordering::Acquire) {
                return Err(EqueueError::Shutdown);
            }
            match queue.ring.try_push(event) {
                Ok(()) => break,
                Err(back) => {
                    event = back;
                    self.park_producer(queue);
                }
            }
        }

        if self.dispatcher_waiting.load(Ordering::Acquire) {
            let _guard = self
                .wake_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.wake.notify_all();
        }
        Ok(())
    }

    /// Removes the next event, blocking while every ring is empty.
    ///
    /// Rings are polled round-robin starting just past the ring the last
    /// event came from, so a chatty producer cannot starve the others.
    ///
    /// # Errors
    ///
    /// [`EqueueError::Shutdown`] once the queue is killed and drained.
    pub fn take(&self, token: &mut SchedulerToken) -> Result<Event, EqueueError> {
        loop {
            if let Some(event) = self.poll(token) {
                return Ok(event);
            }
            if self.killed.load(Ordering::Acquire) {
                return Err(EqueueError::Shutdown);
            }
            self.park_dispatcher();
        }
    }

    /// True when no ring holds an event. Non-blocking snapshot.
    #[must_use]
    pub fn empty(&self, _token: &SchedulerToken) -> bool {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|q| q.ring.is_empty())
    }

    /// Blocks until some ring holds an event, the queue is killed, or the
    /// caller's cooperative `killed` flag is raised.
    ///
    /// The flag is rechecked at a bounded interval, guaranteeing a
    /// response within well under 100ms of the flag being set.
    pub fn wait(&self, token: &SchedulerToken, killed: &AtomicBool) {
        while self.empty(token)
            && !killed.load(Ordering::Acquire)
            && !self.killed.load(Ordering::Acquire)
        {
            self.park_dispatcher();
        }
    }

    /// Shuts the queue down: parked producers and the dispatcher unblock
    /// with [`EqueueError::Shutdown`] on their next attempt.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        {
            let _guard = self
                .wake_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.wake.notify_all();
        }
        for queue in self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            let _guard = queue
                .space_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.space.notify_all();
        }
        tracing::debug!("Event queue killed");
    }

    /// True after [`kill`](Self::kill).
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    fn poll(&self, token: &mut SchedulerToken) -> Option<Event> {
        let queues = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let count = queues.len();
        if count == 0 {
            return None;
        }
        for offset in 0..count {
            let index = (token.cursor + offset) % count;
            if let Some(event) = queues[index].ring.try_pop() {
                token.cursor = index + 1;
                queues[index].notify_space();
                return Some(event);
            }
        }
        None
    }

    fn park_producer(&self, queue: &TokenQueue) {
        queue.producer_waiting.store(true, Ordering::Release);
        let guard = queue
            .space_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Recheck under the lock: the dispatcher may have drained the ring
        // between our failed push and the park.
        if queue.ring.len() == queue.ring.capacity() && !self.killed.load(Ordering::Acquire) {
            let _ = queue
                .space
                .wait_timeout(guard, KILL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
        }
        queue.producer_waiting.store(false, Ordering::Release);
    }

    fn park_dispatcher(&self) {
        self.dispatcher_waiting.store(true, Ordering::Release);
        let guard = self
            .wake_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let all_empty = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|q| q.ring.is_empty());
        if all_empty && !self.killed.load(Ordering::Acquire) {
            let _ = self
                .wake
                .wait_timeout(guard, KILL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.dispatcher_waiting.store(false, Ordering::Release);
    }
}
