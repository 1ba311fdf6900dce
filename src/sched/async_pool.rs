//! Async offload pool.
//!
//! A fixed set of worker threads runs the `execute` fragment of offloaded
//! tasks so scheduler workers stay on the fast path. Jobs enter through a
//! bounded injection queue; a full queue rejects the submit with
//! `Saturated` and the scheduler fails the owning request like any other
//! task error. Each worker holds its own equeue module token and posts
//! exactly one `Event::Task` per finished job; the completion record waits
//! in the pool until the dispatcher claims it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fxhash::FxHashMap;

use crate::equeue::{Equeue, Event, ModuleToken, OffloadTicket};
use crate::runtime::{AsyncCompanion, ServletError};

use super::error::OffloadError;

/// Interval at which idle workers recheck the kill flag.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Async pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct AsyncPoolConfig {
    /// Worker threads running `execute` fragments.
    pub workers: usize,
    /// Injection queue bound; a full queue saturates `submit`.
    pub queue_capacity: usize,
}

impl Default for AsyncPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 128,
        }
    }
}

struct Job {
    ticket: OffloadTicket,
    companion: Box<dyn AsyncCompanion>,
}

/// A finished offload, waiting for the dispatcher.
pub(super) struct Completion {
    pub companion: Box<dyn AsyncCompanion>,
    pub result: Result<(), ServletError>,
}

struct PoolShared {
    jobs: Mutex<VecDeque<Job>>,
    capacity: usize,
    job_ready: Condvar,
    killed: AtomicBool,
    completions: Mutex<FxHashMap<OffloadTicket, Completion>>,
    next_ticket: AtomicU64,
}

/// The async offload pool.
pub struct AsyncPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncPool {
    /// Starts the worker threads.
    ///
    /// Every worker registers its own module token with `equeue` up front.
    ///
    /// # Errors
    ///
    /// [`OffloadError::Equeue`] when the queue cannot issue a token per
    /// worker, [`OffloadError::SpawnFailed`] when the OS refuses a thread.
    pub fn start(config: AsyncPoolConfig, equeue: Arc<Equeue>) -> Result<Arc<Self>, OffloadError> {
        let shared = Arc::new(PoolShared {
            jobs: Mutex::new(VecDeque::new()),
            capacity: config.queue_capacity.max(1),
            job_ready: Condvar::new(),
            killed: AtomicBool::new(false),
            completions: Mutex::new(FxHashMap::default()),
            next_ticket: AtomicU64::new(1),
        });

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for index in 0..config.workers.max(1) {
            let token = equeue.module_token(config.queue_capacity)?;
            let shared = Arc::clone(&shared);
            let equeue = Arc::clone(&equeue);
            workers.push(
                thread::Builder::new()
                    .name(format!("async-worker-{index}"))
                    .spawn(move || worker_loop(&shared, &equeue, token))
                    .map_err(|e| OffloadError::SpawnFailed {
                        index,
                        message: e.to_string(),
                    })?,
            );
        }

        Ok(Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        }))
    }

    /// Posts one prepared companion for background execution.
    ///
    /// # Errors
    ///
    /// [`OffloadError::Saturated`] when the injection queue is full,
    /// [`OffloadError::Terminated`] after shutdown.
    pub fn submit(&self, companion: Box<dyn AsyncCompanion>) -> Result<OffloadTicket, OffloadError> {
        if self.shared.killed.load(Ordering::Acquire) {
            return Err(OffloadError::Terminated);
        }
        let ticket = OffloadTicket(self.shared.next_ticket.fetch_add(1, Ordering::Relaxed));
        {
            let mut jobs = self
                .shared
                .jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if jobs.len() >= self.shared.capacity {
                return Err(OffloadError::Saturated);
            }
            jobs.push_back(Job { ticket, companion });
        }
        self.shared.job_ready.notify_one();
        tracing::trace!(%ticket, "Posted offload job");
        Ok(ticket)
    }

    /// Claims the completion record for a finished job.
    pub(super) fn take_completion(&self, ticket: OffloadTicket) -> Option<Completion> {
        self.shared
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ticket)
    }

    /// Number of completion records not yet claimed.
    #[must_use]
    pub fn pending_completions(&self) -> usize {
        self.shared
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops the workers and joins them. Unstarted jobs are dropped.
    pub fn shutdown(&self) {
        self.shared.killed.store(true, Ordering::Release);
        self.shared.job_ready.notify_all();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("Async worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(shared: &PoolShared, equeue: &Equeue, mut token: ModuleToken) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(job) = jobs.pop_front() {
                    break Some(job);
                }
                if shared.killed.load(Ordering::Acquire) {
                    break None;
                }
                let (guard, _) = shared
                    .job_ready
                    .wait_timeout(jobs, KILL_POLL_INTERVAL)
                    .unwrap_or_else(PoisonError::into_inner);
                jobs = guard;
            }
        };
        let Some(mut job) = job else {
            return;
        };

        // The slow fragment runs without the queue lock held.
        let result = job.companion.execute();
        if let Err(error) = &result {
            tracing::warn!(ticket = %job.ticket, %error, "Offloaded fragment failed");
        }

        shared
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                job.ticket,
                Completion {
                    companion: job.companion,
                    result,
                },
            );

        if equeue.put(&mut token, Event::Task(job.ticket)).is_err() {
            // Queue already killed; the dispatcher is gone and the
            // completion record will be dropped with the pool.
            tracing::debug!(ticket = %job.ticket, "Dropping completion signal after equeue shutdown");
        }
    }
}
