//! The per-request task scheduler.
//!
//! Each `step()` pops one ready task, wires its outgoing pipes (allocating
//! fresh transport pairs, or forking the target transport for shadow
//! slots), delivers the downstream ends, and runs the task's delegate.
//! Downstream tasks instantiate lazily: the first delivered input creates
//! the task, the last one moves it into the FIFO ready set. A failure
//! anywhere tears down exactly the owning request; every other in-flight
//! request is untouched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::equeue::{Equeue, Event, OffloadTicket, SchedulerToken};
use crate::graph::ServiceGraph;
use crate::pipe::{PipeHandle, PipeParams, PipeTransport};
use crate::runtime::{
    AsyncCompanion, NodeId, ScopeToken, ServletError, SlotId, SlotKind, TaskContext, TaskDelegate,
    TaskOutcome,
};

use super::async_pool::AsyncPool;
use super::error::{OffloadError, TaskError};
use super::request::{Request, RequestId, RequestState};
use super::task::{Task, TaskState};

/// Result of one `step()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// One task was executed (or one failure handled).
    Ran,
    /// The ready set was empty.
    Idle,
}

/// What the dispatcher loop does when the ready set drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    /// Yield and return to polling the queue. Lowest latency.
    #[default]
    Poll,
    /// Park in `equeue.wait` until an event arrives. Lowest wakeup churn.
    Wait,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerConfig {
    /// Idle behavior of the dispatcher loop.
    pub idle_policy: IdlePolicy,
}

/// A task instantiated but still waiting for inputs.
struct PendingTask {
    task: Task,
    filled: usize,
}

/// The per-request task scheduler.
pub struct Scheduler {
    graph: Arc<ServiceGraph>,
    transport: Arc<dyn PipeTransport>,
    pool: Option<Arc<AsyncPool>>,
    config: SchedulerConfig,
    /// FIFO across requests.
    ready: VecDeque<Task>,
    /// Created tasks keyed by (request, node), waiting for inputs.
    pending: FxHashMap<(RequestId, NodeId), PendingTask>,
    /// Tasks parked on the async pool, keyed by their offload ticket.
    suspended: FxHashMap<OffloadTicket, Task>,
    /// Admitted requests. Terminal entries keep only their outcome record
    /// until `retire` claims them; detached entries are removed on drain.
    requests: FxHashMap<RequestId, Request>,
    next_request: u64,
}

impl Scheduler {
    /// Creates a scheduler over a frozen graph.
    #[must_use]
    pub fn new(
        graph: Arc<ServiceGraph>,
        transport: Arc<dyn PipeTransport>,
        pool: Option<Arc<AsyncPool>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            graph,
            transport,
            pool,
            config,
            ready: VecDeque::new(),
            pending: FxHashMap::default(),
            suspended: FxHashMap::default(),
            requests: FxHashMap::default(),
            next_request: 1,
        }
    }

    /// Admits one request: `input` carries the request body into the input
    /// node's single input slot, `output` is parked until the output
    /// node's task instantiates.
    ///
    /// Instantiation failures are recorded on the request; check
    /// [`request_state`](Self::request_state) afterwards. The outcome
    /// record stays queryable until [`retire`](Self::retire) claims it.
    pub fn begin_request(
        &mut self,
        input: PipeHandle,
        output: PipeHandle,
        scope: ScopeToken,
    ) -> RequestId {
        self.admit(input, output, scope, false)
    }

    fn admit(
        &mut self,
        input: PipeHandle,
        output: PipeHandle,
        scope: ScopeToken,
        detached: bool,
    ) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.requests.insert(id, Request::new(scope, output, detached));
        tracing::debug!(request = %id, "Admitted request");

        let (input_node, input_slot) = self.graph.input();
        match self.instantiate_task(id, input_node) {
            Ok(mut task) => {
                task.pipes[input_slot.0 as usize] = Some(input);
                task.state = TaskState::Ready;
                self.ready.push_back(task);
            }
            Err(error) => self.fail_request(id, error),
        }
        id
    }

    /// Executes at most one ready task.
    pub fn step(&mut self) -> Step {
        let Some(mut task) = self.ready.pop_front() else {
            return Step::Idle;
        };
        task.state = TaskState::Running;

        if !task.outputs_wired {
            if let Err(error) = self.wire_outputs(&mut task) {
                self.fail_request(task.request, error);
                return Step::Ran;
            }
        }

        let Some(mut delegate) = task.delegate.take() else {
            self.fail_request(
                task.request,
                TaskError::Internal(format!("task at {} has no delegate", task.node)),
            );
            return Step::Ran;
        };

        let outcome = {
            let Some(request) = self.requests.get(&task.request) else {
                return Step::Ran;
            };
            let mut ctx = TaskContext::new(task.node, &request.scope, &mut task.pipes);
            delegate.run(&mut ctx)
        };

        match outcome {
            Ok(TaskOutcome::Complete) => self.finish_task(task),
            Ok(TaskOutcome::Offload(companion)) => self.offload_task(task, companion),
            Err(source) => {
                let node = task.node;
                self.fail_request(task.request, TaskError::Delegate { node, source });
            }
        }
        Step::Ran
    }

    /// Maps one equeue event onto the scheduler.
    ///
    /// `Io` admits a new request (with an empty scope) and returns its id;
    /// `Task` resumes the matching suspended task. Requests admitted here
    /// belong to the dispatcher loop: their records are removed as soon as
    /// they reach a terminal state and drain, so an unattended loop does
    /// not accumulate per-request bookkeeping. Use
    /// [`begin_request`](Self::begin_request) when the outcome must stay
    /// queryable.
    pub fn dispatch(&mut self, event: Event) -> Option<RequestId> {
        match event {
            Event::Io { input, output } => {
                Some(self.admit(input, output, ScopeToken::empty(), true))
            }
            Event::Task(ticket) => {
                self.resume(ticket);
                None
            }
        }
    }

    /// The dispatcher loop: drains queued events, steps ready tasks, and
    /// honors the configured [`IdlePolicy`] when both run dry. Returns
    /// when the queue shuts down or `killed` is raised.
    pub fn run(&mut self, equeue: &Equeue, token: &mut SchedulerToken, killed: &AtomicBool) {
        while !killed.load(Ordering::Acquire) && !equeue.is_killed() {
            while !equeue.empty(token) {
                match equeue.take(token) {
                    Ok(event) => {
                        self.dispatch(event);
                    }
                    Err(_) => return,
                }
            }
            if self.step() == Step::Idle {
                match self.config.idle_policy {
                    IdlePolicy::Poll => std::thread::yield_now(),
                    IdlePolicy::Wait => equeue.wait(token, killed),
                }
            }
        }
    }

    /// Drains every currently queued event without blocking and returns
    /// how many were dispatched.
    pub fn pump(&mut self, equeue: &Equeue, token: &mut SchedulerToken) -> usize {
        let mut count = 0;
        while !equeue.empty(token) {
            let Ok(event) = equeue.take(token) else {
                break;
            };
            self.dispatch(event);
            count += 1;
        }
        count
    }

    /// Current state of a request, if known.
    #[must_use]
    pub fn request_state(&self, id: RequestId) -> Option<RequestState> {
        self.requests.get(&id).map(|r| r.state)
    }

    /// Tasks completed so far for a request.
    #[must_use]
    pub fn completed_tasks(&self, id: RequestId) -> Option<u32> {
        self.requests.get(&id).map(|r| r.completed)
    }

    /// Removes and returns the failure recorded for a request.
    pub fn take_error(&mut self, id: RequestId) -> Option<TaskError> {
        self.requests.get_mut(&id).and_then(|r| r.error.take())
    }

    /// Removes the record of a terminal request, returning its final
    /// state. Any unclaimed error is dropped with it.
    ///
    /// Returns `None` while the request is unknown, still in flight, or
    /// still draining (an offloaded task has not resumed yet).
    pub fn retire(&mut self, id: RequestId) -> Option<RequestState> {
        let state = self.requests.get(&id).map(|r| r.state)?;
        if state == RequestState::InFlight || self.request_busy(id) {
            return None;
        }
        self.requests.remove(&id);
        Some(state)
    }

    /// True while any admitted request is still in flight.
    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.ready.is_empty()
            || !self.pending.is_empty()
            || !self.suspended.is_empty()
    }

    // ---- Internals ----

    fn instantiate_task(&mut self, request: RequestId, node: NodeId) -> Result<Task, TaskError> {
        let delegate = self
            .graph
            .create_delegate(node)
            .map_err(|source| TaskError::Delegate { node, source })?;
        let mut task = Task::new(request, node, delegate, self.graph.slot_count(node));

        let (output_node, output_slot) = self.graph.output();
        if node == output_node {
            if let Some(req) = self.requests.get_mut(&request) {
                task.pipes[output_slot.0 as usize] = req.response.take();
            }
        }
        Ok(task)
    }

    /// Allocates or forks every outgoing pipe of the task and delivers the
    /// downstream ends. The outgoing list is sorted by source slot id, so
    /// a shadow slot's target is always wired before the shadow forks it.
    fn wire_outputs(&mut self, task: &mut Task) -> Result<(), TaskError> {
        let graph = Arc::clone(&self.graph);
        for desc in graph.outgoing_pipes(task.node) {
            let kind = graph
                .slot_kind(desc.source_node, desc.source_slot)
                .ok_or_else(|| {
                    TaskError::Internal(format!(
                        "pipe {desc} references a slot outside the table"
                    ))
                })?;

            let downstream = if let SlotKind::Shadow(target) = kind {
                let target_end = task
                    .pipes
                    .get(target.0 as usize)
                    .and_then(Option::as_ref)
                    .ok_or_else(|| {
                        TaskError::Internal(format!(
                            "shadow target {target} of {desc} has no transport"
                        ))
                    })?;
                let header =
                    graph.header_size(desc.destination_node, desc.destination_slot);
                self.transport
                    .fork(target_end, header)
                    .map_err(|source| TaskError::PipeAllocation {
                        node: desc.source_node,
                        slot: desc.source_slot,
                        source,
                    })?
            } else {
                let params = PipeParams {
                    type_name: graph.pipe_type(desc.source_node, desc.source_slot),
                    source_header: graph.header_size(desc.source_node, desc.source_slot),
                    destination_header: graph
                        .header_size(desc.destination_node, desc.destination_slot),
                };
                let (source, destination) =
                    self.transport.allocate(&params).map_err(|source| {
                        TaskError::PipeAllocation {
                            node: desc.source_node,
                            slot: desc.source_slot,
                            source,
                        }
                    })?;
                task.pipes[desc.source_slot.0 as usize] = Some(source);
                destination
            };

            self.deliver(
                task.request,
                desc.destination_node,
                desc.destination_slot,
                downstream,
            )?;
        }
        task.outputs_wired = true;
        Ok(())
    }

    /// Hands a pipe end to the downstream task, instantiating it on the
    /// first delivery and readying it on the last.
    fn deliver(
        &mut self,
        request: RequestId,
        node: NodeId,
        slot: SlotId,
        pipe: PipeHandle,
    ) -> Result<(), TaskError> {
        let key = (request, node);
        if !self.pending.contains_key(&key) {
            let task = self.instantiate_task(request, node)?;
            self.pending.insert(key, PendingTask { task, filled: 0 });
        }
        let Some(entry) = self.pending.get_mut(&key) else {
            return Err(TaskError::Internal(format!(
                "pending task for {node} vanished"
            )));
        };
        entry.task.pipes[slot.0 as usize] = Some(pipe);
        entry.filled += 1;

        if entry.filled == self.graph.incoming_pipes(node).len() {
            let Some(entry) = self.pending.remove(&key) else {
                return Err(TaskError::Internal(format!(
                    "pending task for {node} vanished"
                )));
            };
            let mut task = entry.task;
            task.state = TaskState::Ready;
            self.ready.push_back(task);
        }
        Ok(())
    }

    fn finish_task(&mut self, mut task: Task) {
        task.state = TaskState::Completed;
        let id = task.request;
        let (output_node, _) = self.graph.output();
        if let Some(request) = self.requests.get_mut(&id) {
            request.completed += 1;
            if task.node == output_node {
                request.state = RequestState::Completed;
                tracing::debug!(request = %id, tasks = request.completed, "Request completed");
            }
        }
        // Dropping the task releases every pipe end it still holds.
        drop(task);
        self.release_if_drained(id);
    }

    fn offload_task(&mut self, mut task: Task, mut companion: Box<dyn AsyncCompanion>) {
        let setup = {
            let Some(request) = self.requests.get(&task.request) else {
                return;
            };
            let mut ctx = TaskContext::new(task.node, &request.scope, &mut task.pipes);
            companion.setup(&mut ctx)
        };
        if let Err(source) = setup {
            let node = task.node;
            self.fail_request(task.request, TaskError::Delegate { node, source });
            return;
        }

        let Some(pool) = self.pool.as_ref() else {
            let node = task.node;
            self.fail_request(
                task.request,
                TaskError::OffloadPost {
                    node,
                    source: OffloadError::Terminated,
                },
            );
            return;
        };
        match pool.submit(companion) {
            Ok(ticket) => {
                tracing::trace!(request = %task.request, node = %task.node, %ticket, "Task suspended on offload");
                self.suspended.insert(ticket, task);
            }
            Err(source) => {
                let node = task.node;
                self.fail_request(task.request, TaskError::OffloadPost { node, source });
            }
        }
    }

    /// Resumes the suspended task for a finished offload. A ticket whose
    /// request already failed is dropped, along with its completion
    /// record; nothing is released twice.
    fn resume(&mut self, ticket: OffloadTicket) {
        let Some(mut task) = self.suspended.remove(&ticket) else {
            if let Some(pool) = self.pool.as_ref() {
                drop(pool.take_completion(ticket));
            }
            tracing::debug!(%ticket, "Dropped completion for a torn-down request");
            return;
        };

        let Some(pool) = self.pool.as_ref() else {
            let node = task.node;
            self.fail_request(
                task.request,
                TaskError::Internal(format!("offload ticket {ticket} with no pool at {node}")),
            );
            return;
        };
        let Some(completion) = pool.take_completion(ticket) else {
            let node = task.node;
            self.fail_request(
                task.request,
                TaskError::Internal(format!("no completion record for {ticket} at {node}")),
            );
            return;
        };

        if let Err(source) = completion.result {
            let node = task.node;
            self.fail_request(task.request, TaskError::Delegate { node, source });
            return;
        }

        // Re-enter the ordinary ready path with the cleanup phase as the
        // task's delegate. Outputs stay wired from the first invocation.
        task.delegate = Some(Box::new(CleanupDelegate {
            companion: Some(completion.companion),
        }));
        task.state = TaskState::Ready;
        self.ready.push_back(task);
    }

    /// Fails one request: records the error, drops the parked response,
    /// and purges every task the request still owns.
    fn fail_request(&mut self, id: RequestId, error: TaskError) {
        tracing::warn!(request = %id, %error, "Request failed");
        if let Some(request) = self.requests.get_mut(&id) {
            request.state = RequestState::Failed;
            request.response = None;
            if request.error.is_none() {
                request.error = Some(error);
            }
        }
        self.ready.retain(|t| t.request != id);
        self.pending.retain(|(request, _), _| *request != id);
        self.suspended.retain(|_, t| t.request != id);
        self.release_if_drained(id);
    }

    /// True while any task container still holds work for the request.
    fn request_busy(&self, id: RequestId) -> bool {
        self.ready.iter().any(|t| t.request == id)
            || self.pending.keys().any(|&(request, _)| request == id)
            || self.suspended.values().any(|t| t.request == id)
    }

    /// Releases a terminal request's scope and parked response once its
    /// last task is gone; the outcome record stays behind for `retire`.
    /// Detached requests are removed outright.
    fn release_if_drained(&mut self, id: RequestId) {
        let Some(request) = self.requests.get(&id) else {
            return;
        };
        if request.state == RequestState::InFlight || self.request_busy(id) {
            return;
        }
        if request.detached {
            self.requests.remove(&id);
            tracing::trace!(request = %id, "Retired detached request");
        } else if let Some(request) = self.requests.get_mut(&id) {
            request.scope = ScopeToken::empty();
            request.response = None;
        }
    }
}

/// Runs the companion's `cleanup` phase as an ordinary delegate, making a
/// resumed task indistinguishable from a first invocation.
struct CleanupDelegate {
    companion: Option<Box<dyn AsyncCompanion>>,
}

impl TaskDelegate for CleanupDelegate {
    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, ServletError> {
        let companion = self.companion.take().ok_or_else(|| {
            ServletError::Execution("cleanup delegate invoked twice".to_string())
        })?;
        companion.cleanup(ctx)?;
        Ok(TaskOutcome::Complete)
    }
}
