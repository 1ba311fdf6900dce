//! Per-request task instances.

use crate::pipe::PipeHandle;
use crate::runtime::{NodeId, TaskDelegate};

use super::request::RequestId;

/// Lifecycle of one task instance.
///
/// `Created` tasks wait in the pending table for their inputs to fill;
/// `Ready` tasks sit in the FIFO ready set; a `Running` task occupies the
/// worker inside `step()`; both terminal states release the task's pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Instantiated, waiting for remaining inputs.
    Created,
    /// All inputs wired; queued for execution.
    Ready,
    /// Executing inside `step()` or suspended on the async pool.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed, or torn down with its failing request.
    Failed,
}

/// One node's runnable instance for one request.
pub(super) struct Task {
    pub request: RequestId,
    pub node: NodeId,
    pub state: TaskState,
    /// Present from instantiation until the delegate runs (or is replaced
    /// by the cleanup delegate on offload resumption).
    pub delegate: Option<Box<dyn TaskDelegate>>,
    /// Slot-indexed pipe ends; `None` until wired or after taken.
    pub pipes: Vec<Option<PipeHandle>>,
    /// Outgoing pipes are wired at most once; a task resumed after an
    /// offload must not re-allocate them.
    pub outputs_wired: bool,
}

impl Task {
    pub(super) fn new(
        request: RequestId,
        node: NodeId,
        delegate: Box<dyn TaskDelegate>,
        slot_count: usize,
    ) -> Self {
        let mut pipes = Vec::with_capacity(slot_count);
        pipes.resize_with(slot_count, || None);
        Self {
            request,
            node,
            state: TaskState::Created,
            delegate: Some(delegate),
            pipes,
            outputs_wired: false,
        }
    }
}
