//! Per-request bookkeeping.

use std::fmt;

use crate::pipe::PipeHandle;
use crate::runtime::ScopeToken;

use super::error::TaskError;

/// Identifies one in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

/// Terminal and non-terminal request outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Tasks of this request are still pending or running.
    InFlight,
    /// The output node's task completed; the response pipe was handed off.
    Completed,
    /// A task failed; the whole request was torn down.
    Failed,
}

/// State the scheduler keeps per request.
pub(super) struct Request {
    /// Opaque embedder payload, exposed to every delegate of the request.
    /// Released as soon as the request is terminal and drained.
    pub scope: ScopeToken,
    /// Response pipe, parked until the output node's task instantiates.
    pub response: Option<PipeHandle>,
    /// Tasks completed so far.
    pub completed: u32,
    pub state: RequestState,
    /// First failure, kept for `take_error`.
    pub error: Option<TaskError>,
    /// True for requests admitted from `Io` events: nobody holds the id,
    /// so the record is removed outright once terminal and drained.
    pub detached: bool,
}

impl Request {
    pub(super) fn new(scope: ScopeToken, response: PipeHandle, detached: bool) -> Self {
        Self {
            scope,
            response: Some(response),
            completed: 0,
            state: RequestState::InFlight,
            error: None,
            detached,
        }
    }
}
