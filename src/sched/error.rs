//! Error types for per-request task scheduling

use crate::pipe::TransportError;
use crate::runtime::{NodeId, ServletError, SlotId};

/// Errors that fail a single in-flight request
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// A task's delegate or companion failed
    #[error("Task at {node} failed")]
    Delegate {
        /// The node whose task failed
        node: NodeId,
        /// The servlet's failure
        #[source]
        source: ServletError,
    },

    /// The transport could not provide a pipe for an edge
    #[error("Pipe allocation failed at {node}, slot {slot}")]
    PipeAllocation {
        /// The source node of the edge
        node: NodeId,
        /// The source slot of the edge
        slot: SlotId,
        /// The transport's failure
        #[source]
        source: TransportError,
    },

    /// An offload could not be posted to the async pool
    #[error("Offload from {node} failed")]
    OffloadPost {
        /// The node whose task tried to offload
        node: NodeId,
        /// The pool's rejection
        #[source]
        source: OffloadError,
    },

    /// A scheduler invariant was violated
    #[error("Internal scheduler error: {0}")]
    Internal(String),
}

/// Errors raised by the async offload pool
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    /// The bounded injection queue is full
    #[error("Async pool injection queue is full")]
    Saturated,

    /// The pool has been shut down
    #[error("Async pool is terminated")]
    Terminated,

    /// A worker thread could not be spawned
    #[error("Failed to spawn async worker {index}: {message}")]
    SpawnFailed {
        /// Index of the worker that failed to start
        index: usize,
        /// OS-level failure description
        message: String,
    },

    /// The event queue refused a worker's registration
    #[error("Async pool could not register with the event queue: {0}")]
    Equeue(#[from] crate::equeue::EqueueError),
}
