//! # Plumber Core
//!
//! The dataflow execution core for Plumber. A service is a directed acyclic
//! graph of independently loaded computation units ("servlets") linked by
//! typed channels ("pipes"). Each inbound request instantiates the graph:
//! every node becomes a runnable task, pipes become per-request transport
//! channels, and the scheduler runs each qualifying task exactly once per
//! request while many requests execute concurrently.
//!
//! This crate provides:
//! - **Service Graph**: immutable, validated DAG built once from a mutable
//!   builder, then frozen for the service's lifetime
//! - **Task Scheduler**: per-request driver that walks the graph, allocates
//!   and forks pipes, and drives tasks to completion
//! - **Event Queue**: bounded per-thread queues multiplexing readiness
//!   notifications between event-loop threads and one dispatcher
//! - **Async Offload Pool**: fixed worker pool that runs a task's slow
//!   fragment without pinning a scheduler worker
//!
//! ## Design Principles
//!
//! 1. **Frozen topology** - the graph is built, validated, then only read;
//!    no locking is needed for graph queries
//! 2. **Per-request isolation** - task state, pipe instances, and the
//!    request scope belong to exactly one in-flight request
//! 3. **Single-writer queues** - each event-loop thread owns one ring;
//!    blocking is reserved for the full/empty transitions
//!
//! ## Example
//!
//! ```rust,ignore
//! use plumber_core::graph::ServiceBuilder;
//! use plumber_core::sched::{Scheduler, SchedulerConfig};
//!
//! let mut builder = ServiceBuilder::new(registry);
//! let input = builder.add_node(reader)?;
//! let output = builder.add_node(writer)?;
//! builder.add_pipe(PipeDescriptor::new(input, SlotId(1), output, SlotId(0)))?;
//! builder.set_input(input, SlotId(0))?;
//! builder.set_output(output, SlotId(1))?;
//! let graph = builder.freeze()?;
//!
//! let mut sched = Scheduler::new(graph, transport, None, SchedulerConfig::default());
//! sched.begin_request(input_pipe, output_pipe, scope);
//! while sched.step() == Step::Ran {}
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)] // Allowed only in the equeue ring
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod equeue;
pub mod graph;
pub mod pipe;
pub mod runtime;
pub mod sched;

// Re-export key types
pub use graph::{PipeDescriptor, ServiceBuilder, ServiceGraph};
pub use sched::{Scheduler, SchedulerConfig, Step};

/// Result type for plumber-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for plumber-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Service graph construction or validation errors
    #[error("Graph error: {0}")]
    Graph(#[from] graph::GraphError),

    /// Task scheduling errors
    #[error("Task error: {0}")]
    Task(#[from] sched::TaskError),

    /// Event queue errors
    #[error("Equeue error: {0}")]
    Equeue(#[from] equeue::EqueueError),

    /// Pipe transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] pipe::TransportError),

    /// Servlet runtime errors
    #[error("Servlet error: {0}")]
    Servlet(#[from] runtime::ServletError),
}
