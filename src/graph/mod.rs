//! Static service graph.
//!
//! A service is a DAG of servlet-backed nodes connected by directed pipes.
//! The graph is assembled through [`ServiceBuilder`], validated and frozen
//! into a [`ServiceGraph`], then queried read-only by every scheduler
//! thread for the service's lifetime.
//!
//! Validation at freeze time covers:
//! - designated input/output endpoints with the required shapes (single
//!   input slot, no incoming pipes into the input node, no outgoing pipes
//!   out of the output node)
//! - reachability of every node from the input node
//! - acyclicity, via a topological peel seeded at the input node
//! - shadow slots targeting a connected output slot with a smaller id

mod builder;
mod error;
mod service;

pub use builder::{PipeDescriptor, ServiceBuilder};
pub use error::GraphError;
pub use service::ServiceGraph;
