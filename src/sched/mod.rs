//! Per-request task scheduling.
//!
//! The scheduler walks a frozen [`ServiceGraph`](crate::graph::ServiceGraph)
//! once per request: the input node's task seeds the ready set, completed
//! tasks push pipe ends downstream, and downstream tasks become ready when
//! their last input fills. Offload-capable tasks hand their slow fragment
//! to the [`AsyncPool`] and resume through the event queue.

mod async_pool;
mod error;
mod request;
mod scheduler;
mod task;

pub use async_pool::{AsyncPool, AsyncPoolConfig};
pub use error::{OffloadError, TaskError};
pub use request::{RequestId, RequestState};
pub use scheduler::{IdlePolicy, Scheduler, SchedulerConfig, Step};
pub use task::TaskState;

#[cfg(test)]
mod tests;
