//! Pipe transport seam.
//!
//! The scheduler never touches transport internals; it only asks a
//! [`PipeTransport`] to allocate a connected pair of ends for an edge, or to
//! fork an already-allocated end so two output slots feed the same channel.
//! Ends travel through the scheduler as opaque [`PipeHandle`]s and are
//! released by dropping them.

mod memory;

pub use memory::{InMemoryTransport, MemoryPipeEnd, TransportOp};

use std::any::Any;
use std::fmt;

/// One end of an allocated pipe.
///
/// Implementations carry whatever state the concrete transport needs; the
/// scheduler treats ends as opaque and releases them by dropping.
pub trait PipeEnd: Send + fmt::Debug {
    /// Downcast support for transports that need their concrete end back.
    fn as_any(&self) -> &dyn Any;
}

/// Owned, opaque handle to one pipe end.
#[derive(Debug)]
pub struct PipeHandle(Box<dyn PipeEnd>);

impl PipeHandle {
    /// Wraps a concrete transport end.
    #[must_use]
    pub fn new(end: impl PipeEnd + 'static) -> Self {
        Self(Box::new(end))
    }

    /// Borrows the concrete end, if this handle came from transport `T`.
    #[must_use]
    pub fn downcast_ref<T: PipeEnd + 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }
}

/// Allocation parameters for one edge, derived from the frozen graph's
/// resolved type bindings at allocation time.
#[derive(Debug, Clone, Default)]
pub struct PipeParams {
    /// Resolved type name shared by both ends, when known.
    pub type_name: Option<String>,
    /// Typed header bytes expected by the source slot.
    pub source_header: usize,
    /// Typed header bytes expected by the destination slot.
    pub destination_header: usize,
}

/// A pluggable pipe transport.
///
/// Implementations must tolerate concurrent calls from multiple scheduler
/// threads; per-request pipe instances are never shared across requests.
pub trait PipeTransport: Send + Sync {
    /// Allocates a connected (source, destination) pair of ends.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Allocate`] when the transport cannot
    /// provide a channel.
    fn allocate(&self, params: &PipeParams)
        -> Result<(PipeHandle, PipeHandle), TransportError>;

    /// Forks an already-allocated source end so a second output slot writes
    /// into the same underlying channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ForeignEnd`] when `end` did not come from
    /// this transport, or [`TransportError::Fork`] on transport failure.
    fn fork(&self, end: &PipeHandle, header_size: usize)
        -> Result<PipeHandle, TransportError>;
}

/// Errors raised by pipe transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport could not allocate a channel
    #[error("Pipe allocation failed: {0}")]
    Allocate(String),

    /// The transport could not fork an existing end
    #[error("Pipe fork failed: {0}")]
    Fork(String),

    /// A handle from a different transport was passed in
    #[error("Pipe end does not belong to this transport")]
    ForeignEnd,
}
