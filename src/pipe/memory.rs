//! In-memory reference transport.
//!
//! Backs every edge with a shared byte buffer and keeps allocation counters
//! so embedders and tests can verify that every end handed out is eventually
//! released. Not a performance transport; real deployments plug in their own
//! [`PipeTransport`](super::PipeTransport) implementation.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{PipeEnd, PipeHandle, PipeParams, PipeTransport, TransportError};

/// One recorded transport operation, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOp {
    /// A fresh (source, destination) pair was allocated.
    Allocate,
    /// An existing source end was forked.
    Fork,
}

#[derive(Debug, Default)]
struct Shared {
    live_ends: AtomicUsize,
    allocated: AtomicUsize,
    forked: AtomicUsize,
    ops: Mutex<Vec<TransportOp>>,
}

/// In-memory pipe transport with end-accounting.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

/// A pipe end backed by a shared in-memory buffer.
#[derive(Debug)]
pub struct MemoryPipeEnd {
    shared: Arc<Shared>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryPipeEnd {
    fn new(shared: Arc<Shared>, buffer: Arc<Mutex<Vec<u8>>>) -> Self {
        shared.live_ends.fetch_add(1, Ordering::Relaxed);
        Self { shared, buffer }
    }

    /// Appends bytes to the shared channel buffer.
    pub fn write(&self, bytes: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    /// Drains and returns everything written so far.
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(
            &mut *self
                .buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl PipeEnd for MemoryPipeEnd {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MemoryPipeEnd {
    fn drop(&mut self) {
        self.shared.live_ends.fetch_sub(1, Ordering::Relaxed);
    }
}

impl InMemoryTransport {
    /// Creates a transport with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ends currently alive (allocated or forked, not yet dropped).
    #[must_use]
    pub fn live_ends(&self) -> usize {
        self.shared.live_ends.load(Ordering::Relaxed)
    }

    /// Total (source, destination) pairs allocated so far.
    #[must_use]
    pub fn allocated_pairs(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Total forks performed so far.
    #[must_use]
    pub fn forks(&self) -> usize {
        self.shared.forked.load(Ordering::Relaxed)
    }

    /// Snapshot of the operation log, in call order.
    #[must_use]
    pub fn ops(&self) -> Vec<TransportOp> {
        self.shared
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, op: TransportOp) {
        self.shared
            .ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }
}

impl PipeTransport for InMemoryTransport {
    fn allocate(
        &self,
        _params: &PipeParams,
    ) -> Result<(PipeHandle, PipeHandle), TransportError> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let source = MemoryPipeEnd::new(Arc::clone(&self.shared), Arc::clone(&buffer));
        let destination = MemoryPipeEnd::new(Arc::clone(&self.shared), buffer);
        self.shared.allocated.fetch_add(1, Ordering::Relaxed);
        self.record(TransportOp::Allocate);
        Ok((PipeHandle::new(source), PipeHandle::new(destination)))
    }

    fn fork(
        &self,
        end: &PipeHandle,
        _header_size: usize,
    ) -> Result<PipeHandle, TransportError> {
        let concrete = end
            .downcast_ref::<MemoryPipeEnd>()
            .ok_or(TransportError::ForeignEnd)?;
        let forked = MemoryPipeEnd::new(
            Arc::clone(&self.shared),
            Arc::clone(&concrete.buffer),
        );
        self.shared.forked.fetch_add(1, Ordering::Relaxed);
        self.record(TransportOp::Fork);
        Ok(PipeHandle::new(forked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_connects_both_ends() {
        let transport = InMemoryTransport::new();
        let (src, dst) = transport.allocate(&PipeParams::default()).unwrap();

        src.downcast_ref::<MemoryPipeEnd>().unwrap().write(b"hello");
        let read = dst.downcast_ref::<MemoryPipeEnd>().unwrap().take();
        assert_eq!(read, b"hello");

        assert_eq!(transport.allocated_pairs(), 1);
        assert_eq!(transport.live_ends(), 2);
        drop(src);
        drop(dst);
        assert_eq!(transport.live_ends(), 0);
    }

    #[test]
    fn fork_shares_the_channel() {
        let transport = InMemoryTransport::new();
        let (src, dst) = transport.allocate(&PipeParams::default()).unwrap();
        let shadow = transport.fork(&src, 0).unwrap();

        shadow
            .downcast_ref::<MemoryPipeEnd>()
            .unwrap()
            .write(b"forked");
        let read = dst.downcast_ref::<MemoryPipeEnd>().unwrap().take();
        assert_eq!(read, b"forked");

        assert_eq!(transport.forks(), 1);
        assert_eq!(
            transport.ops(),
            vec![TransportOp::Allocate, TransportOp::Fork]
        );
        assert_eq!(transport.live_ends(), 3);
    }

    #[test]
    fn fork_rejects_foreign_ends() {
        #[derive(Debug)]
        struct OtherEnd;
        impl PipeEnd for OtherEnd {
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let transport = InMemoryTransport::new();
        let foreign = PipeHandle::new(OtherEnd);
        assert!(matches!(
            transport.fork(&foreign, 0),
            Err(TransportError::ForeignEnd)
        ));
    }
}
