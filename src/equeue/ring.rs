//! Single-writer event ring.
//!
//! Bounded power-of-two ring used as the storage behind each equeue token.
//! Exactly one producer thread writes; the dispatcher reads. Free-running
//! head/tail counters make the full capacity usable (no reserved slot).
//! Each slot is fully written before the tail advance publishes it with a
//! release store, so the consumer's acquire load always observes whole
//! entries. Blocking on the full/empty transitions is layered on top by
//! the queue, not here.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pads a value to a cache line to prevent false sharing between the
/// producer-owned tail and the consumer-owned head.
#[repr(align(64))]
pub(super) struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    pub(super) const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// A bounded ring with exactly one producer and one consumer.
///
/// # Safety
///
/// Safe to share between threads as long as at most one thread calls
/// `try_push` and at most one thread calls `try_pop` at any time.
pub(super) struct SingleWriterRing<T> {
    /// Ring storage.
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,

    /// Free-running consume counter. Cache-padded against tail.
    head: CachePadded<AtomicUsize>,

    /// Free-running publish counter. Cache-padded against head.
    tail: CachePadded<AtomicUsize>,

    /// Capacity mask for fast modulo (capacity - 1).
    capacity_mask: usize,
}

// SAFETY: the ring owns its slots; the single-producer/single-consumer
// protocol above makes concurrent access sound for any Send payload.
unsafe impl<T: Send> Send for SingleWriterRing<T> {}
unsafe impl<T: Send> Sync for SingleWriterRing<T> {}

impl<T> SingleWriterRing<T> {
    /// Creates a ring with the given power-of-two capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub(super) fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "ring capacity must be a nonzero power of two"
        );

        let buffer: Vec<UnsafeCell<MaybeUninit<T>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            capacity_mask: capacity - 1,
        }
    }

    /// Ring capacity; every slot is usable.
    #[inline]
    pub(super) fn capacity(&self) -> usize {
        self.capacity_mask + 1
    }

    /// Snapshot entry count; may change immediately after returning.
    #[inline]
    pub(super) fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    /// Snapshot emptiness check.
    #[inline]
    pub(super) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends one entry.
    ///
    /// Returns the entry back when the ring is full. Must only be called
    /// by the single producer thread.
    #[inline]
    pub(super) fn try_push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) == self.capacity() {
            return Err(item);
        }

        // SAFETY: exclusive write access to this slot. We are the only
        // producer, the slot is not yet published (tail unchanged), and
        // head <= slot index < head + capacity keeps the consumer out.
        unsafe {
            (*self.buffer[tail & self.capacity_mask].get()).write(item);
        }

        // Publish the entry
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Removes the oldest entry, if any.
    ///
    /// Must only be called by the single consumer thread.
    #[inline]
    pub(super) fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: exclusive read access: we are the only consumer and the
        // acquire load above proved the slot was published whole.
        let item = unsafe { (*self.buffer[head & self.capacity_mask].get()).assume_init_read() };

        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for SingleWriterRing<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn full_capacity_is_usable() {
        let ring: SingleWriterRing<u32> = SingleWriterRing::new(4);

        for i in 0..4 {
            assert!(ring.try_push(i).is_ok());
        }
        assert_eq!(ring.try_push(99), Err(99));
        assert_eq!(ring.len(), 4);

        for i in 0..4 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert_eq!(ring.try_pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_around() {
        let ring: SingleWriterRing<u32> = SingleWriterRing::new(4);

        for round in 0..5 {
            for i in 0..3 {
                assert!(ring.try_push(round * 10 + i).is_ok());
            }
            for i in 0..3 {
                assert_eq!(ring.try_pop(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two() {
        let _: SingleWriterRing<u32> = SingleWriterRing::new(6);
    }

    #[test]
    fn concurrent_single_producer_single_consumer() {
        const ITEMS: u32 = 10_000;
        let ring = Arc::new(SingleWriterRing::<u32>::new(64));
        let producer_ring = Arc::clone(&ring);

        let producer = thread::spawn(move || {
            for i in 0..ITEMS {
                let mut item = i;
                while let Err(back) = producer_ring.try_push(item) {
                    item = back;
                    thread::yield_now();
                }
            }
        });

        let mut received = Vec::with_capacity(ITEMS as usize);
        while received.len() < ITEMS as usize {
            if let Some(item) = ring.try_pop() {
                received.push(item);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();

        for (i, &item) in received.iter().enumerate() {
            assert_eq!(item, u32::try_from(i).unwrap());
        }
    }

    #[test]
    fn drops_remaining_entries() {
        use std::sync::atomic::AtomicUsize;

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counter;
        impl Drop for Counter {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let ring: SingleWriterRing<Counter> = SingleWriterRing::new(8);
            for _ in 0..5 {
                assert!(ring.try_push(Counter).is_ok());
            }
            drop(ring.try_pop());
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }
}
