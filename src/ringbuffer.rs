//! Fixed-capacity, single-producer/single-consumer lock-free ring buffer
//! (spec.md §4.D).
//!
//! Capacity is rounded up to a power of two so slot indexing is a mask
//! instead of a modulo. The producer never blocks and never allocates: on
//! a full buffer, `write` reports `WriteResult::Dropped` and the caller is
//! expected to bump its own dropped counter (spec.md §4.D: "When full, the
//! producer drops the sample and increments `dropped_count`").
//!
//! Memory ordering follows spec.md §4.D exactly: the producer publishes the
//! record into its slot with a plain write, then makes it visible with a
//! release store on the write index; the consumer acquires the write index
//! first and only then reads the slot.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sample::RawSample;

pub enum WriteResult {
    Written,
    Dropped,
}

pub enum ReadResult {
    Sample(RawSample),
    Empty,
}

/// A single-producer/single-consumer ring buffer of [`RawSample`] records.
///
/// Safety: `write` must only ever be called from the producer side, and
/// `read`/`drain` only from the consumer side. The type is `Sync` because
/// the only shared mutable state (the slots) is accessed disjointly: the
/// producer only touches the slot at `tail`, the consumer only touches the
/// slot the producer has already released.
pub struct RingBuffer {
    slots: Box<[UnsafeCell<RawSample>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// `requested_capacity` is rounded up to the next power of two.
    pub fn with_capacity(requested_capacity: usize) -> Self {
        let capacity = requested_capacity.max(1).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(RawSample::empty()));
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Sizes the buffer so that `raw_sample_size * capacity <= memory_limit`
    /// (spec.md §4.D: "Capacity `C` is a power of two, chosen from the
    /// caller's memory budget"). `with_capacity` rounds up to the next
    /// power of two, which would break that bound, so the largest capacity
    /// that fits is rounded *down* to a power of two here instead.
    pub fn for_memory_budget(memory_limit_bytes: usize) -> Self {
        let record_size = std::mem::size_of::<RawSample>().max(1);
        let max_capacity = (memory_limit_bytes / record_size).max(1);
        let rounded = max_capacity.next_power_of_two();
        let capacity = if rounded > max_capacity {
            (rounded / 2).max(1)
        } else {
            rounded
        };
        Self::with_capacity(capacity)
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Producer-only. Never blocks, never allocates.
    pub fn write(&self, record: RawSample) -> WriteResult {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.slots.len() {
            return WriteResult::Dropped;
        }
        let slot = &self.slots[tail & self.mask];
        // SAFETY: only the producer writes to this slot, and only after
        // confirming (above) that the consumer has already released it.
        unsafe {
            *slot.get() = record;
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        WriteResult::Written
    }

    /// Consumer-only.
    pub fn read(&self) -> ReadResult {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return ReadResult::Empty;
        }
        let slot = &self.slots[head & self.mask];
        // SAFETY: `tail`'s acquire load guarantees the producer's release
        // store (and the record write preceding it) happened-before here.
        let record = unsafe { (*slot.get()).clone() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        ReadResult::Sample(record)
    }

    /// Consumer-only. Pulls up to `max` records in one call (spec.md §4.D).
    pub fn drain(&self, max: usize, mut f: impl FnMut(RawSample)) -> usize {
        let mut n = 0;
        while n < max {
            match self.read() {
                ReadResult::Sample(sample) => {
                    f(sample);
                    n += 1;
                }
                ReadResult::Empty => break,
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
