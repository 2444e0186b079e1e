//! Lock-free FIFO of per-frame byte counts.
//!
//! The recording side pushes the byte count of every isochronous frame it
//! receives; the playback side pops one count per outgoing frame. Because the
//! device paces the recording stream, replaying those counts makes playback
//! consume samples at exactly the rate the device produces them. This is the
//! whole implicit-synchronization mechanism: push order must equal pop order.
//!
//! # Concurrency Contract
//!
//! - Only ONE context may call [`push()`](FrameSizeQueue::push) (the input
//!   completion path).
//! - Only ONE context may call [`pop()`](FrameSizeQueue::pop) (the output
//!   completion path).
//!
//! The slots are atomics, so breaking the contract cannot cause undefined
//! behavior, only reordering.
//!
//! # Overflow
//!
//! When the producer outruns the consumer by more than
//! [`FRAME_SIZE_QUEUE_CAPACITY`] entries the oldest entry is overwritten and
//! [`overwrites()`](FrameSizeQueue::overwrites) is incremented. This is a
//! degradation, not an error.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Number of byte counts the queue retains.
pub const FRAME_SIZE_QUEUE_CAPACITY: usize = 128;

/// Bounded SPSC queue of frame byte counts with overwrite-oldest semantics.
///
/// `head` and `tail` are monotonically increasing sequence numbers; the slot
/// for sequence `s` is `s % FRAME_SIZE_QUEUE_CAPACITY`. All 128 slots are
/// usable.
pub struct FrameSizeQueue {
    slots: [AtomicU32; FRAME_SIZE_QUEUE_CAPACITY],
    /// Next sequence to write (advanced only by the producer).
    head: AtomicU64,
    /// Next sequence to read (advanced by the consumer, or by the producer
    /// when it overwrites).
    tail: AtomicU64,
    overwrites: AtomicU64,
}

impl FrameSizeQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| AtomicU32::new(0)),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            overwrites: AtomicU64::new(0),
        }
    }

    /// Append a byte count (producer side).
    ///
    /// Overwrites the oldest entry when full.
    pub fn push(&self, bytes: u32) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head - tail >= FRAME_SIZE_QUEUE_CAPACITY as u64 {
            // Drop the oldest. If the consumer got there first there is room
            // now and either outcome is fine.
            if self
                .tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.overwrites.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::trace!(dropped_seq = tail, "frame size queue overwrite");
            }
        }
        self.slots[Self::slot(head)].store(bytes, Ordering::Relaxed);
        self.head.store(head + 1, Ordering::Release);
    }

    /// Remove the oldest byte count (consumer side), or `None` when empty.
    pub fn pop(&self) -> Option<u32> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail == self.head.load(Ordering::Acquire) {
                return None;
            }
            let value = self.slots[Self::slot(tail)].load(Ordering::Relaxed);
            // Fails only when the producer overwrote this entry meanwhile.
            if self
                .tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(value);
            }
        }
    }

    /// Number of queued byte counts.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    /// Whether the queue holds no byte counts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries lost to overflow since creation or the last reset.
    pub fn overwrites(&self) -> u64 {
        self.overwrites.load(Ordering::Relaxed)
    }

    /// Discard every entry.
    ///
    /// Only call while neither side is running, e.g. between sessions.
    pub fn reset(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
        self.overwrites.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn slot(seq: u64) -> usize {
        (seq % FRAME_SIZE_QUEUE_CAPACITY as u64) as usize
    }
}

impl Default for FrameSizeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FrameSizeQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameSizeQueue")
            .field("len", &self.len())
            .field("overwrites", &self.overwrites())
            .finish()
    }
}
