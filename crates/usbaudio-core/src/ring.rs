//! Fixed-capacity circular buffer with wrap notification.
//!
//! [`RingBuffer`] is the sample store between the isochronous transport and
//! the host audio engine. It keeps one slot empty to tell full from empty, so
//! a buffer of capacity `N` holds at most `N - 1` items and
//! `available() + vacant() == N - 1` always holds.
//!
//! Every time the write head reaches the physical end of the backing array
//! and returns to index 0 the buffer fires exactly one [`WrapEvent`], no
//! matter how many items the triggering write carried. Wraps are the primary
//! timing signal of the stream: the managers hand the event timestamp to the
//! timestamp filter.
//!
//! ```text
//!            read                 write
//!              │                    │
//!  ┌───┬───┬───▼───┬───┬───┬───┬───▼───┬───┐
//!  │   │   │ ##### │###│###│###│       │   │   # = available
//!  └───┴───┴───────┴───┴───┴───┴───────┴───┘
//!  0                                       N
//! ```
//!
//! # Concurrency
//!
//! The buffer has no internal lock. Exactly one producer context may call the
//! push operations and exactly one consumer context the pop operations.
//! Sharing across threads is the owner's business.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{Error, Result};

/// Notification fired when the write head crosses the physical end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapEvent {
    /// Timestamp supplied by the writer, if any.
    pub timestamp_ns: Option<u64>,
    /// Items of the triggering write that landed after index 0.
    pub overshoot: usize,
}

/// Callback receiving wrap notifications on the producer's context.
pub type WrapObserver = Box<dyn FnMut(WrapEvent) + Send>;

/// Single-producer single-consumer circular buffer.
///
/// # Invariants
///
/// - `read` and `write` are always in `[0, capacity)`
/// - `available() + vacant() == capacity - 1` once initialized
/// - pops never return partial data
pub struct RingBuffer<T> {
    buffer: Vec<T>,
    read: usize,
    write: usize,
    wraps: u64,
    observer: Option<WrapObserver>,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create an uninitialized buffer. Call [`init`](Self::init) before use.
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            read: 0,
            write: 0,
            wraps: 0,
            observer: None,
        }
    }

    /// Create and initialize a buffer with `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut ring = Self::new();
        ring.init(capacity)?;
        Ok(ring)
    }

    /// Allocate backing storage and reset both heads.
    ///
    /// Fails with [`Error::BadArgument`] for capacities below 2 and with
    /// [`Error::NoMemory`] if the allocation is refused.
    pub fn init(&mut self, capacity: usize) -> Result<()> {
        if capacity < 2 {
            return Err(Error::BadArgument);
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| Error::NoMemory)?;
        buffer.resize(capacity, T::default());
        self.buffer = buffer;
        self.read = 0;
        self.write = 0;
        self.wraps = 0;
        Ok(())
    }

    /// Push one item.
    ///
    /// Fires a wrap notification without timestamp if the item lands in the
    /// last physical slot.
    pub fn push(&mut self, item: T) -> Result<()> {
        self.check_ready()?;
        if self.vacant() == 0 {
            return Err(Error::Overrun);
        }
        self.buffer[self.write] = item;
        self.advance_write(1, None);
        Ok(())
    }

    /// Push a batch of items with a single bulk copy.
    ///
    /// If the copy crosses the physical end it wraps and fires exactly one
    /// notification carrying `timestamp_ns`. Nothing is written when the
    /// batch does not fit.
    pub fn push_slice(&mut self, items: &[T], timestamp_ns: u64) -> Result<()> {
        self.check_ready()?;
        if items.len() > self.vacant() {
            return Err(Error::Overrun);
        }
        if items.is_empty() {
            return Ok(());
        }
        let capacity = self.buffer.len();
        let first = items.len().min(capacity - self.write);
        self.buffer[self.write..self.write + first].copy_from_slice(&items[..first]);
        let rest = items.len() - first;
        if rest > 0 {
            self.buffer[..rest].copy_from_slice(&items[first..]);
        }
        self.advance_write(items.len(), Some(timestamp_ns));
        Ok(())
    }

    /// Pop one item, or fail with [`Error::Underrun`] when empty.
    pub fn pop(&mut self) -> Result<T> {
        self.check_ready()?;
        if self.available() == 0 {
            return Err(Error::Underrun);
        }
        let item = self.buffer[self.read];
        self.read = (self.read + 1) % self.buffer.len();
        Ok(item)
    }

    /// Pop exactly `out.len()` items, or nothing at all.
    pub fn pop_slice(&mut self, out: &mut [T]) -> Result<()> {
        self.check_ready()?;
        if out.len() > self.available() {
            return Err(Error::Underrun);
        }
        let capacity = self.buffer.len();
        let first = out.len().min(capacity - self.read);
        out[..first].copy_from_slice(&self.buffer[self.read..self.read + first]);
        let rest = out.len() - first;
        if rest > 0 {
            out[first..].copy_from_slice(&self.buffer[..rest]);
        }
        self.read = (self.read + out.len()) % capacity;
        Ok(())
    }

    /// Drop every buffered item and rewind both heads to 0.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

impl<T> RingBuffer<T> {
    /// Install the callback that receives wrap notifications.
    pub fn set_wrap_observer(&mut self, observer: WrapObserver) {
        self.observer = Some(observer);
    }

    /// Remove the wrap callback.
    pub fn clear_wrap_observer(&mut self) {
        self.observer = None;
    }

    /// Total number of slots (`N`). Zero before [`init`](RingBuffer::init).
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Whether backing storage has been allocated.
    pub fn is_initialized(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Items ready to pop.
    pub fn available(&self) -> usize {
        let capacity = self.buffer.len();
        if capacity == 0 {
            return 0;
        }
        (self.write + capacity - self.read) % capacity
    }

    /// Items that can be pushed before an overrun.
    pub fn vacant(&self) -> usize {
        let capacity = self.buffer.len();
        if capacity == 0 {
            return 0;
        }
        capacity - 1 - self.available()
    }

    /// Physical index of the next pop.
    pub fn read_index(&self) -> usize {
        self.read
    }

    /// Physical index of the next push.
    pub fn write_index(&self) -> usize {
        self.write
    }

    /// Number of wrap notifications fired since the last init.
    pub fn wrap_count(&self) -> u64 {
        self.wraps
    }

    fn check_ready(&self) -> Result<()> {
        if self.buffer.is_empty() {
            Err(Error::NotReady)
        } else {
            Ok(())
        }
    }

    fn advance_write(&mut self, count: usize, timestamp_ns: Option<u64>) {
        let capacity = self.buffer.len();
        let end = self.write + count;
        if end >= capacity {
            // At most one crossing: count never exceeds capacity - 1.
            self.write = end - capacity;
            self.wraps += 1;
            let event = WrapEvent {
                timestamp_ns,
                overshoot: self.write,
            };
            #[cfg(feature = "tracing")]
            tracing::trace!(wraps = self.wraps, overshoot = event.overshoot, "ring wrap");
            if let Some(observer) = self.observer.as_mut() {
                observer(event);
            }
        } else {
            self.write = end;
        }
    }
}

impl<T: Copy + Default> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.buffer.len())
            .field("read", &self.read)
            .field("write", &self.write)
            .field("wraps", &self.wraps)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
