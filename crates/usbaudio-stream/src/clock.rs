//! Ring-position clock recovered from wrap timestamps.
//!
//! Every time a stream's ring buffer wraps, the owning manager reports the
//! (interpolated) wrap time here. The master direction's reports run through
//! a [`TimestampFilter`]; the filtered wrap time is published atomically so
//! [`ClockSync::estimate_position_at`] never takes a lock.
//!
//! ```text
//!   wrap k-1        wrap k (published)        now + offset
//!      │                 │─────── elapsed ────────│
//!      ▼                 ▼                        ▼
//!  ────┼─────────────────┼────────────────────────┼──►  time
//!                     pos = (elapsed / ns_per_byte) mod ring_bytes
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use usbaudio_core::{Error, FilterConfig, Result, StreamFormat, TimestampFilter};

use crate::transport::Direction;

/// Source of "now" in nanoseconds, on the same clock the transport stamps
/// frames with.
pub trait TimeSource: Send + Sync {
    /// Current time in nanoseconds.
    fn now_ns(&self) -> u64;
}

/// Wall-clock time source based on [`Instant`], counting from creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start counting from now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven time source for simulation and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Start at `start_ns`.
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    /// Jump to `now_ns`.
    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::Release);
    }

    /// Move forward by `delta_ns`.
    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::AcqRel);
    }
}

impl TimeSource for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct WrapLog {
    count: AtomicU64,
    last_bits: AtomicU64,
}

/// Shared timing state for one duplex session.
///
/// Created at session setup, handed to both managers by `Arc`, dropped at
/// teardown.
pub struct ClockSync {
    ring_bytes: usize,
    ns_per_byte: f64,
    master: Direction,
    filter: Mutex<TimestampFilter>,
    published: AtomicU64,
    has_wrap: AtomicBool,
    locked: AtomicBool,
    wraps: [WrapLog; 2],
    time: Arc<dyn TimeSource>,
}

impl ClockSync {
    /// Create clock state for rings of `ring_bytes` carrying `format`.
    pub fn new(
        format: StreamFormat,
        ring_bytes: usize,
        filter: FilterConfig,
        master: Direction,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        if !format.is_valid() || ring_bytes < 2 {
            return Err(Error::BadArgument);
        }
        let ns_per_byte = format.ns_per_byte();
        let period = ring_bytes as f64 * ns_per_byte;
        Ok(Self {
            ring_bytes,
            ns_per_byte,
            master,
            filter: Mutex::new(TimestampFilter::new(period, filter)),
            published: AtomicU64::new(0),
            has_wrap: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            wraps: Default::default(),
            time,
        })
    }

    /// Report that `source`'s ring wrapped at `raw_ns`.
    ///
    /// Master reports update the filter and the published wrap time, which
    /// is returned. Reports from the other direction are only logged.
    pub fn record_wrap(&self, source: Direction, raw_ns: f64) -> Option<f64> {
        let log = &self.wraps[source.index()];
        log.count.fetch_add(1, Ordering::Relaxed);
        log.last_bits.store(raw_ns.to_bits(), Ordering::Release);

        if source != self.master {
            tracing::trace!(direction = %source, raw_ns, "corroborating wrap");
            return None;
        }

        let mut filter = self.filter.lock();
        let was_locked = filter.is_locked();
        let filtered = filter.update(raw_ns);
        let locked = filter.is_locked();
        drop(filter);

        self.published.store(filtered.to_bits(), Ordering::Release);
        self.has_wrap.store(true, Ordering::Release);
        self.locked.store(locked, Ordering::Release);

        if locked != was_locked {
            if locked {
                tracing::info!(direction = %source, "wrap clock locked");
            } else {
                tracing::warn!(direction = %source, "wrap clock lost lock, re-bootstrapping");
            }
        }
        tracing::trace!(raw_ns, filtered, "wrap");
        Some(filtered)
    }

    /// Fractional ring position at `offset_ns` from now.
    ///
    /// Fails with [`Error::NotReady`] until the master direction has wrapped
    /// at least once.
    pub fn estimate_position_at(&self, offset_ns: i64) -> Result<f64> {
        let now = self.time.now_ns() as f64;
        self.position_at_time(now + offset_ns as f64)
    }

    /// Fractional ring position at absolute time `time_ns`.
    pub fn position_at_time(&self, time_ns: f64) -> Result<f64> {
        let last = self.last_wrap_ns().ok_or(Error::NotReady)?;
        let bytes = (time_ns - last) / self.ns_per_byte;
        Ok(bytes.rem_euclid(self.ring_bytes as f64))
    }

    /// Most recent published (filtered) wrap time.
    pub fn last_wrap_ns(&self) -> Option<f64> {
        if self.has_wrap.load(Ordering::Acquire) {
            Some(f64::from_bits(self.published.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Whether the filter has passed bootstrap.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Wrap period implied by the nominal sample rate.
    pub fn nominal_period_ns(&self) -> f64 {
        self.ring_bytes as f64 * self.ns_per_byte
    }

    /// Wrap period currently estimated by the filter.
    pub fn filtered_period_ns(&self) -> f64 {
        self.filter.lock().interval()
    }

    /// Samples the filter has rejected as implausible.
    pub fn rejected_samples(&self) -> u64 {
        self.filter.lock().rejected()
    }

    /// Wraps reported by `direction`.
    pub fn wrap_count(&self, direction: Direction) -> u64 {
        self.wraps[direction.index()].count.load(Ordering::Relaxed)
    }

    /// Last unfiltered wrap time reported by `direction`.
    pub fn last_raw_wrap_ns(&self, direction: Direction) -> Option<f64> {
        let log = &self.wraps[direction.index()];
        if log.count.load(Ordering::Relaxed) == 0 {
            return None;
        }
        Some(f64::from_bits(log.last_bits.load(Ordering::Acquire)))
    }

    /// Direction whose wraps drive the filter.
    pub fn master(&self) -> Direction {
        self.master
    }

    /// Ring size in bytes.
    pub fn ring_bytes(&self) -> usize {
        self.ring_bytes
    }

    /// Nominal nanoseconds per ring byte.
    pub fn ns_per_byte(&self) -> f64 {
        self.ns_per_byte
    }

    /// Current time on the session clock.
    pub fn now_ns(&self) -> u64 {
        self.time.now_ns()
    }

    /// Forget every wrap and return the filter to bootstrap.
    pub fn reset(&self) {
        self.filter.lock().reset();
        self.has_wrap.store(false, Ordering::Release);
        self.locked.store(false, Ordering::Release);
        for log in &self.wraps {
            log.count.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for ClockSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSync")
            .field("ring_bytes", &self.ring_bytes)
            .field("master", &self.master)
            .field("locked", &self.is_locked())
            .field("last_wrap_ns", &self.last_wrap_ns())
            .finish_non_exhaustive()
    }
}
