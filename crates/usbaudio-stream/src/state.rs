//! Stream lifecycle, owner notifications and counters.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use crossbeam_channel::Sender;

use crate::transport::Direction;

/// Lifecycle state of a stream manager.
///
/// ```text
/// Uninitialized ─init─► Initialized ─start─► Running ─stop─► Stopping
///       ▲                    ▲                                   │
///       └──────free──────────┴────────── Stopped ◄──last list────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// No transport or buffers bound.
    Uninitialized = 0,
    /// Frame lists allocated, nothing in flight.
    Initialized = 1,
    /// Lists are cycling through the transport.
    Running = 2,
    /// Stop requested; waiting for in-flight lists to come back.
    Stopping = 3,
    /// Every list has returned; `Closed` has been sent.
    Stopped = 4,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Initialized,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Uninitialized,
        }
    }
}

/// Notification sent to the stream owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The last in-flight list of this direction has returned after a stop.
    /// Sent exactly once per stop; resources may be freed after it.
    Closed(Direction),
    /// Consecutive transfer errors exceeded the configured limit and the
    /// stream stopped itself. `Closed` follows.
    Failed(Direction),
}

/// Lock-free counters for one stream.
#[derive(Debug, Default)]
pub struct StreamStats {
    lists_completed: AtomicU64,
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    stray_bytes_stripped: AtomicU64,
    overruns: AtomicU64,
    underruns: AtomicU64,
    fallback_frames: AtomicU64,
    transport_errors: AtomicU64,
    wraps: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Completions handled.
    pub lists_completed: u64,
    /// Frames consumed from completed or gathered lists.
    pub frames_processed: u64,
    /// Frames skipped: warm-up, empty or failed packets.
    pub frames_dropped: u64,
    /// Bytes removed by the stray-leading-bytes correction.
    pub stray_bytes_stripped: u64,
    /// Frames lost because the ring was full.
    pub overruns: u64,
    /// Lists sent as silence because the ring was short.
    pub underruns: u64,
    /// Output frames sized by the nominal rate instead of the input stream.
    pub fallback_frames: u64,
    /// Failed submissions and failed transfers.
    pub transport_errors: u64,
    /// Ring wraps reported to the clock.
    pub wraps: u64,
    /// Payload bytes moved between ring and transport.
    pub bytes: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl StreamStats {
            $(
                pub(crate) fn $name(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*
        }
    };
}

counters! {
    add_lists_completed => lists_completed,
    add_frames_processed => frames_processed,
    add_frames_dropped => frames_dropped,
    add_stray_bytes => stray_bytes_stripped,
    add_overruns => overruns,
    add_underruns => underruns,
    add_fallback_frames => fallback_frames,
    add_transport_errors => transport_errors,
    add_wraps => wraps,
    add_bytes => bytes,
}

impl StreamStats {
    /// Read every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lists_completed: self.lists_completed.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            stray_bytes_stripped: self.stray_bytes_stripped.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            fallback_frames: self.fallback_frames.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            wraps: self.wraps.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Shutdown bookkeeping shared by both managers.
///
/// `in_flight` counts lists owned by the transport. The stream is closed
/// when a stop has been requested and that count reaches zero; whichever
/// context observes it first wins the `closed` flag and notifies the owner.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    direction: Direction,
    state: AtomicU8,
    stopping: AtomicBool,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    events: Sender<StreamEvent>,
}

impl Lifecycle {
    pub(crate) fn new(direction: Direction, events: Sender<StreamEvent>) -> Self {
        Self {
            direction,
            state: AtomicU8::new(StreamState::Uninitialized as u8),
            stopping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            events,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Clear shutdown flags before a (re)start.
    pub(crate) fn arm(&self) {
        self.stopping.store(false, Ordering::SeqCst);
        self.closed.store(false, Ordering::Release);
        self.in_flight.store(0, Ordering::SeqCst);
        self.set_state(StreamState::Running);
    }

    pub(crate) fn list_submitted(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// A list left the transport. On the resubmit path this runs after the
    /// replacement submission so the count only reaches zero on shutdown.
    pub(crate) fn list_retired(&self) {
        let before = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if before == 1 && self.is_stopping() {
            self.close();
        }
    }

    /// Request shutdown. Returns `false` if one was already requested.
    pub(crate) fn request_stop(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        // The last list may already have retired and closed the stream.
        let _ = self.state.compare_exchange(
            StreamState::Running as u8,
            StreamState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tracing::info!(direction = %self.direction, in_flight = self.in_flight(), "stream stopping");
        if self.in_flight() == 0 {
            self.close();
        }
        true
    }

    pub(crate) fn notify(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(direction = %self.direction, ?event, "stream owner gone");
        }
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.set_state(StreamState::Stopped);
            tracing::info!(direction = %self.direction, "stream closed");
            self.notify(StreamEvent::Closed(self.direction));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closes_once_when_last_list_returns() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let life = Lifecycle::new(Direction::Input, tx);
        life.arm();
        life.list_submitted();
        life.list_submitted();

        assert!(life.request_stop());
        assert!(!life.request_stop());
        assert_eq!(life.state(), StreamState::Stopping);

        life.list_retired();
        assert!(rx.try_recv().is_err());
        life.list_retired();
        assert_eq!(rx.try_recv(), Ok(StreamEvent::Closed(Direction::Input)));
        assert!(rx.try_recv().is_err());
        assert_eq!(life.state(), StreamState::Stopped);
    }

    #[test]
    fn stop_with_nothing_in_flight_closes_immediately() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let life = Lifecycle::new(Direction::Output, tx);
        life.arm();
        life.request_stop();
        assert_eq!(rx.try_recv(), Ok(StreamEvent::Closed(Direction::Output)));
    }

    #[test]
    fn snapshot_reads_counters() {
        let stats = StreamStats::default();
        stats.add_overruns(2);
        stats.add_wraps(1);
        let snap = stats.snapshot();
        assert_eq!(snap.overruns, 2);
        assert_eq!(snap.wraps, 1);
        assert_eq!(snap.underruns, 0);
    }
}
