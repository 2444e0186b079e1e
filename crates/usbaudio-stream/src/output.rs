//! Playback stream: isochronous writes from the output ring.
//!
//! Each frame of a write list is sized by popping one entry from the
//! [`FrameSizeQueue`] the input stream fills. Replaying the recording side's
//! packet sizes keeps playback consuming samples at exactly the device's
//! rate; when the queue is empty (no input stream, or input not yet running)
//! the nominal rate from [`FrameSizer`] stands in.
//!
//! A list's payload is taken from the ring starting at the read head. When
//! it runs past the physical end it is described by two [`RingSegment`]s and
//! the frame holding the wrap point is marked, so its completion timestamp
//! becomes a second wrap observation for [`ClockSync`]:
//!
//! ```text
//!   ring:  [ seg 1 ........ ][.... seg 0 ............]
//!          0            len1 start                   N
//!   list:  | f0 | f1 | f2 | f3 | f4 | f5 |
//!                     ▲ wrap inside f2, overshoot = bytes of f2 after N
//! ```
//!
//! A prepared list the transport refuses is parked with its payload intact
//! and resubmitted before any new list is prepared, so ring data always
//! reaches the device in the order it was read.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use usbaudio_core::{BusSpeed, Error as Status, FrameSizeQueue, FrameSizer, StreamFormat};

use crate::clock::ClockSync;
use crate::state::{Lifecycle, StatsSnapshot, StreamEvent, StreamState, StreamStats};
use crate::transport::{
    Completion, Direction, FrameDescriptor, FrameList, FrameStatus, RingSegment,
    SharedFrameList, Submission, TransferStatus, Transport, TransportError,
};
use crate::{Result, SharedRing};

/// Output stream settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    /// Format of the playback endpoint.
    pub format: StreamFormat,
    /// Bus speed, fixing the packet interval.
    pub bus: BusSpeed,
    /// Lists allocated.
    pub frame_lists: usize,
    /// Lists kept in flight (queue depth); at most `frame_lists`.
    pub lists_in_flight: usize,
    /// Packets per list.
    pub frames_per_list: usize,
    /// Failed transfers in a row after which the stream stops itself.
    pub max_consecutive_errors: Option<u32>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: StreamFormat::default(),
            bus: BusSpeed::Full,
            frame_lists: 4,
            lists_in_flight: 4,
            frames_per_list: 8,
            max_consecutive_errors: None,
        }
    }
}

impl OutputConfig {
    fn validate(&self) -> Result<()> {
        if !self.format.is_valid()
            || self.frame_lists == 0
            || self.frames_per_list == 0
            || self.lists_in_flight == 0
            || self.lists_in_flight > self.frame_lists
        {
            return Err(Status::BadArgument.into());
        }
        Ok(())
    }
}

/// Frame of a write list in which the ring's read head wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapMark {
    /// Index of the frame containing the wrap point.
    pub frame: usize,
    /// Bytes of that frame taken from after the wrap.
    pub overshoot: usize,
}

/// Summary of one prepared write list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedList {
    /// List index.
    pub list_index: usize,
    /// Total payload bytes.
    pub bytes: usize,
    /// Ring spans the payload came from; empty for silence.
    pub segments: Vec<RingSegment>,
    /// Where the ring wrapped, if it did.
    pub wrap: Option<WrapMark>,
    /// The ring held too little data and the list carries zeros.
    pub silent: bool,
    /// Frames sized by the nominal rate because the queue was empty.
    pub fallback_frames: usize,
}

impl PreparedList {
    /// Whether the completion timestamp must be captured as a wrap time.
    pub fn captures_timestamp(&self) -> bool {
        self.wrap.is_some()
    }
}

/// First frame whose cumulative size reaches `until_end` bytes.
fn locate_wrap(frames: &[FrameDescriptor], until_end: usize) -> Option<WrapMark> {
    let mut cumulative = 0;
    for (frame, descriptor) in frames.iter().enumerate() {
        cumulative += descriptor.requested as usize;
        if cumulative >= until_end {
            return Some(WrapMark {
                frame,
                overshoot: cumulative - until_end,
            });
        }
    }
    None
}

struct OutputEngine {
    transport: Arc<dyn Transport>,
    ring: SharedRing,
    clock: Arc<ClockSync>,
    frame_sizes: Option<Arc<FrameSizeQueue>>,
    lists: Vec<SharedFrameList>,
    /// Pending timestamp capture per list.
    wraps: Vec<Option<WrapMark>>,
    /// Lists held by the transport, in submission order.
    pending: VecDeque<usize>,
    /// Prepared lists the transport refused, oldest first.
    parked: VecDeque<usize>,
    /// Where the search for the next free list starts.
    cursor: usize,
    sizer: FrameSizer,
    consecutive_errors: u32,
    /// Inside a run of underruns; only the first one is logged.
    underrunning: bool,
}

impl OutputEngine {
    /// Next list neither held by the transport nor parked, in rotation.
    fn claim_free(&mut self) -> Option<usize> {
        let n = self.lists.len();
        let index = (0..n)
            .map(|k| (self.cursor + k) % n)
            .find(|i| !self.pending.contains(i) && !self.parked.contains(i))?;
        self.cursor = (index + 1) % n;
        Some(index)
    }

    fn rewind(&mut self) {
        self.pending.clear();
        self.parked.clear();
        self.cursor = 0;
        self.wraps.iter_mut().for_each(|w| *w = None);
        self.sizer.reset();
        self.consecutive_errors = 0;
        self.underrunning = false;
    }
}

/// Drives isochronous writes for the playback direction.
pub struct OutputStreamManager {
    config: OutputConfig,
    max_packet: u32,
    life: Lifecycle,
    stats: StreamStats,
    engine: Mutex<Option<OutputEngine>>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
}

impl OutputStreamManager {
    /// Create an unbound manager. Lifecycle events go to `events`.
    pub fn new(config: OutputConfig, events: Sender<StreamEvent>) -> Self {
        let (completion_tx, completion_rx) =
            crossbeam_channel::bounded(config.lists_in_flight.max(1));
        let max_packet = config.format.max_packet_bytes(config.bus) as u32;
        Self {
            config,
            max_packet,
            life: Lifecycle::new(Direction::Output, events),
            stats: StreamStats::default(),
            engine: Mutex::new(None),
            completion_tx,
            completion_rx,
        }
    }

    /// Bind the transport, ring and clock and allocate the frame lists.
    pub fn init(
        &self,
        transport: Arc<dyn Transport>,
        ring: SharedRing,
        clock: Arc<ClockSync>,
    ) -> Result<()> {
        let mut guard = self.engine.lock();
        if guard.is_some() {
            return Err(Status::NotReady.into());
        }
        self.config.validate()?;
        if !transport.is_open(Direction::Output) {
            return Err(Status::NotOpen.into());
        }
        if !ring.lock().is_initialized() {
            return Err(Status::NotReady.into());
        }

        let mut lists = Vec::with_capacity(self.config.frame_lists);
        for _ in 0..self.config.frame_lists {
            let list = FrameList::try_new(self.config.frames_per_list, self.max_packet as usize)?;
            lists.push(Arc::new(Mutex::new(list)));
        }

        *guard = Some(OutputEngine {
            transport,
            ring,
            clock,
            frame_sizes: None,
            wraps: vec![None; lists.len()],
            lists,
            pending: VecDeque::with_capacity(self.config.lists_in_flight),
            parked: VecDeque::new(),
            cursor: 0,
            sizer: FrameSizer::new(&self.config.format, self.config.bus),
            consecutive_errors: 0,
            underrunning: false,
        });
        self.life.set_state(StreamState::Initialized);
        tracing::info!(
            lists = self.config.frame_lists,
            depth = self.config.lists_in_flight,
            frames = self.config.frames_per_list,
            "output stream initialized"
        );
        Ok(())
    }

    /// Prepare and submit the first `lists_in_flight` lists.
    ///
    /// `frame_sizes` is the queue filled by the input stream; with `None`
    /// every frame is sized from the nominal rate.
    pub fn start(&self, frame_sizes: Option<Arc<FrameSizeQueue>>) -> Result<()> {
        let mut guard = self.engine.lock();
        let engine = guard.as_mut().ok_or(Status::NotReady)?;
        if !matches!(
            self.life.state(),
            StreamState::Initialized | StreamState::Stopped
        ) {
            return Err(Status::NotReady.into());
        }

        engine.frame_sizes = frame_sizes;
        engine.rewind();
        self.life.arm();
        tracing::info!(
            depth = self.config.lists_in_flight,
            implicit_sync = engine.frame_sizes.is_some(),
            "output stream starting"
        );
        for _ in 0..self.config.lists_in_flight {
            let index = engine.claim_free().ok_or(Status::BadArgument)?;
            self.prepare(engine, index);
            if let Err(err) = self.submit(engine, index) {
                self.stats.add_transport_errors(1);
                tracing::error!(list = index, error = %err, "output start failed");
                self.life.request_stop();
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Request shutdown without waiting. See
    /// [`InputStreamManager::stop`](crate::InputStreamManager::stop).
    pub fn stop(&self) -> Result<()> {
        match self.life.state() {
            StreamState::Running => {
                self.life.request_stop();
                Ok(())
            }
            StreamState::Stopping | StreamState::Stopped => Ok(()),
            StreamState::Uninitialized | StreamState::Initialized => Err(Status::NotReady.into()),
        }
    }

    /// Release the frame lists. Fails with `StillOpen` until closed.
    pub fn free(&self) -> Result<()> {
        match self.life.state() {
            StreamState::Running | StreamState::Stopping => Err(Status::StillOpen.into()),
            StreamState::Uninitialized => Err(Status::NotReady.into()),
            StreamState::Initialized | StreamState::Stopped => {
                self.engine.lock().take();
                while self.completion_rx.try_recv().is_ok() {}
                self.life.set_state(StreamState::Uninitialized);
                tracing::info!("output stream freed");
                Ok(())
            }
        }
    }

    /// Size and fill list `list_index` from the queue and the ring.
    ///
    /// Consumes ring data and queue entries; used by the completion path,
    /// public for inspection and tests. Only allowed while no list is in
    /// flight (`Initialized` or `Stopped`); otherwise `NotReady`.
    pub fn prepare_frame_list(&self, list_index: usize) -> Result<PreparedList> {
        let mut guard = self.engine.lock();
        let engine = guard.as_mut().ok_or(Status::NotReady)?;
        if !matches!(
            self.life.state(),
            StreamState::Initialized | StreamState::Stopped
        ) {
            return Err(Status::NotReady.into());
        }
        if list_index >= engine.lists.len() {
            return Err(Status::BadArgument.into());
        }
        Ok(self.prepare(engine, list_index))
    }

    /// Wait up to `timeout` for a completion, then handle it and any others
    /// already queued. Returns the number handled.
    pub fn pump(&self, timeout: Duration) -> Result<usize> {
        self.retry_parked();
        let Ok(completion) = self.completion_rx.recv_timeout(timeout) else {
            return Ok(0);
        };
        let first = self.handle_completion(completion);
        let rest = self.process_pending();
        first?;
        Ok(1 + rest?)
    }

    /// Retry parked lists, then handle every completion already queued
    /// without blocking. The first error is returned after the queue is
    /// empty.
    pub fn process_pending(&self) -> Result<usize> {
        self.retry_parked();
        let mut handled = 0;
        let mut first_err = None;
        while let Ok(completion) = self.completion_rx.try_recv() {
            if let Err(err) = self.handle_completion(completion) {
                first_err.get_or_insert(err);
            }
            handled += 1;
        }
        first_err.map_or(Ok(handled), Err)
    }

    /// Process one transport completion.
    pub fn handle_completion(&self, completion: Completion) -> Result<()> {
        let mut guard = self.engine.lock();
        let Some(engine) = guard.as_mut() else {
            tracing::warn!(list = completion.list_index, "completion for unbound output stream");
            return Ok(());
        };
        let index = completion.list_index;
        if index >= engine.lists.len() {
            return Err(Status::BadArgument.into());
        }
        match engine.pending.front().copied() {
            Some(front) if front == index => {
                engine.pending.pop_front();
            }
            expected => {
                tracing::warn!(?expected, list = index, "output completion out of order");
                engine.pending.retain(|&i| i != index);
            }
        }
        self.stats.add_lists_completed(1);
        self.stats
            .add_frames_processed(self.config.frames_per_list as u64);

        match &completion.status {
            TransferStatus::Complete => engine.consecutive_errors = 0,
            TransferStatus::Aborted if self.life.is_stopping() => {
                tracing::debug!(list = index, "output list aborted during stop");
            }
            TransferStatus::Aborted => {
                tracing::warn!(list = index, "output list aborted");
            }
            TransferStatus::Failed(err) => {
                // Counted and resubmitted like reads; the give-up limit
                // escalates persistent failures.
                self.stats.add_transport_errors(1);
                engine.consecutive_errors += 1;
                tracing::warn!(list = index, error = %err, "output transfer failed");
            }
        }

        if let Some(mark) = engine.wraps[index].take() {
            self.stats.add_wraps(1);
            let stamp = {
                let list = engine.lists[index].lock();
                list.frames
                    .get(mark.frame)
                    .filter(|f| f.status == FrameStatus::Complete)
                    .map(|f| f.timestamp_ns)
            };
            if let Some(ts) = stamp {
                let wrap_ns = ts as f64 - mark.overshoot as f64 * engine.clock.ns_per_byte();
                engine.clock.record_wrap(Direction::Output, wrap_ns);
            }
        }

        tracing::debug!(list = index, "output list complete");
        self.check_error_limit(engine.consecutive_errors);

        if self.life.is_stopping() {
            self.life.list_retired();
            return Ok(());
        }

        let refilled = self.refill(engine);
        // Retire only after the replacement is counted.
        self.life.list_retired();
        refilled.map_err(Into::into)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.life.state()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Lists currently owned by the transport.
    pub fn in_flight(&self) -> usize {
        self.life.in_flight()
    }

    /// Largest payload of one frame.
    pub fn max_packet_bytes(&self) -> usize {
        self.max_packet as usize
    }

    /// Active configuration.
    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    fn prepare(&self, engine: &mut OutputEngine, index: usize) -> PreparedList {
        let list = Arc::clone(&engine.lists[index]);
        let mut list = list.lock();
        let FrameList {
            frames,
            buffer,
            segments,
        } = &mut *list;

        let mut fallback = 0;
        let mut total = 0;
        for frame in frames.iter_mut() {
            let queued = engine.frame_sizes.as_ref().and_then(|q| q.pop());
            let bytes = match queued {
                Some(bytes) => bytes.min(self.max_packet),
                None => {
                    fallback += 1;
                    engine.sizer.next_bytes()
                }
            };
            *frame = FrameDescriptor {
                requested: bytes,
                ..FrameDescriptor::default()
            };
            total += bytes as usize;
        }
        if fallback > 0 {
            self.stats.add_fallback_frames(fallback as u64);
        }

        buffer.clear();
        buffer.resize(total, 0);
        segments.clear();

        let mut ring = engine.ring.lock();
        let start = ring.read_index();
        let until_end = ring.capacity() - start;
        let mut wrap = None;
        let silent = ring.available() < total;

        if silent {
            self.stats.add_underruns(1);
            if !engine.underrunning {
                engine.underrunning = true;
                tracing::warn!(
                    list = index,
                    bytes = total,
                    available = ring.available(),
                    "output ring underrun, sending silence"
                );
            }
        } else if let Err(err) = ring.pop_slice(buffer) {
            tracing::warn!(list = index, error = %err, "output ring pop failed");
        } else {
            engine.underrunning = false;
            if total > until_end {
                segments.push(RingSegment {
                    offset: start,
                    len: until_end,
                });
                segments.push(RingSegment {
                    offset: 0,
                    len: total - until_end,
                });
            } else {
                segments.push(RingSegment {
                    offset: start,
                    len: total,
                });
            }
            if total >= until_end {
                wrap = locate_wrap(frames, until_end);
            }
            self.stats.add_bytes(total as u64);
        }
        engine.wraps[index] = wrap;

        tracing::trace!(
            list = index,
            bytes = total,
            segments = segments.len(),
            fallback,
            "output list prepared"
        );
        PreparedList {
            list_index: index,
            bytes: total,
            segments: segments.clone(),
            wrap,
            silent,
            fallback_frames: fallback,
        }
    }

    fn submit(
        &self,
        engine: &mut OutputEngine,
        index: usize,
    ) -> std::result::Result<(), TransportError> {
        self.life.list_submitted();
        let submission = Submission {
            direction: Direction::Output,
            list_index: index,
            first_frame: None,
            list: Arc::clone(&engine.lists[index]),
            completion: self.completion_tx.clone(),
        };
        match engine.transport.submit_write(submission) {
            Ok(()) => {
                engine.pending.push_back(index);
                Ok(())
            }
            Err(err) => {
                self.life.list_retired();
                Err(err)
            }
        }
    }

    /// Bring the transport back to `lists_in_flight` lists: parked lists
    /// first, in order, then freshly prepared ones. Stops at the first
    /// refusal, parking the refused list.
    fn refill(&self, engine: &mut OutputEngine) -> std::result::Result<(), TransportError> {
        while let Some(&index) = engine.parked.front() {
            if let Err(err) = self.submit(engine, index) {
                self.refused(engine, index, &err);
                return Err(err);
            }
            engine.parked.pop_front();
        }
        while engine.pending.len() < self.config.lists_in_flight {
            let Some(index) = engine.claim_free() else {
                break;
            };
            self.prepare(engine, index);
            if let Err(err) = self.submit(engine, index) {
                engine.parked.push_back(index);
                self.refused(engine, index, &err);
                return Err(err);
            }
        }
        Ok(())
    }

    fn refused(&self, engine: &mut OutputEngine, index: usize, err: &TransportError) {
        self.stats.add_transport_errors(1);
        engine.consecutive_errors += 1;
        tracing::error!(
            list = index,
            parked = engine.parked.len(),
            error = %err,
            "output resubmit refused"
        );
        self.check_error_limit(engine.consecutive_errors);
    }

    fn retry_parked(&self) {
        let mut guard = self.engine.lock();
        let Some(engine) = guard.as_mut() else {
            return;
        };
        if engine.parked.is_empty() {
            return;
        }
        if self.life.state() != StreamState::Running {
            engine.parked.clear();
            return;
        }
        // Refusals are counted and logged inside; the list stays parked.
        let _ = self.refill(engine);
    }

    fn check_error_limit(&self, consecutive: u32) {
        let Some(limit) = self.config.max_consecutive_errors else {
            return;
        };
        if consecutive >= limit && !self.life.is_stopping() {
            tracing::error!(consecutive, "output stream giving up after repeated errors");
            self.life.notify(StreamEvent::Failed(Direction::Output));
            self.life.request_stop();
        }
    }
}

impl std::fmt::Debug for OutputStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStreamManager")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
