//! Recording stream: isochronous reads into the input ring.
//!
//! Every configured frame list is submitted at [`start`]; each completion
//! copies the payload of every good frame into the ring, pushes its byte
//! count into the [`FrameSizeQueue`] for the playback side and immediately
//! resubmits the same list. The ring's wrap notifications are forwarded to
//! [`ClockSync`] with the wrap time interpolated inside the frame that
//! crossed the end.
//!
//! A resubmission the transport refuses parks the list; parked lists are
//! retried on every later completion and on every [`process_pending`] or
//! [`pump`] call until accepted, the stream stops, or the error limit trips.
//!
//! There is no backpressure: if the host does not drain the ring fast
//! enough, frames are dropped with [`Overrun`](usbaudio_core::Error::Overrun)
//! and the stream keeps running.
//!
//! [`start`]: InputStreamManager::start
//! [`process_pending`]: InputStreamManager::process_pending
//! [`pump`]: InputStreamManager::pump

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use usbaudio_core::{BusSpeed, Error as Status, FrameSizeQueue, StreamFormat, WrapEvent};

use crate::clock::ClockSync;
use crate::state::{Lifecycle, StatsSnapshot, StreamEvent, StreamState, StreamStats};
use crate::transport::{
    Completion, Direction, FrameList, FrameStatus, SharedFrameList, Submission, TransferStatus,
    Transport, TransportError,
};
use crate::{Result, SharedRing};

/// Bytes some host controllers prepend to an input packet.
const STRAY_LEADING_BYTES: usize = 4;

/// Input stream settings.
#[derive(Debug, Clone, PartialEq)]
pub struct InputConfig {
    /// Format of the recording endpoint.
    pub format: StreamFormat,
    /// Bus speed, fixing the packet interval.
    pub bus: BusSpeed,
    /// Lists kept in flight.
    pub frame_lists: usize,
    /// Packets per list.
    pub frames_per_list: usize,
    /// Frames discarded after every start; some devices send garbage first.
    pub drop_initial_frames: u32,
    /// Discard the 4 stray leading bytes some host controllers prepend.
    pub strip_stray_leading_bytes: bool,
    /// Failed transfers in a row after which the stream stops itself.
    pub max_consecutive_errors: Option<u32>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            format: StreamFormat::default(),
            bus: BusSpeed::Full,
            frame_lists: 4,
            frames_per_list: 8,
            drop_initial_frames: 0,
            strip_stray_leading_bytes: true,
            max_consecutive_errors: None,
        }
    }
}

impl InputConfig {
    fn validate(&self) -> Result<()> {
        if !self.format.is_valid() || self.frame_lists == 0 || self.frames_per_list == 0 {
            return Err(Status::BadArgument.into());
        }
        Ok(())
    }
}

/// A packet length carrying the stray 4-byte prefix: `len % 6 == 4` and not
/// a whole number of audio frames.
fn has_stray_prefix(len: usize, bytes_per_frame: usize) -> bool {
    len > STRAY_LEADING_BYTES && len % 6 == 4 && len % bytes_per_frame != 0
}

struct InputEngine {
    transport: Arc<dyn Transport>,
    ring: SharedRing,
    frame_sizes: Arc<FrameSizeQueue>,
    lists: Vec<SharedFrameList>,
    /// Frames of each list already handed to the ring by `gather`.
    consumed: Vec<usize>,
    /// Lists held by the transport, in submission order.
    pending: VecDeque<usize>,
    /// Lists the transport refused, waiting for a retry.
    parked: VecDeque<usize>,
    /// Frames examined since start, for the warm-up drop.
    frames_seen: u64,
    consecutive_errors: u32,
    /// Inside a run of overruns; only the first one is logged.
    overrunning: bool,
}

impl InputEngine {
    fn rewind(&mut self) {
        self.pending.clear();
        self.parked.clear();
        self.consumed.iter_mut().for_each(|c| *c = 0);
        self.frames_seen = 0;
        self.consecutive_errors = 0;
        self.overrunning = false;
    }
}

/// Drives isochronous reads for the recording direction.
pub struct InputStreamManager {
    config: InputConfig,
    max_packet: u32,
    life: Lifecycle,
    stats: Arc<StreamStats>,
    engine: Mutex<Option<InputEngine>>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
}

impl InputStreamManager {
    /// Create an unbound manager. Lifecycle events go to `events`.
    pub fn new(config: InputConfig, events: Sender<StreamEvent>) -> Self {
        let (completion_tx, completion_rx) = crossbeam_channel::bounded(config.frame_lists.max(1));
        let max_packet = config.format.max_packet_bytes(config.bus) as u32;
        Self {
            config,
            max_packet,
            life: Lifecycle::new(Direction::Input, events),
            stats: Arc::new(StreamStats::default()),
            engine: Mutex::new(None),
            completion_tx,
            completion_rx,
        }
    }

    /// Bind the transport and buffers and allocate the frame lists.
    ///
    /// Installs a wrap observer on `ring` that reports wraps to `clock`.
    pub fn init(
        &self,
        transport: Arc<dyn Transport>,
        ring: SharedRing,
        frame_sizes: Arc<FrameSizeQueue>,
        clock: Arc<ClockSync>,
    ) -> Result<()> {
        let mut guard = self.engine.lock();
        if guard.is_some() {
            return Err(Status::NotReady.into());
        }
        self.config.validate()?;
        if !transport.is_open(Direction::Input) {
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

        let stats = Arc::clone(&self.stats);
        let ns_per_byte = clock.ns_per_byte();
        ring.lock().set_wrap_observer(Box::new(move |event: WrapEvent| {
            stats.add_wraps(1);
            if let Some(ts) = event.timestamp_ns {
                let wrap_ns = ts as f64 - event.overshoot as f64 * ns_per_byte;
                clock.record_wrap(Direction::Input, wrap_ns);
            }
        }));

        *guard = Some(InputEngine {
            transport,
            ring,
            frame_sizes,
            consumed: vec![0; lists.len()],
            lists,
            pending: VecDeque::with_capacity(self.config.frame_lists),
            parked: VecDeque::new(),
            frames_seen: 0,
            consecutive_errors: 0,
            overrunning: false,
        });
        self.life.set_state(StreamState::Initialized);
        tracing::info!(
            lists = self.config.frame_lists,
            frames = self.config.frames_per_list,
            max_packet = self.max_packet,
            "input stream initialized"
        );
        Ok(())
    }

    /// Submit every frame list and enter `Running`.
    ///
    /// Allowed from `Initialized` and, for a restart, from `Stopped`.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.engine.lock();
        let engine = guard.as_mut().ok_or(Status::NotReady)?;
        if !matches!(
            self.life.state(),
            StreamState::Initialized | StreamState::Stopped
        ) {
            return Err(Status::NotReady.into());
        }

        engine.rewind();
        self.life.arm();
        tracing::info!(lists = engine.lists.len(), "input stream starting");
        for index in 0..engine.lists.len() {
            if let Err(err) = self.submit(engine, index) {
                self.stats.add_transport_errors(1);
                tracing::error!(list = index, error = %err, "input start failed");
                self.life.request_stop();
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Request shutdown without waiting.
    ///
    /// Lists already in flight drain naturally; [`StreamEvent::Closed`] is
    /// sent when the last one returns.
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

    /// Release the frame lists and unbind the transport.
    ///
    /// Fails with `StillOpen` until the stream has closed.
    pub fn free(&self) -> Result<()> {
        match self.life.state() {
            StreamState::Running | StreamState::Stopping => Err(Status::StillOpen.into()),
            StreamState::Uninitialized => Err(Status::NotReady.into()),
            StreamState::Initialized | StreamState::Stopped => {
                if let Some(engine) = self.engine.lock().take() {
                    engine.ring.lock().clear_wrap_observer();
                }
                while self.completion_rx.try_recv().is_ok() {}
                self.life.set_state(StreamState::Uninitialized);
                tracing::info!("input stream freed");
                Ok(())
            }
        }
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
    /// without blocking.
    ///
    /// A failing completion does not hold up the ones behind it; the first
    /// error is returned once the queue is empty.
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
    ///
    /// Normally called through [`pump`](Self::pump); public for transports
    /// that prefer to call back directly.
    pub fn handle_completion(&self, completion: Completion) -> Result<()> {
        let mut guard = self.engine.lock();
        let Some(engine) = guard.as_mut() else {
            tracing::warn!(list = completion.list_index, "completion for unbound input stream");
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
                tracing::warn!(?expected, list = index, "input completion out of order");
                engine.pending.retain(|&i| i != index);
            }
        }
        self.stats.add_lists_completed(1);

        match &completion.status {
            TransferStatus::Complete => engine.consecutive_errors = 0,
            TransferStatus::Aborted if self.life.is_stopping() => {
                tracing::debug!(list = index, "input list aborted during stop");
            }
            TransferStatus::Aborted => {
                tracing::warn!(list = index, "input list aborted");
            }
            TransferStatus::Failed(err) => {
                self.stats.add_transport_errors(1);
                engine.consecutive_errors += 1;
                tracing::warn!(list = index, error = %err, "input transfer failed");
            }
        }

        let (frames, bytes) = self.drain_list(engine, index, true);
        engine.consumed[index] = 0;
        tracing::debug!(list = index, frames, bytes, "input list complete");

        self.check_error_limit(engine.consecutive_errors);

        if self.life.is_stopping() {
            self.life.list_retired();
            return Ok(());
        }
        engine.parked.push_back(index);
        let resubmitted = self.resubmit_parked(engine);
        // Retire only after the replacement is counted.
        self.life.list_retired();
        resubmitted.map_err(Into::into)
    }

    /// Move frames the transport has already finished in the current list
    /// into the ring, ahead of the list's completion.
    ///
    /// Returns the number of bytes pushed.
    pub fn gather(&self) -> Result<usize> {
        let mut guard = self.engine.lock();
        let engine = guard.as_mut().ok_or(Status::NotReady)?;
        if self.life.state() != StreamState::Running {
            return Ok(0);
        }
        let Some(&index) = engine.pending.front() else {
            return Ok(0);
        };
        let (frames, bytes) = self.drain_list(engine, index, false);
        engine.consumed[index] += frames;
        if frames > 0 {
            tracing::trace!(list = index, frames, bytes, "input gathered");
        }
        Ok(bytes)
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

    /// Size of each frame slot.
    pub fn max_packet_bytes(&self) -> usize {
        self.max_packet as usize
    }

    /// Active configuration.
    pub fn config(&self) -> &InputConfig {
        &self.config
    }

    fn submit(
        &self,
        engine: &mut InputEngine,
        index: usize,
    ) -> std::result::Result<(), TransportError> {
        let list = Arc::clone(&engine.lists[index]);
        list.lock().reset_for_read(self.max_packet);
        self.life.list_submitted();
        let submission = Submission {
            direction: Direction::Input,
            list_index: index,
            first_frame: None,
            list,
            completion: self.completion_tx.clone(),
        };
        match engine.transport.submit_read(submission) {
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

    /// Submit parked lists in order, stopping at the first refusal.
    fn resubmit_parked(&self, engine: &mut InputEngine) -> std::result::Result<(), TransportError> {
        while let Some(&index) = engine.parked.front() {
            if let Err(err) = self.submit(engine, index) {
                self.stats.add_transport_errors(1);
                engine.consecutive_errors += 1;
                tracing::error!(
                    list = index,
                    parked = engine.parked.len(),
                    error = %err,
                    "input resubmit refused"
                );
                self.check_error_limit(engine.consecutive_errors);
                return Err(err);
            }
            engine.parked.pop_front();
        }
        Ok(())
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
        let _ = self.resubmit_parked(engine);
    }

    /// Push frames `consumed[index]..` of list `index` into the ring.
    ///
    /// With `complete` unset, stops at the first frame the transport has not
    /// finished; otherwise unfinished frames are counted as dropped.
    /// Returns frames examined and bytes pushed.
    fn drain_list(&self, engine: &mut InputEngine, index: usize, complete: bool) -> (usize, usize) {
        let list = Arc::clone(&engine.lists[index]);
        let list = list.lock();
        let mut ring = engine.ring.lock();
        let bytes_per_frame = self.config.format.bytes_per_frame();
        let start = engine.consumed[index];
        let mut frames = 0;
        let mut pushed = 0;

        for i in start..list.frames.len() {
            let frame = list.frames[i];
            if !frame.is_final() && !complete {
                break;
            }
            frames += 1;
            engine.frames_seen += 1;

            if engine.frames_seen <= u64::from(self.config.drop_initial_frames)
                || frame.status != FrameStatus::Complete
                || frame.actual == 0
            {
                self.stats.add_frames_dropped(1);
                continue;
            }

            let mut data = list.frame_data(i);
            if self.config.strip_stray_leading_bytes
                && has_stray_prefix(data.len(), bytes_per_frame)
            {
                data = &data[STRAY_LEADING_BYTES..];
                self.stats.add_stray_bytes(STRAY_LEADING_BYTES as u64);
            }

            match ring.push_slice(data, frame.timestamp_ns) {
                Ok(()) => {
                    engine.overrunning = false;
                    pushed += data.len();
                }
                Err(Status::Overrun) => {
                    self.stats.add_overruns(1);
                    if !engine.overrunning {
                        engine.overrunning = true;
                        tracing::warn!(
                            list = index,
                            bytes = data.len(),
                            vacant = ring.vacant(),
                            "input ring overrun, dropping frames"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(list = index, error = %err, "input ring push failed");
                }
            }
            engine.frame_sizes.push(data.len() as u32);
            self.stats.add_frames_processed(1);
        }

        self.stats.add_bytes(pushed as u64);
        (frames, pushed)
    }

    fn check_error_limit(&self, consecutive: u32) {
        let Some(limit) = self.config.max_consecutive_errors else {
            return;
        };
        if consecutive >= limit && !self.life.is_stopping() {
            tracing::error!(consecutive, "input stream giving up after repeated errors");
            self.life.notify(StreamEvent::Failed(Direction::Input));
            self.life.request_stop();
        }
    }
}

impl std::fmt::Debug for InputStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStreamManager")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
