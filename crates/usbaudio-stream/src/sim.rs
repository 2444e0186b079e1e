//! Deterministic in-process device implementing [`Transport`].
//!
//! Time is virtual: nothing happens until the owner steps the device.
//! [`run_interval`](SimulatedDevice::run_interval) advances the bus by one
//! interval, servicing one frame of the oldest queued list in each
//! direction and stamping it with the end of the interval. Lists complete
//! once their last frame is serviced.
//!
//! The device has its own sample clock (`clock_ppm` away from nominal), so
//! input packet sizes drift from the nominal pattern exactly as a real
//! device's would. Input payloads are a running byte counter, which makes
//! loss and reordering visible in tests.
//!
//! Faults can be injected per direction: failed lists, closed endpoints,
//! rejected submissions and the 4-byte stray prefix some host controllers
//! add to input packets.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use usbaudio_core::{BusSpeed, StreamFormat};

use crate::clock::{ManualClock, TimeSource};
use crate::transport::{
    Completion, Direction, FrameStatus, Submission, TransferStatus, Transport, TransportError,
};

const STRAY_PREFIX: [u8; 4] = [0xEE; 4];

/// Simulated device settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Format of both endpoints.
    pub format: StreamFormat,
    /// Bus speed.
    pub bus: BusSpeed,
    /// Device sample clock error in parts per million (positive is fast).
    pub clock_ppm: f64,
    /// Uniform jitter applied to frame timestamps, in nanoseconds either way.
    pub timestamp_jitter_ns: u64,
    /// Seed for the jitter generator.
    pub seed: u64,
    /// Whether the recording endpoint exists.
    pub input_open: bool,
    /// Whether the playback endpoint exists.
    pub output_open: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            format: StreamFormat::default(),
            bus: BusSpeed::Full,
            clock_ppm: 0.0,
            timestamp_jitter_ns: 0,
            seed: 0x5eed,
            input_open: true,
            output_open: true,
        }
    }
}

#[derive(Debug)]
struct Queued {
    submission: Submission,
    next_frame: usize,
}

#[derive(Debug)]
struct SimState {
    frame: u64,
    open: [bool; 2],
    queues: [VecDeque<Queued>; 2],
    failing: [u32; 2],
    reject: [VecDeque<TransportError>; 2],
    starved: [u64; 2],
    rng: StdRng,
    /// Fractional device samples carried to the next interval.
    carry: f64,
    pattern: u8,
    stray_prefix: bool,
    capture: bool,
    captured: Vec<u8>,
    bytes_written: u64,
}

/// A virtual USB audio device with one input and one output endpoint.
#[derive(Debug)]
pub struct SimulatedDevice {
    config: SimConfig,
    clock: Arc<ManualClock>,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    /// Create a device at bus frame 0, time 0.
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            frame: 0,
            open: [config.input_open, config.output_open],
            queues: Default::default(),
            failing: [0; 2],
            reject: Default::default(),
            starved: [0; 2],
            rng: StdRng::seed_from_u64(config.seed),
            carry: 0.0,
            pattern: 0,
            stray_prefix: false,
            capture: false,
            captured: Vec::new(),
            bytes_written: 0,
        };
        Self {
            config,
            clock: Arc::new(ManualClock::new(0)),
            state: Mutex::new(state),
        }
    }

    /// The device's time base, to share with [`ClockSync`](crate::ClockSync).
    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }

    /// Device configuration.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Advance one bus interval, servicing one frame per direction.
    pub fn run_interval(&self) {
        let mut state = self.state.lock();
        state.frame += 1;
        let now = state.frame * self.config.bus.interval_ns();
        self.clock.set(now);

        let input_bytes = self.device_packet_bytes(&mut state);
        for direction in Direction::ALL {
            self.service(&mut state, direction, input_bytes, now);
        }
    }

    /// Run `intervals` bus intervals.
    pub fn run(&self, intervals: u64) {
        for _ in 0..intervals {
            self.run_interval();
        }
    }

    /// Service up to `frames` frames of `direction`'s queue at the current
    /// time without advancing it. Returns the frames serviced.
    pub fn advance_frames(&self, direction: Direction, frames: usize) -> usize {
        let mut state = self.state.lock();
        let now = self.clock.now_ns();
        let mut serviced = 0;
        while serviced < frames {
            let input_bytes = match direction {
                Direction::Input => self.device_packet_bytes(&mut state),
                Direction::Output => 0,
            };
            if !self.service(&mut state, direction, input_bytes, now) {
                break;
            }
            serviced += 1;
        }
        serviced
    }

    /// Finish the oldest queued list of `direction` immediately.
    ///
    /// Returns `false` if nothing was queued.
    pub fn complete_next(&self, direction: Direction) -> bool {
        let remaining = {
            let state = self.state.lock();
            match state.queues[direction.index()].front() {
                Some(queued) => queued.submission.list.lock().frames.len() - queued.next_frame,
                None => return false,
            }
        };
        self.advance_frames(direction, remaining);
        true
    }

    /// Complete every queued list as aborted, as a device does when its
    /// interface is torn down.
    pub fn abort_all(&self) {
        let mut state = self.state.lock();
        for direction in Direction::ALL {
            while let Some(queued) = state.queues[direction.index()].pop_front() {
                {
                    let mut list = queued.submission.list.lock();
                    for frame in list.frames.iter_mut().skip(queued.next_frame) {
                        frame.status = FrameStatus::Aborted;
                        frame.actual = 0;
                    }
                }
                Self::complete(queued, TransferStatus::Aborted);
            }
        }
    }

    /// Lists of `direction` waiting in the device.
    pub fn queued(&self, direction: Direction) -> usize {
        self.state.lock().queues[direction.index()].len()
    }

    /// Open or close an endpoint.
    pub fn set_open(&self, direction: Direction, open: bool) {
        self.state.lock().open[direction.index()] = open;
    }

    /// Make the next `lists` lists of `direction` complete with an error.
    pub fn fail_next_lists(&self, direction: Direction, lists: u32) {
        self.state.lock().failing[direction.index()] += lists;
    }

    /// Refuse the next submission of `direction` with `error`.
    ///
    /// Calls queue up: three calls refuse the next three submissions.
    pub fn reject_next_submission(&self, direction: Direction, error: TransportError) {
        self.state.lock().reject[direction.index()].push_back(error);
    }

    /// Prefix every input packet with 4 stray bytes.
    pub fn set_stray_prefix(&self, enabled: bool) {
        self.state.lock().stray_prefix = enabled;
    }

    /// Record every output payload for [`take_output`](Self::take_output).
    pub fn capture_output(&self, enabled: bool) {
        self.state.lock().capture = enabled;
    }

    /// Output payload recorded since the last call.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().captured)
    }

    /// Total bytes transmitted on the output endpoint.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Intervals in which `direction` had no list queued.
    pub fn starved_intervals(&self, direction: Direction) -> u64 {
        self.state.lock().starved[direction.index()]
    }

    /// Bytes the device's sample clock produces in the next interval.
    fn device_packet_bytes(&self, state: &mut SimState) -> usize {
        let format = &self.config.format;
        let per_interval = f64::from(format.sample_rate) * (1.0 + self.config.clock_ppm * 1e-6)
            / f64::from(self.config.bus.intervals_per_second());
        state.carry += per_interval;
        let samples = state.carry.floor();
        state.carry -= samples;
        samples as usize * format.bytes_per_frame()
    }

    fn stamp(&self, state: &mut SimState, now: u64) -> u64 {
        let jitter = i64::try_from(self.config.timestamp_jitter_ns).unwrap_or(i64::MAX);
        if jitter == 0 {
            return now;
        }
        now.saturating_add_signed(state.rng.gen_range(-jitter..=jitter))
    }

    /// Service the next frame of `direction`. Returns `false` when nothing
    /// was queued.
    fn service(
        &self,
        state: &mut SimState,
        direction: Direction,
        input_bytes: usize,
        now: u64,
    ) -> bool {
        let timestamp = self.stamp(state, now);
        let d = direction.index();
        let failing = state.failing[d] > 0;
        let Some(queued) = state.queues[d].front_mut() else {
            state.starved[d] += 1;
            return false;
        };

        let done = {
            let mut list = queued.submission.list.lock();
            let index = queued.next_frame;
            let requested = list.frames[index].requested as usize;
            let offset = list.frame_offset(index);
            let end = (offset + requested).min(list.buffer.len());

            let actual = if failing {
                0
            } else {
                match direction {
                    Direction::Input => {
                        let slot = &mut list.buffer[offset..end];
                        let mut len = 0;
                        if state.stray_prefix && slot.len() > STRAY_PREFIX.len() {
                            slot[..STRAY_PREFIX.len()].copy_from_slice(&STRAY_PREFIX);
                            len = STRAY_PREFIX.len();
                        }
                        let payload = input_bytes.min(slot.len() - len);
                        for byte in &mut slot[len..len + payload] {
                            *byte = state.pattern;
                            state.pattern = state.pattern.wrapping_add(1);
                        }
                        len + payload
                    }
                    Direction::Output => {
                        if state.capture {
                            state.captured.extend_from_slice(&list.buffer[offset..end]);
                        }
                        state.bytes_written += (end - offset) as u64;
                        end - offset
                    }
                }
            };

            let frame = &mut list.frames[index];
            frame.actual = actual as u32;
            frame.status = if failing {
                FrameStatus::Failed
            } else {
                FrameStatus::Complete
            };
            frame.timestamp_ns = timestamp;
            queued.next_frame += 1;
            queued.next_frame == list.frames.len()
        };

        if done {
            if let Some(queued) = state.queues[d].pop_front() {
                let status = if failing {
                    state.failing[d] -= 1;
                    TransferStatus::Failed(TransportError::Io("injected failure".into()))
                } else {
                    TransferStatus::Complete
                };
                Self::complete(queued, status);
            }
        }
        true
    }

    fn complete(queued: Queued, status: TransferStatus) {
        let completion = Completion {
            direction: queued.submission.direction,
            list_index: queued.submission.list_index,
            status,
        };
        if let Err(err) = queued.submission.completion.try_send(completion) {
            tracing::warn!(error = %err, "completion dropped");
        }
    }

    fn enqueue(&self, direction: Direction, submission: Submission) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let d = direction.index();
        if !state.open[d] {
            return Err(TransportError::EndpointClosed(direction));
        }
        if let Some(err) = state.reject[d].pop_front() {
            return Err(err);
        }
        if submission.list.lock().frames.is_empty() {
            return Err(TransportError::Io("empty frame list".into()));
        }
        state.queues[d].push_back(Queued {
            submission,
            next_frame: 0,
        });
        Ok(())
    }
}

impl Transport for SimulatedDevice {
    fn is_open(&self, direction: Direction) -> bool {
        self.state.lock().open[direction.index()]
    }

    fn frame_number(&self) -> u64 {
        self.state.lock().frame
    }

    fn submit_read(&self, submission: Submission) -> Result<(), TransportError> {
        self.enqueue(Direction::Input, submission)
    }

    fn submit_write(&self, submission: Submission) -> Result<(), TransportError> {
        self.enqueue(Direction::Output, submission)
    }
}
