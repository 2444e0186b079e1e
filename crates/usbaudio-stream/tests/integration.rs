//! End-to-end tests of the stream managers against the simulated device.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use usbaudio_core::{Error as Status, FrameSizeQueue, StreamFormat};
use usbaudio_stream::{
    Direction, Error, InputConfig, InputStreamManager, OutputConfig, OutputStreamManager,
    RingSegment, SessionConfig, SharedRing, SimConfig, SimulatedDevice, StreamEvent,
    StreamSession, StreamState, TransportError, WrapMark,
};

const MONO_16: StreamFormat = StreamFormat::new(48000, 1, 16);
const STEREO_24: StreamFormat = StreamFormat::new(48000, 2, 24);

struct Rig {
    device: Arc<SimulatedDevice>,
    session: StreamSession,
    input: InputStreamManager,
    output: OutputStreamManager,
    events: Receiver<StreamEvent>,
}

fn rig_with(
    format: StreamFormat,
    ring_frames: usize,
    sim: SimConfig,
    input: InputConfig,
    output: OutputConfig,
) -> Rig {
    let device = Arc::new(SimulatedDevice::new(SimConfig { format, ..sim }));
    let session_config = SessionConfig {
        format,
        ring_frames,
        ..SessionConfig::default()
    };
    let session = StreamSession::new(&session_config, device.clock()).unwrap();
    let (tx, events) = crossbeam_channel::unbounded();
    Rig {
        input: InputStreamManager::new(InputConfig { format, ..input }, tx.clone()),
        output: OutputStreamManager::new(OutputConfig { format, ..output }, tx),
        device,
        session,
        events,
    }
}

fn rig() -> Rig {
    rig_with(
        StreamFormat::default(),
        4096,
        SimConfig::default(),
        InputConfig::default(),
        OutputConfig::default(),
    )
}

impl Rig {
    fn init_input(&self) {
        self.input
            .init(
                self.device.clone(),
                self.session.input_ring(),
                self.session.frame_sizes(),
                self.session.clock(),
            )
            .unwrap();
    }

    fn init_output(&self) {
        self.output
            .init(
                self.device.clone(),
                self.session.output_ring(),
                self.session.clock(),
            )
            .unwrap();
    }

    fn step(&self) {
        self.device.run_interval();
        if self.input.state() != StreamState::Uninitialized {
            self.input.process_pending().unwrap();
        }
        if self.output.state() != StreamState::Uninitialized {
            self.output.process_pending().unwrap();
        }
    }

    fn steps(&self, n: usize) {
        for _ in 0..n {
            self.step();
        }
    }

    /// Step until every event in `wanted` has arrived, returning all events
    /// seen.
    fn step_until(&self, wanted: &[StreamEvent], limit: usize) -> Vec<StreamEvent> {
        let mut seen: Vec<StreamEvent> = self.events.try_iter().collect();
        for _ in 0..limit {
            if wanted.iter().all(|e| seen.contains(e)) {
                return seen;
            }
            self.step();
            seen.extend(self.events.try_iter());
        }
        assert!(
            wanted.iter().all(|e| seen.contains(e)),
            "wanted {wanted:?}, got {seen:?}"
        );
        seen
    }
}

fn drain(ring: &SharedRing) -> Vec<u8> {
    let mut ring = ring.lock();
    let mut out = vec![0; ring.available()];
    ring.pop_slice(&mut out).unwrap();
    out
}

fn assert_counter_from(bytes: &[u8], first: usize) {
    for (i, &b) in bytes.iter().enumerate() {
        assert_eq!(b, ((first + i) % 256) as u8, "byte {i}");
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn stop_wait_closed_then_free() {
    let rig = rig();
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(20);

    rig.input.stop().unwrap();
    assert_eq!(rig.input.state(), StreamState::Stopping);
    assert_eq!(
        rig.input.free().unwrap_err(),
        Error::Status(Status::StillOpen)
    );

    let events = rig.step_until(&[StreamEvent::Closed(Direction::Input)], 64);
    assert_eq!(events, vec![StreamEvent::Closed(Direction::Input)]);
    assert_eq!(rig.input.state(), StreamState::Stopped);
    assert_eq!(rig.input.in_flight(), 0);
    assert_eq!(rig.device.queued(Direction::Input), 0);

    rig.input.free().unwrap();
    assert_eq!(rig.input.state(), StreamState::Uninitialized);
    assert_eq!(rig.input.free().unwrap_err(), Error::Status(Status::NotReady));
}

#[test]
fn free_while_running_is_still_open() {
    let rig = rig();
    rig.init_output();
    rig.output.start(None).unwrap();
    assert_eq!(
        rig.output.free().unwrap_err().status(),
        Some(Status::StillOpen)
    );
}

#[test]
fn start_before_init_is_not_ready() {
    let rig = rig();
    assert_eq!(rig.input.start().unwrap_err(), Error::Status(Status::NotReady));
    assert_eq!(
        rig.output.start(None).unwrap_err(),
        Error::Status(Status::NotReady)
    );
    assert_eq!(rig.input.stop().unwrap_err(), Error::Status(Status::NotReady));
}

#[test]
fn missing_endpoint_is_not_open() {
    let rig = rig_with(
        StreamFormat::default(),
        4096,
        SimConfig {
            input_open: false,
            ..SimConfig::default()
        },
        InputConfig::default(),
        OutputConfig::default(),
    );
    let err = rig
        .input
        .init(
            rig.device.clone(),
            rig.session.input_ring(),
            rig.session.frame_sizes(),
            rig.session.clock(),
        )
        .unwrap_err();
    assert_eq!(err, Error::Status(Status::NotOpen));
    assert_eq!(rig.input.state(), StreamState::Uninitialized);
}

#[test]
fn restart_after_close() {
    let rig = rig();
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(8);
    rig.input.stop().unwrap();
    rig.step_until(&[StreamEvent::Closed(Direction::Input)], 64);

    rig.input.start().unwrap();
    assert_eq!(rig.input.state(), StreamState::Running);
    assert_eq!(rig.input.in_flight(), 4);
}

#[test]
fn aborted_lists_close_the_stream() {
    let rig = rig();
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(3);

    rig.input.stop().unwrap();
    rig.device.abort_all();
    assert_eq!(rig.input.process_pending().unwrap(), 4);
    assert_eq!(
        rig.events.try_recv(),
        Ok(StreamEvent::Closed(Direction::Input))
    );
    // The three frames serviced before the abort still landed
    assert_eq!(rig.session.input_ring().lock().available(), 3 * 192);
    rig.input.free().unwrap();
}

// ---------------------------------------------------------------------------
// Input path
// ---------------------------------------------------------------------------

#[test]
fn input_fills_ring_and_frame_size_queue_in_order() {
    let rig = rig();
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(32);

    let stats = rig.input.stats();
    assert_eq!(stats.lists_completed, 4);
    assert_eq!(stats.frames_processed, 32);
    assert_eq!(rig.input.in_flight(), 4);

    let bytes = drain(&rig.session.input_ring());
    assert_eq!(bytes.len(), 32 * 192);
    assert_counter_from(&bytes, 0);

    let sizes = rig.session.frame_sizes();
    assert_eq!(sizes.len(), 32);
    while let Some(size) = sizes.pop() {
        assert_eq!(size, 192);
    }
}

#[test]
fn initial_frames_are_dropped() {
    let rig = rig_with(
        StreamFormat::default(),
        4096,
        SimConfig::default(),
        InputConfig {
            drop_initial_frames: 5,
            ..InputConfig::default()
        },
        OutputConfig::default(),
    );
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(32);

    assert_eq!(rig.input.stats().frames_dropped, 5);
    assert_eq!(rig.session.frame_sizes().len(), 27);
    let bytes = drain(&rig.session.input_ring());
    assert_eq!(bytes.len(), 27 * 192);
    assert_counter_from(&bytes, 5 * 192);
}

#[test]
fn stray_leading_bytes_are_stripped() {
    let rig = rig_with(
        STEREO_24,
        4096,
        SimConfig::default(),
        InputConfig::default(),
        OutputConfig::default(),
    );
    rig.device.set_stray_prefix(true);
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(8);

    assert_eq!(rig.input.stats().stray_bytes_stripped, 8 * 4);
    let bytes = drain(&rig.session.input_ring());
    assert_eq!(bytes.len(), 8 * 288);
    assert_counter_from(&bytes, 0);
    assert_eq!(rig.session.frame_sizes().pop(), Some(288));
}

#[test]
fn stray_correction_can_be_disabled() {
    let rig = rig_with(
        STEREO_24,
        4096,
        SimConfig::default(),
        InputConfig {
            strip_stray_leading_bytes: false,
            ..InputConfig::default()
        },
        OutputConfig::default(),
    );
    rig.device.set_stray_prefix(true);
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(8);

    assert_eq!(rig.input.stats().stray_bytes_stripped, 0);
    let bytes = drain(&rig.session.input_ring());
    assert_eq!(bytes.len(), 8 * 292);
    assert_eq!(&bytes[..4], &[0xEE; 4]);
}

#[test]
fn overrun_drops_data_and_keeps_running() {
    // 1024-byte ring holds five 192-byte frames
    let rig = rig_with(
        StreamFormat::default(),
        256,
        SimConfig::default(),
        InputConfig::default(),
        OutputConfig::default(),
    );
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(16);

    let stats = rig.input.stats();
    assert_eq!(stats.overruns, 11);
    assert_eq!(stats.frames_processed, 16);
    assert_eq!(rig.input.state(), StreamState::Running);
    assert_eq!(rig.input.in_flight(), 4);
    assert_eq!(rig.session.input_ring().lock().available(), 5 * 192);
    // Frame sizes still reach the playback side
    assert_eq!(rig.session.frame_sizes().len(), 16);
}

#[test]
fn gather_drains_finished_frames_early() {
    let rig = rig();
    rig.init_input();
    rig.input.start().unwrap();

    assert_eq!(rig.device.advance_frames(Direction::Input, 3), 3);
    assert_eq!(rig.input.gather().unwrap(), 3 * 192);
    assert_eq!(rig.input.gather().unwrap(), 0);

    assert!(rig.device.complete_next(Direction::Input));
    assert_eq!(rig.input.process_pending().unwrap(), 1);

    let bytes = drain(&rig.session.input_ring());
    assert_eq!(bytes.len(), 8 * 192);
    assert_counter_from(&bytes, 0);
    assert_eq!(rig.input.stats().frames_processed, 8);
}

#[test]
fn wrap_is_reported_once_with_interpolated_time() {
    // 96 bytes per 1 ms frame into a 4096-byte ring
    let rig = rig_with(
        MONO_16,
        2048,
        SimConfig::default(),
        InputConfig::default(),
        OutputConfig::default(),
    );
    rig.init_input();
    rig.input.start().unwrap();

    let clock = rig.session.clock();
    let mut received = 0;
    for _ in 0..48 {
        rig.step();
        received += drain(&rig.session.input_ring()).len();
    }
    assert_eq!(received, 48 * 96);
    assert_eq!(rig.input.stats().wraps, 1);
    assert_eq!(clock.wrap_count(Direction::Input), 1);
    assert_eq!(
        rig.session.input_ring().lock().write_index(),
        received % 4096
    );

    // Byte 4096 was produced at 4096 / 96000 s
    let wrap = clock.last_raw_wrap_ns(Direction::Input).unwrap();
    assert!((wrap - 42_666_666.667).abs() < 1.0, "wrap at {wrap}");

    // 48 ms in, 512 bytes past the wrap
    let pos = clock.estimate_position_at(0).unwrap();
    assert!((pos - 512.0).abs() < 1e-3, "pos = {pos}");
    let earlier = clock.estimate_position_at(-1_000_000).unwrap();
    assert!((earlier - 416.0).abs() < 1e-3);
}

#[test]
fn transient_read_failure_is_resubmitted() {
    let rig = rig();
    rig.init_input();
    rig.device.fail_next_lists(Direction::Input, 1);
    rig.input.start().unwrap();
    rig.steps(16);

    let stats = rig.input.stats();
    assert_eq!(stats.transport_errors, 1);
    assert_eq!(stats.frames_dropped, 8);
    assert_eq!(stats.lists_completed, 2);
    assert_eq!(rig.input.state(), StreamState::Running);
    assert_eq!(rig.input.in_flight(), 4);
    assert_eq!(rig.session.input_ring().lock().available(), 8 * 192);
}

#[test]
fn in_flight_holds_steady_over_long_run() {
    let rig = rig();
    rig.init_input();
    rig.input.start().unwrap();
    for _ in 0..100 {
        rig.steps(8);
        assert_eq!(rig.input.in_flight(), 4);
        drain(&rig.session.input_ring());
    }
    assert_eq!(rig.input.stats().lists_completed, 100);

    rig.input.stop().unwrap();
    let events = rig.step_until(&[StreamEvent::Closed(Direction::Input)], 64);
    assert_eq!(events, vec![StreamEvent::Closed(Direction::Input)]);
    assert_eq!(rig.input.in_flight(), 0);
    rig.input.free().unwrap();
}

#[test]
fn refused_resubmission_is_retried() {
    let rig = rig();
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(7);
    for _ in 0..3 {
        rig.device
            .reject_next_submission(Direction::Input, TransportError::Disconnected);
    }

    // List 0 completes and its resubmission is refused
    rig.device.run_interval();
    assert_eq!(
        rig.input.process_pending().unwrap_err(),
        Error::Transport(TransportError::Disconnected)
    );
    assert_eq!(rig.input.in_flight(), 3);

    // Two more refusals, then the parked list is accepted
    for expected in [3, 3, 4] {
        rig.device.run_interval();
        assert_eq!(rig.input.process_pending().unwrap(), 0);
        assert_eq!(rig.input.in_flight(), expected);
    }
    assert_eq!(rig.input.stats().transport_errors, 3);
    assert_eq!(rig.input.state(), StreamState::Running);

    // Lists 1, 2, 3 and the retried list 0 complete without a gap
    rig.steps(29);
    assert_eq!(rig.input.stats().lists_completed, 5);
    assert_eq!(rig.input.in_flight(), 4);
    let bytes = drain(&rig.session.input_ring());
    assert_eq!(bytes.len(), 40 * 192);
    assert_counter_from(&bytes, 0);

    rig.input.stop().unwrap();
    rig.step_until(&[StreamEvent::Closed(Direction::Input)], 64);
}

#[test]
fn refusals_count_toward_the_error_limit() {
    let rig = rig_with(
        StreamFormat::default(),
        4096,
        SimConfig::default(),
        InputConfig {
            max_consecutive_errors: Some(3),
            ..InputConfig::default()
        },
        OutputConfig::default(),
    );
    rig.init_input();
    rig.input.start().unwrap();
    rig.steps(7);
    for _ in 0..5 {
        rig.device
            .reject_next_submission(Direction::Input, TransportError::Disconnected);
    }

    rig.device.run_interval();
    assert!(rig.input.process_pending().is_err());
    for _ in 0..2 {
        rig.device.run_interval();
        rig.input.process_pending().unwrap();
    }
    assert_eq!(rig.input.state(), StreamState::Stopping);
    assert_eq!(
        rig.events.try_recv(),
        Ok(StreamEvent::Failed(Direction::Input))
    );

    // The three lists still queued drain and close the stream
    let events = rig.step_until(&[StreamEvent::Closed(Direction::Input)], 64);
    assert_eq!(events, vec![StreamEvent::Closed(Direction::Input)]);
    assert_eq!(rig.input.in_flight(), 0);
    assert_eq!(rig.device.queued(Direction::Input), 0);
    rig.input.free().unwrap();
}

#[test]
fn repeated_failures_give_up() {
    let rig = rig_with(
        StreamFormat::default(),
        4096,
        SimConfig::default(),
        InputConfig {
            max_consecutive_errors: Some(2),
            ..InputConfig::default()
        },
        OutputConfig::default(),
    );
    rig.init_input();
    rig.device.fail_next_lists(Direction::Input, 100);
    rig.input.start().unwrap();

    let events = rig.step_until(&[StreamEvent::Closed(Direction::Input)], 64);
    assert_eq!(
        events,
        vec![
            StreamEvent::Failed(Direction::Input),
            StreamEvent::Closed(Direction::Input)
        ]
    );
    assert_eq!(rig.device.queued(Direction::Input), 0);
    rig.input.free().unwrap();
}

#[test]
fn rejected_start_closes_immediately() {
    let rig = rig();
    rig.init_input();
    rig.device
        .reject_next_submission(Direction::Input, TransportError::Disconnected);

    let err = rig.input.start().unwrap_err();
    assert_eq!(err, Error::Transport(TransportError::Disconnected));
    assert_eq!(
        rig.events.try_recv(),
        Ok(StreamEvent::Closed(Direction::Input))
    );
    assert_eq!(rig.input.state(), StreamState::Stopped);
    rig.input.free().unwrap();
}

// ---------------------------------------------------------------------------
// Output path
// ---------------------------------------------------------------------------

fn output_rig(frame_lists: usize, lists_in_flight: usize) -> Rig {
    rig_with(
        MONO_16,
        2048,
        SimConfig::default(),
        InputConfig::default(),
        OutputConfig {
            frame_lists,
            lists_in_flight,
            ..OutputConfig::default()
        },
    )
}

#[test]
fn write_crossing_ring_end_is_split_in_two() {
    let rig = output_rig(2, 1);
    {
        let ring = rig.session.output_ring();
        let mut ring = ring.lock();
        ring.push_slice(&[0; 4000], 0).unwrap();
        ring.pop_slice(&mut [0; 4000]).unwrap();
        ring.push_slice(&[7; 1000], 0).unwrap();
    }
    rig.init_output();

    // 8 nominal frames of 96 bytes from read index 4000
    let prepared = rig.output.prepare_frame_list(0).unwrap();
    assert_eq!(prepared.bytes, 768);
    assert_eq!(
        prepared.segments,
        vec![
            RingSegment {
                offset: 4000,
                len: 96
            },
            RingSegment {
                offset: 0,
                len: 672
            },
        ]
    );
    let total: usize = prepared.segments.iter().map(|s| s.len).sum();
    assert_eq!(total, prepared.bytes);
    assert!(prepared.captures_timestamp());
    assert_eq!(
        prepared.wrap,
        Some(WrapMark {
            frame: 0,
            overshoot: 0
        })
    );
    assert_eq!(prepared.fallback_frames, 8);
    assert!(!prepared.silent);
    assert_eq!(rig.session.output_ring().lock().read_index(), 672);
}

#[test]
fn write_within_ring_is_one_segment() {
    let rig = output_rig(2, 1);
    rig.session
        .output_ring()
        .lock()
        .push_slice(&[1; 2000], 0)
        .unwrap();
    rig.init_output();

    let prepared = rig.output.prepare_frame_list(1).unwrap();
    assert_eq!(
        prepared.segments,
        vec![RingSegment {
            offset: 0,
            len: 768
        }]
    );
    assert!(!prepared.captures_timestamp());
    assert_eq!(
        rig.output.prepare_frame_list(2).unwrap_err(),
        Error::Status(Status::BadArgument)
    );
}

#[test]
fn underrun_sends_silence_without_consuming() {
    let rig = output_rig(4, 2);
    rig.session
        .output_ring()
        .lock()
        .push_slice(&[9; 100], 0)
        .unwrap();
    rig.init_output();
    rig.device.capture_output(true);
    rig.output.start(None).unwrap();

    assert_eq!(rig.output.stats().underruns, 2);
    assert_eq!(rig.session.output_ring().lock().available(), 100);

    assert!(rig.device.complete_next(Direction::Output));
    let sent = rig.device.take_output();
    assert_eq!(sent.len(), 768);
    assert!(sent.iter().all(|&b| b == 0));
}

#[test]
fn output_mirrors_input_frame_sizes() {
    let rig = output_rig(2, 1);
    rig.session
        .output_ring()
        .lock()
        .push_slice(&[3; 3000], 0)
        .unwrap();
    rig.init_output();

    let queue = Arc::new(FrameSizeQueue::new());
    // 5000 exceeds the 98-byte packet limit and is clamped
    for size in [96, 98, 94, 96, 96, 5000, 96, 96] {
        queue.push(size);
    }
    rig.output.start(Some(Arc::clone(&queue))).unwrap();
    assert!(queue.is_empty());
    assert_eq!(rig.output.stats().fallback_frames, 0);

    assert!(rig.device.complete_next(Direction::Output));
    assert_eq!(rig.device.bytes_written(), 770);

    // Next list finds the queue empty and falls back to the nominal rate
    rig.output.process_pending().unwrap();
    assert_eq!(rig.output.stats().fallback_frames, 8);
    assert!(rig.device.complete_next(Direction::Output));
    assert_eq!(rig.device.bytes_written(), 770 + 768);
}

#[test]
fn write_failure_is_resubmitted() {
    let rig = output_rig(4, 2);
    rig.session
        .output_ring()
        .lock()
        .push_slice(&[0; 4000], 0)
        .unwrap();
    rig.init_output();
    rig.device.fail_next_lists(Direction::Output, 1);
    rig.output.start(None).unwrap();
    rig.steps(8);

    let stats = rig.output.stats();
    assert_eq!(stats.transport_errors, 1);
    assert_eq!(rig.output.state(), StreamState::Running);
    assert_eq!(rig.output.in_flight(), 2);
    assert_eq!(rig.device.queued(Direction::Output), 2);
}

#[test]
fn output_in_flight_holds_steady_over_long_run() {
    let rig = output_rig(4, 2);
    rig.init_output();
    rig.output.start(None).unwrap();
    for _ in 0..400 {
        rig.step();
        assert_eq!(rig.output.in_flight(), 2);
    }
    assert_eq!(rig.output.stats().lists_completed, 50);

    rig.output.stop().unwrap();
    let events = rig.step_until(&[StreamEvent::Closed(Direction::Output)], 32);
    assert_eq!(events, vec![StreamEvent::Closed(Direction::Output)]);
    assert_eq!(rig.output.in_flight(), 0);
    rig.output.free().unwrap();
}

#[test]
fn refused_write_keeps_payload_and_order() {
    let rig = output_rig(4, 2);
    let data: Vec<u8> = (0..4000).map(|i| (i % 256) as u8).collect();
    rig.session
        .output_ring()
        .lock()
        .push_slice(&data, 0)
        .unwrap();
    rig.device.capture_output(true);
    rig.init_output();
    rig.output.start(None).unwrap();
    rig.steps(7);

    // List 0 completes; list 2 is prepared but refused
    rig.device
        .reject_next_submission(Direction::Output, TransportError::Disconnected);
    rig.device.run_interval();
    assert!(rig.output.process_pending().is_err());
    assert_eq!(rig.output.in_flight(), 1);

    // The parked list goes out before anything new is prepared
    rig.device.run_interval();
    assert_eq!(rig.output.process_pending().unwrap(), 0);
    assert_eq!(rig.output.in_flight(), 2);
    assert_eq!(rig.device.queued(Direction::Output), 2);

    // Lists 0 to 3 carry the first 3072 bytes of the ring
    rig.steps(23);
    assert_eq!(rig.output.stats().transport_errors, 1);
    let sent = rig.device.take_output();
    assert_eq!(sent.len(), 32 * 96);
    assert_counter_from(&sent, 0);
}

#[test]
fn prepare_is_refused_while_lists_are_in_flight() {
    let rig = output_rig(4, 2);
    rig.session
        .output_ring()
        .lock()
        .push_slice(&[5; 3000], 0)
        .unwrap();
    rig.init_output();
    rig.output.start(None).unwrap();
    let available = rig.session.output_ring().lock().available();

    assert_eq!(
        rig.output.prepare_frame_list(2).unwrap_err(),
        Error::Status(Status::NotReady)
    );
    rig.output.stop().unwrap();
    assert_eq!(
        rig.output.prepare_frame_list(2).unwrap_err(),
        Error::Status(Status::NotReady)
    );
    assert_eq!(rig.session.output_ring().lock().available(), available);

    rig.step_until(&[StreamEvent::Closed(Direction::Output)], 32);
    assert!(rig.output.prepare_frame_list(2).is_ok());
}

#[test]
fn output_stop_closes_after_drain() {
    let rig = output_rig(4, 2);
    rig.init_output();
    rig.output.start(None).unwrap();
    rig.steps(4);
    rig.output.stop().unwrap();
    let events = rig.step_until(&[StreamEvent::Closed(Direction::Output)], 32);
    assert_eq!(events, vec![StreamEvent::Closed(Direction::Output)]);
    rig.output.free().unwrap();
}

// ---------------------------------------------------------------------------
// Duplex
// ---------------------------------------------------------------------------

#[test]
fn duplex_loopback_stays_in_lockstep() {
    let rig = rig_with(
        StreamFormat::default(),
        4096,
        SimConfig {
            clock_ppm: 300.0,
            ..SimConfig::default()
        },
        InputConfig::default(),
        OutputConfig::default(),
    );
    let prefill = 8192;
    rig.session
        .output_ring()
        .lock()
        .push_slice(&vec![0; prefill], 0)
        .unwrap();
    rig.device.capture_output(true);
    rig.init_input();
    rig.init_output();
    rig.input.start().unwrap();
    rig.output.start(Some(rig.session.frame_sizes())).unwrap();

    let input_ring = rig.session.input_ring();
    let output_ring = rig.session.output_ring();
    for _ in 0..3000 {
        rig.device.run_interval();
        rig.input.process_pending().unwrap();
        let recorded = drain(&input_ring);
        output_ring.lock().push_slice(&recorded, 0).unwrap();
        rig.output.process_pending().unwrap();
    }

    let input = rig.input.stats();
    let output = rig.output.stats();
    assert_eq!(input.overruns, 0);
    assert_eq!(output.underruns, 0);
    // Only the lists submitted at start are sized from the nominal rate
    assert_eq!(output.fallback_frames, 32);

    let clock = rig.session.clock();
    assert!(clock.is_locked());
    assert!(clock.wrap_count(Direction::Output) > 0);
    let ratio = clock.filtered_period_ns() / clock.nominal_period_ns();
    assert!((ratio - 1.0).abs() < 1e-3, "ratio = {ratio}");

    // Prefill first, then the recorded stream in order
    let sent = rig.device.take_output();
    assert!(sent.len() > prefill);
    assert!(sent[..prefill].iter().all(|&b| b == 0));
    assert_counter_from(&sent[prefill..], 0);

    rig.input.stop().unwrap();
    rig.output.stop().unwrap();
    let events = rig.step_until(
        &[
            StreamEvent::Closed(Direction::Input),
            StreamEvent::Closed(Direction::Output),
        ],
        64,
    );
    assert_eq!(events.len(), 2);
    rig.input.free().unwrap();
    rig.output.free().unwrap();
}
