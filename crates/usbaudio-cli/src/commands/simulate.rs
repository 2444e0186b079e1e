//! Duplex loopback against the simulated device, in virtual time.
//!
//! Every bus interval the recorded bytes are drained from the input ring,
//! scaled by the volume control (see [`pcm`](super::pcm)) and pushed into
//! the output ring. The output stream mirrors the input frame sizes, so the
//! run exercises the full implicit-synchronization path and the wrap clock.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Args;
use usbaudio_core::StreamFormat;
use usbaudio_stream::{
    Control, Direction, InputStreamManager, OutputStreamManager, SharedRing, SimConfig,
    SimulatedDevice, StatsSnapshot, StreamEvent, StreamSession, StreamState, Volume,
    VolumeControl,
};

use super::{load_settings, pcm};

/// Intervals allowed for both streams to drain after stop.
const DRAIN_LIMIT: usize = 256;

/// Run a duplex loopback against the simulated device.
#[derive(Args)]
pub struct SimulateArgs {
    /// Settings file; defaults are used when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Simulated run length in milliseconds
    #[arg(short, long, default_value = "1000")]
    pub duration_ms: u64,

    /// Device clock error in parts per million (positive runs fast)
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub ppm: f64,

    /// Frame timestamp jitter in nanoseconds
    #[arg(long, default_value = "0")]
    pub jitter_ns: u64,

    /// Seed for the jitter generator
    #[arg(long, default_value = "24301")]
    pub seed: u64,

    /// Loopback gain in dB
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub gain_db: f32,

    /// Mute the loopback
    #[arg(long)]
    pub mute: bool,

    /// Make the device prepend stray bytes to odd-sized input packets
    #[arg(long)]
    pub stray_prefix: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the simulate command.
pub fn run(args: SimulateArgs) -> anyhow::Result<()> {
    let settings = load_settings(args.config.as_deref())?;
    settings.ensure_valid()?;

    let format = settings.stream_format();
    let session_config = settings.session_config();
    let device = Arc::new(SimulatedDevice::new(SimConfig {
        format,
        bus: session_config.bus,
        clock_ppm: args.ppm,
        timestamp_jitter_ns: args.jitter_ns,
        seed: args.seed,
        ..SimConfig::default()
    }));
    device.set_stray_prefix(args.stray_prefix);

    let session = StreamSession::new(&session_config, device.clock())?;
    let (events_tx, events) = crossbeam_channel::unbounded();
    let input = InputStreamManager::new(settings.input_config(), events_tx.clone());
    let output = OutputStreamManager::new(settings.output_config(), events_tx);

    let volume = VolumeControl::default();
    volume.set(Volume {
        gain_db: args.gain_db,
        muted: args.mute,
    });

    // Half a ring of silence keeps playback ahead of the first recordings
    let ring_bytes = session_config.ring_bytes();
    let prefill = ring_bytes / 2 / format.bytes_per_frame() * format.bytes_per_frame();
    session
        .output_ring()
        .lock()
        .push_slice(&vec![0; prefill], 0)?;

    input.init(
        device.clone(),
        session.input_ring(),
        session.frame_sizes(),
        session.clock(),
    )?;
    output.init(device.clone(), session.output_ring(), session.clock())?;
    input.start()?;
    output.start(Some(session.frame_sizes()))?;

    let intervals = args.duration_ms * u64::from(session_config.bus.intervals_per_second()) / 1000;
    tracing::info!(
        intervals,
        ppm = args.ppm,
        gain_db = volume.gain_db(),
        muted = volume.is_muted(),
        "simulation started"
    );

    let input_ring = session.input_ring();
    let output_ring = session.output_ring();
    let mut scratch = Vec::new();
    let mut looped_bytes = 0u64;
    let mut dropped_bytes = 0u64;
    for _ in 0..intervals {
        device.run_interval();
        settle(Direction::Input, input.process_pending());
        settle(Direction::Input, input.gather());

        let moved = transfer(&input_ring, &mut scratch, &format);
        pcm::scale_in_place(&mut scratch[..moved], &format, volume.linear_gain());
        if output_ring.lock().push_slice(&scratch[..moved], 0).is_ok() {
            looped_bytes += moved as u64;
        } else {
            dropped_bytes += moved as u64;
        }
        settle(Direction::Output, output.process_pending());

        if input.state() != StreamState::Running || output.state() != StreamState::Running {
            break;
        }
    }

    input.stop()?;
    output.stop()?;
    let mut closed = Vec::new();
    let mut failed = Vec::new();
    for _ in 0..DRAIN_LIMIT {
        for event in events.try_iter() {
            match event {
                StreamEvent::Closed(direction) => closed.push(direction),
                StreamEvent::Failed(direction) => failed.push(direction),
            }
        }
        if closed.len() == Direction::ALL.len() {
            break;
        }
        device.run_interval();
        settle(Direction::Input, input.process_pending());
        settle(Direction::Output, output.process_pending());
    }
    if closed.len() != Direction::ALL.len() {
        bail!("streams did not close within {DRAIN_LIMIT} intervals");
    }
    input.free()?;
    output.free()?;

    let clock = session.clock();
    let report = Report {
        intervals,
        looped_bytes,
        dropped_bytes,
        input: input.stats(),
        output: output.stats(),
        locked: clock.is_locked(),
        period_ppm: (clock.filtered_period_ns() / clock.nominal_period_ns() - 1.0) * 1e6,
        rejected: clock.rejected_samples(),
        failed,
    };
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report.to_json()).context("rendering report")?
        );
    } else {
        report.print();
    }
    if !report.failed.is_empty() {
        bail!("stream failed: {:?}", report.failed);
    }
    Ok(())
}

/// Completion errors are already counted in the stream stats; a stream that
/// gives up reports it through its events.
fn settle(direction: Direction, result: usbaudio_stream::Result<usize>) {
    if let Err(err) = result {
        tracing::warn!(%direction, error = %err, "completion not handled");
    }
}

/// Move every whole audio frame from `ring` into `scratch`, returning the
/// byte count.
fn transfer(ring: &SharedRing, scratch: &mut Vec<u8>, format: &StreamFormat) -> usize {
    let mut ring = ring.lock();
    let bytes_per_frame = format.bytes_per_frame();
    let bytes = ring.available() / bytes_per_frame * bytes_per_frame;
    scratch.resize(bytes, 0);
    if ring.pop_slice(scratch).is_err() {
        return 0;
    }
    bytes
}

struct Report {
    intervals: u64,
    looped_bytes: u64,
    dropped_bytes: u64,
    input: StatsSnapshot,
    output: StatsSnapshot,
    locked: bool,
    period_ppm: f64,
    rejected: u64,
    failed: Vec<Direction>,
}

impl Report {
    fn print(&self) {
        println!("Intervals:        {}", self.intervals);
        println!("Looped back:      {} bytes", self.looped_bytes);
        if self.dropped_bytes > 0 {
            println!("Dropped:          {} bytes", self.dropped_bytes);
        }
        println!(
            "Clock:            {} (period {:+.1} ppm, {} rejected)",
            if self.locked { "locked" } else { "unlocked" },
            self.period_ppm,
            self.rejected
        );
        for (name, stats) in [("Input", &self.input), ("Output", &self.output)] {
            println!("{name}:");
            println!("  lists:          {}", stats.lists_completed);
            println!(
                "  frames:         {} processed, {} dropped",
                stats.frames_processed, stats.frames_dropped
            );
            println!("  bytes:          {}", stats.bytes);
            println!("  wraps:          {}", stats.wraps);
            println!(
                "  faults:         {} overruns, {} underruns, {} transport errors",
                stats.overruns, stats.underruns, stats.transport_errors
            );
        }
        println!("Stray bytes:      {}", self.input.stray_bytes_stripped);
        println!("Fallback frames:  {}", self.output.fallback_frames);
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "intervals": self.intervals,
            "looped_bytes": self.looped_bytes,
            "dropped_bytes": self.dropped_bytes,
            "clock": {
                "locked": self.locked,
                "period_ppm": self.period_ppm,
                "rejected": self.rejected,
            },
            "input": stats_json(&self.input),
            "output": stats_json(&self.output),
            "failed": self.failed.iter().map(ToString::to_string).collect::<Vec<_>>(),
        })
    }
}

fn stats_json(stats: &StatsSnapshot) -> serde_json::Value {
    serde_json::json!({
        "lists_completed": stats.lists_completed,
        "frames_processed": stats.frames_processed,
        "frames_dropped": stats.frames_dropped,
        "stray_bytes_stripped": stats.stray_bytes_stripped,
        "overruns": stats.overruns,
        "underruns": stats.underruns,
        "fallback_frames": stats.fallback_frames,
        "transport_errors": stats.transport_errors,
        "wraps": stats.wraps,
        "bytes": stats.bytes,
    })
}
