//! State shared by the two directions of one streaming session.
//!
//! A session owns both rings, the frame-size queue that couples input to
//! output and the clock. It is created when the streams are set up, handed
//! to the managers by reference-counted handle and dropped at teardown, so
//! none of this state outlives the session that produced it.

use std::sync::Arc;

use parking_lot::Mutex;
use usbaudio_core::{
    BusSpeed, Error as Status, FilterConfig, FrameSizeQueue, RingBuffer, StreamFormat,
};

use crate::clock::{ClockSync, TimeSource};
use crate::transport::Direction;
use crate::{Result, SharedRing};

/// Session-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Format of both directions.
    pub format: StreamFormat,
    /// Bus speed of the device.
    pub bus: BusSpeed,
    /// Ring size in audio frames; the byte size follows from `format`.
    pub ring_frames: usize,
    /// Wrap timestamp filter tuning.
    pub filter: FilterConfig,
    /// Direction whose wraps drive the clock.
    pub clock_master: Direction,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            format: StreamFormat::default(),
            bus: BusSpeed::Full,
            ring_frames: 4096,
            filter: FilterConfig::default(),
            clock_master: Direction::Input,
        }
    }
}

impl SessionConfig {
    /// Ring size in bytes.
    pub fn ring_bytes(&self) -> usize {
        self.ring_frames * self.format.bytes_per_frame()
    }
}

/// Rings, queue and clock for one duplex session.
#[derive(Debug)]
pub struct StreamSession {
    config: SessionConfig,
    input_ring: SharedRing,
    output_ring: SharedRing,
    frame_sizes: Arc<FrameSizeQueue>,
    clock: Arc<ClockSync>,
}

impl StreamSession {
    /// Allocate both rings and the clock.
    pub fn new(config: &SessionConfig, time: Arc<dyn TimeSource>) -> Result<Self> {
        if !config.format.is_valid() || config.ring_frames < 2 {
            return Err(Status::BadArgument.into());
        }
        let ring_bytes = config.ring_bytes();
        let input_ring = Arc::new(Mutex::new(RingBuffer::<u8>::with_capacity(ring_bytes)?));
        let output_ring = Arc::new(Mutex::new(RingBuffer::<u8>::with_capacity(ring_bytes)?));
        let clock = ClockSync::new(
            config.format,
            ring_bytes,
            config.filter,
            config.clock_master,
            time,
        )?;
        tracing::debug!(
            ring_bytes,
            period_ms = clock.nominal_period_ns() / 1e6,
            master = %config.clock_master,
            "stream session created"
        );
        Ok(Self {
            config: config.clone(),
            input_ring,
            output_ring,
            frame_sizes: Arc::new(FrameSizeQueue::new()),
            clock: Arc::new(clock),
        })
    }

    /// Ring the input stream writes and the host reads.
    pub fn input_ring(&self) -> SharedRing {
        Arc::clone(&self.input_ring)
    }

    /// Ring the host writes and the output stream reads.
    pub fn output_ring(&self) -> SharedRing {
        Arc::clone(&self.output_ring)
    }

    /// Implicit-synchronization queue from input to output.
    pub fn frame_sizes(&self) -> Arc<FrameSizeQueue> {
        Arc::clone(&self.frame_sizes)
    }

    /// Shared clock.
    pub fn clock(&self) -> Arc<ClockSync> {
        Arc::clone(&self.clock)
    }

    /// Settings the session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Prepare for a new run: empty both rings and the queue and reset the
    /// clock. Only call while both streams are stopped.
    pub fn reset(&self) {
        self.input_ring.lock().clear();
        self.output_ring.lock().clear();
        self.frame_sizes.reset();
        self.clock.reset();
    }
}
