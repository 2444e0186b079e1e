//! Stream format arithmetic and per-interval pacing.
//!
//! USB isochronous transfers move one packet per bus interval: 1 ms frames at
//! full speed, 125 µs microframes at high speed. Common sample rates are not
//! integer multiples of the interval rate, so the bytes per packet vary:
//!
//! | Rate | Bus | Samples per interval |
//! |------|-----|----------------------|
//! | 48 kHz | full | 48 |
//! | 44.1 kHz | full | 44 ×9, 45 ×1 per 10 ms |
//! | 96 kHz | high | 12 |
//!
//! [`FrameSizer`] reproduces that pattern exactly with an integer
//! accumulator, so long-run throughput matches the nominal rate with no
//! floating-point drift.

/// USB bus speed, which fixes the isochronous service interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusSpeed {
    /// Full speed: one frame per millisecond.
    #[default]
    Full,
    /// High speed: eight microframes per millisecond.
    High,
}

impl BusSpeed {
    /// Bus intervals per second.
    pub const fn intervals_per_second(self) -> u32 {
        match self {
            BusSpeed::Full => 1000,
            BusSpeed::High => 8000,
        }
    }

    /// Duration of one bus interval in nanoseconds.
    pub const fn interval_ns(self) -> u64 {
        1_000_000_000 / self.intervals_per_second() as u64
    }
}

/// PCM stream layout as negotiated with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Bytes per sample per channel (2 for 16-bit, 3 for 24-bit).
    pub bytes_per_sample: u16,
}

impl StreamFormat {
    /// Create a format from rate, channel count and bit depth.
    ///
    /// Bit depths are rounded up to whole bytes.
    pub const fn new(sample_rate: u32, channels: u16, bit_depth: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bytes_per_sample: bit_depth.div_ceil(8),
        }
    }

    /// Bytes of one audio frame (one sample for every channel).
    #[inline]
    pub const fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    /// Nominal byte rate.
    #[inline]
    pub const fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.bytes_per_frame() as u64
    }

    /// Nominal duration of one byte in nanoseconds.
    #[inline]
    pub fn ns_per_byte(&self) -> f64 {
        1.0e9 / self.bytes_per_second() as f64
    }

    /// Largest packet the device may send in one bus interval.
    ///
    /// One audio frame of headroom above the integer part covers both the
    /// fractional remainder and a device clock running slightly fast.
    pub const fn max_packet_bytes(&self, bus: BusSpeed) -> usize {
        (self.sample_rate / bus.intervals_per_second() + 1) as usize * self.bytes_per_frame()
    }

    /// Whether every field is non-zero.
    pub const fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0 && self.bytes_per_sample > 0
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(48000, 2, 16)
    }
}

/// Integer pacer yielding the byte count of each successive bus interval.
///
/// # Invariants
///
/// - every value is a whole number of audio frames
/// - over any `intervals_per_second` consecutive calls exactly
///   `sample_rate` audio frames are produced
#[derive(Debug, Clone)]
pub struct FrameSizer {
    whole: u32,
    remainder: u32,
    intervals: u32,
    accumulator: u32,
    bytes_per_frame: u32,
}

impl FrameSizer {
    /// Create a pacer for `format` on `bus`.
    pub fn new(format: &StreamFormat, bus: BusSpeed) -> Self {
        let intervals = bus.intervals_per_second();
        Self {
            whole: format.sample_rate / intervals,
            remainder: format.sample_rate % intervals,
            intervals,
            accumulator: 0,
            bytes_per_frame: format.bytes_per_frame() as u32,
        }
    }

    /// Bytes carried by the next bus interval.
    pub fn next_bytes(&mut self) -> u32 {
        let mut frames = self.whole;
        self.accumulator += self.remainder;
        if self.accumulator >= self.intervals {
            self.accumulator -= self.intervals;
            frames += 1;
        }
        frames * self.bytes_per_frame
    }

    /// Mean bytes per interval as a real number.
    pub fn average_bytes(&self) -> f64 {
        (self.whole as f64 + self.remainder as f64 / self.intervals as f64)
            * self.bytes_per_frame as f64
    }

    /// Restart the fractional pattern.
    pub fn reset(&mut self) {
        self.accumulator = 0;
    }
}
