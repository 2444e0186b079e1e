//! Sample handling for the loopback demo.
//!
//! The stream engine moves opaque bytes and never looks inside a frame.
//! This module is the only place that reads them as PCM, and only so the
//! `simulate` command can apply the volume control to the looped audio.
//! Samples are signed little-endian; widths other than 16 and 24 bits pass
//! through untouched.

use usbaudio_core::StreamFormat;

/// Scale every sample in `bytes` by `gain`, saturating at full scale.
pub fn scale_in_place(bytes: &mut [u8], format: &StreamFormat, gain: f32) {
    if gain == 1.0 {
        return;
    }
    match format.bytes_per_sample {
        2 => {
            for sample in bytes.chunks_exact_mut(2) {
                let value = f32::from(i16::from_le_bytes([sample[0], sample[1]]));
                let scaled = (value * gain).round().clamp(-32768.0, 32767.0) as i16;
                sample.copy_from_slice(&scaled.to_le_bytes());
            }
        }
        3 => {
            for sample in bytes.chunks_exact_mut(3) {
                // Sign-extend through the top byte of an i32
                let value = i32::from_le_bytes([0, sample[0], sample[1], sample[2]]) >> 8;
                let scaled = (value as f32 * gain).round().clamp(-8_388_608.0, 8_388_607.0) as i32;
                sample.copy_from_slice(&scaled.to_le_bytes()[..3]);
            }
        }
        _ => {}
    }
}
