//! Get/set/observe capability for device-side controls.
//!
//! Controls are plain values behind atomics: the host audio path reads them
//! lock-free on every buffer while a control thread changes them. Observers
//! run synchronously on the setter's thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Handle returned by [`Control::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Observer callback for a control of value type `V`.
pub type Observer<V> = Box<dyn Fn(V) + Send + Sync>;

/// A host-adjustable stream control.
pub trait Control: Send + Sync {
    /// Value carried by the control.
    type Value: Copy + Send + 'static;

    /// Current value.
    fn get(&self) -> Self::Value;

    /// Request `value`; returns the value actually applied after clamping.
    fn set(&self, value: Self::Value) -> Self::Value;

    /// Call `observer` after every change. Observers must not register or
    /// remove observers from inside the callback.
    fn observe(&self, observer: Observer<Self::Value>) -> ObserverId;

    /// Remove an observer. Returns `false` if `id` was unknown.
    fn unobserve(&self, id: ObserverId) -> bool;
}

/// Playback volume: gain in dB plus a mute switch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Volume {
    /// Gain in decibels.
    pub gain_db: f32,
    /// Muted regardless of gain.
    pub muted: bool,
}

impl Volume {
    /// Linear amplitude factor (0 when muted).
    pub fn linear(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            10f32.powf(self.gain_db / 20.0)
        }
    }
}

/// Atomic volume control with a fixed dB range.
pub struct VolumeControl {
    gain_bits: AtomicU32,
    muted: AtomicBool,
    min_db: f32,
    max_db: f32,
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Observer<Volume>)>>,
}

impl VolumeControl {
    /// Create a control spanning `min_db..=max_db`, starting at 0 dB
    /// (clamped into range) and unmuted.
    pub fn new(min_db: f32, max_db: f32) -> Self {
        let (min_db, max_db) = if min_db <= max_db {
            (min_db, max_db)
        } else {
            (max_db, min_db)
        };
        Self {
            gain_bits: AtomicU32::new(0f32.clamp(min_db, max_db).to_bits()),
            muted: AtomicBool::new(false),
            min_db,
            max_db,
            next_id: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Gain in dB.
    #[inline]
    pub fn gain_db(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Acquire))
    }

    /// Whether muted.
    #[inline]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Linear factor to apply to samples.
    #[inline]
    pub fn linear_gain(&self) -> f32 {
        self.get().linear()
    }

    /// Set only the gain; returns the clamped value.
    pub fn set_gain_db(&self, gain_db: f32) -> f32 {
        self.set(Volume {
            gain_db,
            muted: self.is_muted(),
        })
        .gain_db
    }

    /// Set only the mute switch.
    pub fn set_muted(&self, muted: bool) {
        self.set(Volume {
            gain_db: self.gain_db(),
            muted,
        });
    }

    /// Accepted gain range in dB.
    pub fn range(&self) -> (f32, f32) {
        (self.min_db, self.max_db)
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new(-96.0, 12.0)
    }
}

impl Control for VolumeControl {
    type Value = Volume;

    fn get(&self) -> Volume {
        Volume {
            gain_db: self.gain_db(),
            muted: self.is_muted(),
        }
    }

    fn set(&self, value: Volume) -> Volume {
        let gain_db = if value.gain_db.is_nan() {
            self.gain_db()
        } else {
            value.gain_db.clamp(self.min_db, self.max_db)
        };
        let applied = Volume {
            gain_db,
            muted: value.muted,
        };
        let previous = self.get();
        self.gain_bits.store(gain_db.to_bits(), Ordering::Release);
        self.muted.store(applied.muted, Ordering::Release);

        if previous != applied {
            tracing::debug!(gain_db, muted = applied.muted, "volume changed");
            for (_, observer) in self.observers.lock().iter() {
                observer(applied);
            }
        }
        applied
    }

    fn observe(&self, observer: Observer<Volume>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }
}

impl std::fmt::Debug for VolumeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeControl")
            .field("volume", &self.get())
            .field("range", &self.range())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn gain_is_clamped() {
        let volume = VolumeControl::new(-60.0, 6.0);
        assert_eq!(volume.set_gain_db(20.0), 6.0);
        assert_eq!(volume.set_gain_db(-100.0), -60.0);
        assert_eq!(volume.set_gain_db(f32::NAN), -60.0);
    }

    #[test]
    fn mute_zeroes_linear_gain() {
        let volume = VolumeControl::default();
        assert!((volume.linear_gain() - 1.0).abs() < 1e-6);
        volume.set_muted(true);
        assert_eq!(volume.linear_gain(), 0.0);
        volume.set_muted(false);
        volume.set_gain_db(-20.0);
        assert!((volume.linear_gain() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn observers_see_changes_only() {
        let volume = VolumeControl::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = volume.observe(Box::new(move |v| sink.lock().push(v)));

        volume.set_gain_db(-6.0);
        volume.set_gain_db(-6.0);
        volume.set_muted(true);
        assert_eq!(seen.lock().len(), 2);
        assert!(seen.lock()[1].muted);

        assert!(volume.unobserve(id));
        assert!(!volume.unobserve(id));
        volume.set_gain_db(0.0);
        assert_eq!(seen.lock().len(), 2);
    }
}
