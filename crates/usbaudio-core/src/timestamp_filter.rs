//! Jitter-rejecting filter for ring-buffer wrap timestamps.
//!
//! Completion callbacks report "the buffer wrapped at about time T" with
//! several milliseconds of jitter, while host audio scheduling needs
//! sub-millisecond regularity. [`TimestampFilter`] treats the filtered wrap
//! time as a mass on a spring attached to the raw samples:
//!
//! ```text
//! x' = x + dx              predict next wrap
//! u' = s - x'              residual against the raw sample s
//! du = u' - u
//! F  = K·u' + D·du         spring + damper, D = 2·sqrt(M·K)
//! dx = dx + F / M          correct the interval estimate
//! x  = x',  u = u'
//! ```
//!
//! The position only ever advances by the predicted interval, so the output
//! is smooth and monotonic; the residual bends the interval estimate, which
//! lets the filter follow slow clock drift. `D = 2·sqrt(M·K)` makes the loop
//! critically damped: drift is tracked without ringing.
//!
//! # Bootstrap
//!
//! The first samples are validated instead of filtered. Each inter-wrap
//! interval is compared against the interval implied by the configured rate
//! and buffer size; a deviation above `bootstrap_tolerance` (0.1 % by default)
//! resets the count to zero and the offending sample becomes the new
//! reference. The very first sample has no interval and counts as good.
//! On the `bootstrap_samples`-th consecutive good sample the filter locks
//! with `x = last sample`, `dx = expected`, `u = 0`.
//!
//! # Outliers
//!
//! A residual step `|du|` above `max_jump` (a fraction of the expected
//! interval) is treated as an implausible jump, e.g. from a descheduled
//! callback thread: the position still advances but the correction is
//! skipped. After `max_consecutive_rejections` such samples in a row the
//! filter drops back into bootstrap to resynchronize.

/// Tuning for [`TimestampFilter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    /// Consecutive good intervals required before locking.
    pub bootstrap_samples: u32,
    /// Allowed relative deviation of a bootstrap interval.
    pub bootstrap_tolerance: f64,
    /// Largest accepted residual step, as a fraction of the expected interval.
    pub max_jump: f64,
    /// Spring constant `K`.
    pub stiffness: f64,
    /// Mass `M`.
    pub mass: f64,
    /// Rejected samples in a row that force a re-bootstrap (0 disables).
    pub max_consecutive_rejections: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            bootstrap_samples: 5,
            bootstrap_tolerance: 0.001,
            max_jump: 0.5,
            stiffness: 0.01,
            mass: 1.0,
            max_consecutive_rejections: 8,
        }
    }
}

impl FilterConfig {
    /// Critical damping coefficient `D = 2·sqrt(M·K)`.
    pub fn damping(&self) -> f64 {
        2.0 * libm::sqrt(self.mass * self.stiffness)
    }
}

/// Bootstrap bookkeeping before the filter locks.
#[derive(Debug, Clone, Copy, Default)]
struct Bootstrap {
    last: Option<f64>,
    good: u32,
}

/// Critically damped second-order filter over wrap timestamps.
///
/// Inputs and outputs share units and epoch (nanoseconds in this workspace).
///
/// # Example
///
/// ```rust
/// use usbaudio_core::{FilterConfig, TimestampFilter};
///
/// let period = 21_333_333.0;
/// let mut filter = TimestampFilter::new(period, FilterConfig::default());
/// for n in 0..20 {
///     filter.update(n as f64 * period);
/// }
/// assert!(filter.is_locked());
/// ```
#[derive(Debug, Clone)]
pub struct TimestampFilter {
    config: FilterConfig,
    damping: f64,
    expected: f64,
    /// Filtered wrap time; `Some` once locked.
    x: Option<f64>,
    dx: f64,
    u: f64,
    bootstrap: Bootstrap,
    rejected_in_row: u32,
    rejected_total: u64,
    accepted_total: u64,
}

impl TimestampFilter {
    /// Create a filter for wraps expected every `expected_interval`.
    pub fn new(expected_interval: f64, config: FilterConfig) -> Self {
        Self {
            damping: config.damping(),
            config,
            expected: expected_interval,
            x: None,
            dx: expected_interval,
            u: 0.0,
            bootstrap: Bootstrap::default(),
            rejected_in_row: 0,
            rejected_total: 0,
            accepted_total: 0,
        }
    }

    /// Return to bootstrap, discarding all state.
    pub fn reset(&mut self) {
        self.x = None;
        self.dx = self.expected;
        self.u = 0.0;
        self.bootstrap = Bootstrap::default();
        self.rejected_in_row = 0;
    }

    /// Change the expected wrap interval and restart.
    pub fn set_expected_interval(&mut self, expected_interval: f64) {
        self.expected = expected_interval;
        self.reset();
    }

    /// Feed one raw wrap timestamp.
    ///
    /// Returns the best estimate of when the wrap occurred: the raw sample
    /// while bootstrapping, the filtered position once locked.
    pub fn update(&mut self, sample: f64) -> f64 {
        match self.x {
            None => {
                self.bootstrap_step(sample);
                sample
            }
            Some(x) => self.filter_step(x, sample),
        }
    }

    fn bootstrap_step(&mut self, sample: f64) {
        match self.bootstrap.last {
            None => self.bootstrap.good = 1,
            Some(last) => {
                let interval = sample - last;
                let deviation = (interval - self.expected).abs();
                if deviation > self.config.bootstrap_tolerance * self.expected {
                    self.bootstrap.good = 0;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(interval, expected = self.expected, "bootstrap sample rejected");
                } else {
                    self.bootstrap.good += 1;
                }
            }
        }
        self.bootstrap.last = Some(sample);

        if self.bootstrap.good >= self.config.bootstrap_samples {
            self.x = Some(sample);
            self.dx = self.expected;
            self.u = 0.0;
            self.rejected_in_row = 0;
            #[cfg(feature = "tracing")]
            tracing::debug!(x = sample, dx = self.dx, "timestamp filter locked");
        }
    }

    fn filter_step(&mut self, x: f64, sample: f64) -> f64 {
        let predicted = x + self.dx;
        let residual = sample - predicted;
        let step = residual - self.u;

        if step.abs() < self.config.max_jump * self.expected {
            let force = self.config.stiffness * residual + self.damping * step;
            self.dx += force / self.config.mass;
            self.u = residual;
            self.rejected_in_row = 0;
            self.accepted_total += 1;
        } else {
            self.rejected_in_row += 1;
            self.rejected_total += 1;
            #[cfg(feature = "tracing")]
            tracing::debug!(residual, step, "timestamp outlier rejected");

            let limit = self.config.max_consecutive_rejections;
            if limit > 0 && self.rejected_in_row >= limit {
                #[cfg(feature = "tracing")]
                tracing::debug!(rejected = self.rejected_in_row, "timestamp filter resync");
                self.reset();
                self.bootstrap.last = Some(sample);
                return sample;
            }
        }

        self.x = Some(predicted);
        predicted
    }

    /// Whether bootstrap has completed.
    pub fn is_locked(&self) -> bool {
        self.x.is_some()
    }

    /// Filtered wrap time, once locked.
    pub fn position(&self) -> Option<f64> {
        self.x
    }

    /// Current inter-wrap interval estimate.
    pub fn interval(&self) -> f64 {
        self.dx
    }

    /// Residual of the last accepted sample.
    pub fn residual(&self) -> f64 {
        self.u
    }

    /// Interval implied by the configured rate and buffer size.
    pub fn expected_interval(&self) -> f64 {
        self.expected
    }

    /// Samples rejected as outliers since creation.
    pub fn rejected(&self) -> u64 {
        self.rejected_total
    }

    /// Samples accepted into the loop since creation.
    pub fn accepted(&self) -> u64 {
        self.accepted_total
    }

    /// Active tuning.
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: f64 = 21_333_333.333;
    const EPOCH: f64 = 5.0e9;

    fn locked_filter() -> TimestampFilter {
        let mut f = TimestampFilter::new(PERIOD, FilterConfig::default());
        for n in 0..6 {
            f.update(EPOCH + n as f64 * PERIOD);
        }
        assert!(f.is_locked());
        f
    }

    #[test]
    fn damping_is_critical() {
        let cfg = FilterConfig {
            stiffness: 0.04,
            mass: 1.0,
            ..FilterConfig::default()
        };
        assert!((cfg.damping() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn locks_on_fifth_good_sample() {
        let mut f = TimestampFilter::new(PERIOD, FilterConfig::default());
        for n in 0..4 {
            f.update(EPOCH + n as f64 * PERIOD);
            assert!(!f.is_locked(), "locked early at sample {n}");
        }
        f.update(EPOCH + 4.0 * PERIOD);
        assert!(f.is_locked());
        assert_eq!(f.position(), Some(EPOCH + 4.0 * PERIOD));
        assert_eq!(f.interval(), PERIOD);
        assert_eq!(f.residual(), 0.0);
    }

    #[test]
    fn single_sample_bootstrap_locks_immediately() {
        let cfg = FilterConfig {
            bootstrap_samples: 1,
            ..FilterConfig::default()
        };
        let mut f = TimestampFilter::new(PERIOD, cfg);
        assert_eq!(f.update(EPOCH), EPOCH);
        assert!(f.is_locked());
    }

    #[test]
    fn bootstrap_returns_raw_samples() {
        let mut f = TimestampFilter::new(PERIOD, FilterConfig::default());
        assert_eq!(f.update(123.0), 123.0);
        assert_eq!(f.update(456.0), 456.0);
    }

    #[test]
    fn bad_interval_restarts_bootstrap() {
        let mut f = TimestampFilter::new(PERIOD, FilterConfig::default());
        let mut t = EPOCH;
        for _ in 0..4 {
            f.update(t);
            t += PERIOD;
        }
        // 1% deviation breaks the run
        t += PERIOD * 0.01;
        f.update(t);
        for _ in 0..4 {
            t += PERIOD;
            f.update(t);
            assert!(!f.is_locked());
        }
        t += PERIOD;
        f.update(t);
        assert!(f.is_locked());
    }

    #[test]
    fn periodic_input_tracks_exactly() {
        let mut f = locked_filter();
        for n in 6..200 {
            let s = EPOCH + n as f64 * PERIOD;
            let out = f.update(s);
            assert!((out - s).abs() < PERIOD * 0.01, "n={n} err={}", out - s);
        }
    }

    #[test]
    fn follows_slow_drift() {
        // Device clock 0.05% fast relative to the nominal rate
        let true_period = PERIOD * 1.0005;
        let mut f = TimestampFilter::new(PERIOD, FilterConfig::default());
        let mut last_err = 0.0;
        for n in 0..400 {
            let s = EPOCH + n as f64 * true_period;
            let out = f.update(s);
            if f.is_locked() {
                let err = (out - s).abs();
                assert!(err < PERIOD * 0.01, "n={n} err={err}");
                last_err = err;
            }
        }
        assert!(last_err < PERIOD * 1e-4, "did not settle: {last_err}");
        assert!((f.interval() - true_period).abs() < PERIOD * 1e-5);
    }

    #[test]
    fn single_outlier_is_ignored() {
        let mut f = locked_filter();
        for n in 6..40 {
            f.update(EPOCH + n as f64 * PERIOD);
        }
        let outlier = EPOCH + 40.0 * PERIOD + 10.0 * PERIOD;
        let out = f.update(outlier);
        assert!((out - (EPOCH + 40.0 * PERIOD)).abs() < PERIOD * 0.01);
        assert_eq!(f.rejected(), 1);

        for n in 41..60 {
            let s = EPOCH + n as f64 * PERIOD;
            let out = f.update(s);
            assert!((out - s).abs() < PERIOD * 0.01);
        }
    }

    #[test]
    fn persistent_jump_forces_resync() {
        let mut f = locked_filter();
        // The stream shifts by half a period for good
        let shift = PERIOD * 0.6;
        let mut n = 6;
        while f.is_locked() {
            f.update(EPOCH + n as f64 * PERIOD + shift);
            n += 1;
            assert!(n < 20, "never resynced");
        }
        assert_eq!(f.rejected(), 8);

        for _ in 0..5 {
            f.update(EPOCH + n as f64 * PERIOD + shift);
            n += 1;
        }
        assert!(f.is_locked());
        let s = EPOCH + n as f64 * PERIOD + shift;
        assert!((f.update(s) - s).abs() < 1.0);
    }

    #[test]
    fn output_is_monotonic_under_jitter() {
        let mut f = locked_filter();
        let mut prev = f.position().unwrap();
        for n in 6..300 {
            // Deterministic +-2% jitter
            let jitter = ((n * 7919) % 41) as f64 / 40.0 * 0.04 - 0.02;
            let out = f.update(EPOCH + n as f64 * PERIOD + jitter * PERIOD);
            assert!(out > prev);
            prev = out;
        }
    }
}
