//! Stream settings file format and conversion into engine configs.

use serde::{Deserialize, Serialize};
use std::path::Path;

use usbaudio_core::{BusSpeed, FilterConfig, StreamFormat};
use usbaudio_stream::{Direction, InputConfig, OutputConfig, SessionConfig};

use crate::error::ConfigError;

/// Complete settings for one duplex streaming session.
///
/// Every field has a default, so an empty file is a valid configuration.
///
/// # TOML Format
///
/// ```toml
/// bus = "full"
/// ring_frames = 4096
/// clock_master = "input"
/// max_consecutive_errors = 16
///
/// [format]
/// sample_rate = 48000
/// channels = 2
/// bit_depth = 24
///
/// [input]
/// frame_lists = 4
/// frames_per_list = 8
/// drop_initial_frames = 2
/// strip_stray_leading_bytes = true
///
/// [output]
/// frame_lists = 4
/// lists_in_flight = 4
/// frames_per_list = 8
///
/// [filter]
/// bootstrap_samples = 5
/// stiffness = 0.01
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    /// Bus speed of the device.
    pub bus: Bus,

    /// Ring size in audio frames.
    pub ring_frames: usize,

    /// Direction whose ring wraps drive the clock.
    pub clock_master: ClockMaster,

    /// Failed transfers in a row after which a stream gives up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_errors: Option<u32>,

    /// PCM layout shared by both directions.
    pub format: FormatSettings,

    /// Recording endpoint.
    pub input: InputSettings,

    /// Playback endpoint.
    pub output: OutputSettings,

    /// Wrap timestamp filter tuning.
    pub filter: FilterSettings,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            bus: Bus::default(),
            ring_frames: 4096,
            clock_master: ClockMaster::default(),
            max_consecutive_errors: None,
            format: FormatSettings::default(),
            input: InputSettings::default(),
            output: OutputSettings::default(),
            filter: FilterSettings::default(),
        }
    }
}

/// Sample format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FormatSettings {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channels.
    pub channels: u16,
    /// Bits per sample; rounded up to whole bytes.
    pub bit_depth: u16,
}

impl Default for FormatSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            bit_depth: 16,
        }
    }
}

/// USB bus speed as written in settings files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    /// 1 ms frames.
    #[default]
    Full,
    /// 125 µs microframes.
    High,
}

impl From<Bus> for BusSpeed {
    fn from(bus: Bus) -> Self {
        match bus {
            Bus::Full => BusSpeed::Full,
            Bus::High => BusSpeed::High,
        }
    }
}

/// Clock master direction as written in settings files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClockMaster {
    /// Recording endpoint wraps drive the filter.
    #[default]
    Input,
    /// Playback endpoint wraps drive the filter.
    Output,
}

impl From<ClockMaster> for Direction {
    fn from(master: ClockMaster) -> Self {
        match master {
            ClockMaster::Input => Direction::Input,
            ClockMaster::Output => Direction::Output,
        }
    }
}

/// Recording endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputSettings {
    /// Lists kept in flight.
    pub frame_lists: usize,
    /// Packets per list.
    pub frames_per_list: usize,
    /// Packets discarded after each start.
    pub drop_initial_frames: u32,
    /// Remove the 4 stray bytes some controllers prepend.
    pub strip_stray_leading_bytes: bool,
}

impl Default for InputSettings {
    fn default() -> Self {
        let engine = InputConfig::default();
        Self {
            frame_lists: engine.frame_lists,
            frames_per_list: engine.frames_per_list,
            drop_initial_frames: engine.drop_initial_frames,
            strip_stray_leading_bytes: engine.strip_stray_leading_bytes,
        }
    }
}

/// Playback endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputSettings {
    /// Lists allocated.
    pub frame_lists: usize,
    /// Lists kept in flight.
    pub lists_in_flight: usize,
    /// Packets per list.
    pub frames_per_list: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        let engine = OutputConfig::default();
        Self {
            frame_lists: engine.frame_lists,
            lists_in_flight: engine.lists_in_flight,
            frames_per_list: engine.frames_per_list,
        }
    }
}

/// Wrap timestamp filter settings. Mirrors [`FilterConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterSettings {
    /// Good intervals needed to lock.
    pub bootstrap_samples: u32,
    /// Relative deviation allowed while bootstrapping.
    pub bootstrap_tolerance: f64,
    /// Largest accepted step as a fraction of the period.
    pub max_jump: f64,
    /// Spring constant.
    pub stiffness: f64,
    /// Mass.
    pub mass: f64,
    /// Rejections in a row before re-bootstrapping; 0 never re-bootstraps.
    pub max_consecutive_rejections: u32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        FilterConfig::default().into()
    }
}

impl From<FilterConfig> for FilterSettings {
    fn from(c: FilterConfig) -> Self {
        Self {
            bootstrap_samples: c.bootstrap_samples,
            bootstrap_tolerance: c.bootstrap_tolerance,
            max_jump: c.max_jump,
            stiffness: c.stiffness,
            mass: c.mass,
            max_consecutive_rejections: c.max_consecutive_rejections,
        }
    }
}

impl From<&FilterSettings> for FilterConfig {
    fn from(s: &FilterSettings) -> Self {
        Self {
            bootstrap_samples: s.bootstrap_samples,
            bootstrap_tolerance: s.bootstrap_tolerance,
            max_jump: s.max_jump,
            stiffness: s.stiffness,
            mass: s.mass,
            max_consecutive_rejections: s.max_consecutive_rejections,
        }
    }
}

impl StreamSettings {
    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let settings = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "loaded stream settings");
        Ok(settings)
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the settings to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Render the settings as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Every problem that would make the engine reject these settings.
    /// Empty when the settings are usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut require = |ok: bool, problem: &str| {
            if !ok {
                problems.push(problem.to_string());
            }
        };

        require(self.format.sample_rate > 0, "format.sample_rate must be positive");
        require(self.format.channels > 0, "format.channels must be positive");
        require(
            (1..=32).contains(&self.format.bit_depth),
            "format.bit_depth must be between 1 and 32",
        );
        require(self.ring_frames >= 2, "ring_frames must be at least 2");
        require(self.input.frame_lists > 0, "input.frame_lists must be positive");
        require(
            self.input.frames_per_list > 0,
            "input.frames_per_list must be positive",
        );
        require(self.output.frame_lists > 0, "output.frame_lists must be positive");
        require(
            self.output.frames_per_list > 0,
            "output.frames_per_list must be positive",
        );
        require(
            (1..=self.output.frame_lists.max(1)).contains(&self.output.lists_in_flight),
            "output.lists_in_flight must be between 1 and output.frame_lists",
        );
        require(
            self.filter.bootstrap_samples > 0,
            "filter.bootstrap_samples must be positive",
        );
        require(
            self.filter.bootstrap_tolerance > 0.0,
            "filter.bootstrap_tolerance must be positive",
        );
        require(self.filter.max_jump > 0.0, "filter.max_jump must be positive");
        require(self.filter.stiffness > 0.0, "filter.stiffness must be positive");
        require(self.filter.mass > 0.0, "filter.mass must be positive");
        require(
            self.max_consecutive_errors != Some(0),
            "max_consecutive_errors must be positive when set",
        );

        let ring_bytes = self.ring_frames * self.stream_format().bytes_per_frame();
        let packet = self.stream_format().max_packet_bytes(self.bus.into());
        let list_bytes = self.output.frames_per_list * packet;
        require(
            ring_bytes == 0 || list_bytes <= ring_bytes,
            "ring_frames is smaller than one output frame list",
        );
        problems
    }

    /// Fail with [`ConfigError::Invalid`] unless [`validate`](Self::validate)
    /// finds nothing.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Engine stream format.
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat::new(
            self.format.sample_rate,
            self.format.channels,
            self.format.bit_depth,
        )
    }

    /// Engine filter tuning.
    pub fn filter_config(&self) -> FilterConfig {
        (&self.filter).into()
    }

    /// Session config (rings, clock).
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            format: self.stream_format(),
            bus: self.bus.into(),
            ring_frames: self.ring_frames,
            filter: self.filter_config(),
            clock_master: self.clock_master.into(),
        }
    }

    /// Recording manager config.
    pub fn input_config(&self) -> InputConfig {
        InputConfig {
            format: self.stream_format(),
            bus: self.bus.into(),
            frame_lists: self.input.frame_lists,
            frames_per_list: self.input.frames_per_list,
            drop_initial_frames: self.input.drop_initial_frames,
            strip_stray_leading_bytes: self.input.strip_stray_leading_bytes,
            max_consecutive_errors: self.max_consecutive_errors,
        }
    }

    /// Playback manager config.
    pub fn output_config(&self) -> OutputConfig {
        OutputConfig {
            format: self.stream_format(),
            bus: self.bus.into(),
            frame_lists: self.output.frame_lists,
            lists_in_flight: self.output.lists_in_flight,
            frames_per_list: self.output.frames_per_list,
            max_consecutive_errors: self.max_consecutive_errors,
        }
    }
}
