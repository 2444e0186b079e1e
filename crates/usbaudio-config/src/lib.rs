//! Stream settings for the usbaudio engine.
//!
//! Settings live in TOML files. Every field has a default, so a file only
//! needs the values that differ. [`StreamSettings::validate`] reports every
//! problem at once, and the conversion methods hand out the configs the
//! managers in `usbaudio-stream` take.
//!
//! # Example
//!
//! ```rust
//! use usbaudio_config::StreamSettings;
//!
//! let settings = StreamSettings::from_toml(
//!     r#"
//! ring_frames = 2048
//!
//! [format]
//! sample_rate = 44100
//! bit_depth = 24
//! "#,
//! )
//! .unwrap();
//!
//! assert!(settings.validate().is_empty());
//! assert_eq!(settings.session_config().ring_bytes(), 2048 * 6);
//! assert_eq!(settings.input_config().format.sample_rate, 44100);
//! ```

mod error;
mod settings;

pub use error::ConfigError;
pub use settings::{
    Bus, ClockMaster, FilterSettings, FormatSettings, InputSettings, OutputSettings,
    StreamSettings,
};
