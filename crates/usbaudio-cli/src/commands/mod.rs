//! CLI command implementations.

pub mod config;
pub mod pcm;
pub mod simulate;

use std::path::Path;

use usbaudio_config::StreamSettings;

/// Load settings from `path`, or defaults when none is given.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<StreamSettings> {
    let settings = match path {
        Some(path) => StreamSettings::load(path)?,
        None => StreamSettings::default(),
    };
    Ok(settings)
}
