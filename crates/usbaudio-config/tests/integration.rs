//! Settings round trips through the filesystem.

use tempfile::TempDir;
use usbaudio_config::{Bus, ClockMaster, ConfigError, StreamSettings};

#[test]
fn save_then_load_preserves_settings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stream.toml");

    let mut settings = StreamSettings::default();
    settings.format.sample_rate = 96000;
    settings.format.bit_depth = 24;
    settings.bus = Bus::High;
    settings.clock_master = ClockMaster::Output;
    settings.input.strip_stray_leading_bytes = false;
    settings.output.lists_in_flight = 3;
    settings.filter.stiffness = 0.02;
    settings.max_consecutive_errors = Some(12);
    settings.save(&path).unwrap();

    let loaded = StreamSettings::load(&path).unwrap();
    assert_eq!(loaded, settings);
    assert!(loaded.validate().is_empty());
}

#[test]
fn missing_file_reports_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");
    let err = StreamSettings::load(&path).unwrap_err();
    match err {
        ConfigError::ReadFile { path: p, .. } => assert_eq!(p, path),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn saving_into_missing_directory_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("no").join("such").join("stream.toml");
    let err = StreamSettings::default().save(&path).unwrap_err();
    assert!(matches!(err, ConfigError::WriteFile { .. }));
}

#[test]
fn rendered_defaults_parse_back() {
    let text = StreamSettings::default().to_toml().unwrap();
    assert!(text.contains("[format]"));
    assert!(text.contains("bus = \"full\""));
    assert!(!text.contains("max_consecutive_errors"));
    assert_eq!(
        StreamSettings::from_toml(&text).unwrap(),
        StreamSettings::default()
    );
}

#[test]
fn loaded_file_drives_the_engine() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stream.toml");
    std::fs::write(
        &path,
        r#"
ring_frames = 1024

[format]
channels = 1

[output]
frame_lists = 6
lists_in_flight = 2
"#,
    )
    .unwrap();

    let settings = StreamSettings::load(&path).unwrap();
    settings.ensure_valid().unwrap();
    assert_eq!(settings.session_config().ring_bytes(), 2048);
    let output = settings.output_config();
    assert_eq!(output.frame_lists, 6);
    assert_eq!(output.lists_in_flight, 2);
    assert_eq!(output.format.channels, 1);
}
