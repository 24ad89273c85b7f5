//! Integration tests for configuration loading

use std::time::Duration;
use switchboard::config::{Config, MuxTimings, UpstreamConfig};

#[test]
fn test_default_upstream_config() {
    let config = Config::default();

    assert_eq!(config.upstream.establish_timeout_secs, 10);
    assert_eq!(config.upstream.token_validity_secs, 600);
    assert_eq!(config.upstream.refresh_buffer_secs, 60);
    assert_eq!(config.upstream.idle_timeout_secs, 300);
}

#[test]
fn test_timings_resolution() {
    let timings = Config::default().timings();

    assert_eq!(timings.establish_timeout, Duration::from_secs(10));
    assert_eq!(timings.token_validity, Duration::from_secs(600));
    assert_eq!(timings.refresh_buffer, Duration::from_secs(60));
    assert_eq!(timings.idle_timeout, Duration::from_secs(300));
    assert_eq!(timings.refresh_delay(), Duration::from_secs(540));
}

#[test]
fn test_refresh_delay_never_underflows() {
    let timings = MuxTimings::from(&UpstreamConfig {
        token_validity_secs: 30,
        refresh_buffer_secs: 60,
        ..UpstreamConfig::default()
    });

    assert_eq!(timings.refresh_delay(), Duration::ZERO);
}

#[test]
fn test_load_missing_file_falls_back_to_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config::load_from(&dir.path().join("nope.toml"))?;

    assert_eq!(config.upstream.token_validity_secs, 600);
    Ok(())
}

#[test]
fn test_load_config_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[upstream]
establish_timeout_secs = 5
token_validity_secs = 120
refresh_buffer_secs = 30
idle_timeout_secs = 60
"#,
    )?;

    let config = Config::load_from(&path)?;
    assert_eq!(config.upstream.establish_timeout_secs, 5);
    assert_eq!(config.upstream.token_validity_secs, 120);
    assert_eq!(config.upstream.refresh_buffer_secs, 30);
    assert_eq!(config.upstream.idle_timeout_secs, 60);

    Ok(())
}

#[test]
fn test_partial_config_keeps_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[upstream]
idle_timeout_secs = 90
"#,
    )?;

    let config = Config::load_from(&path)?;
    assert_eq!(config.upstream.idle_timeout_secs, 90);
    assert_eq!(config.upstream.establish_timeout_secs, 10);
    assert_eq!(config.upstream.token_validity_secs, 600);

    Ok(())
}
