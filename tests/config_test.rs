//! Tests for config module

use forkline::config::{Config, Isolation};
use std::path::Path;
use std::time::Duration;

#[test]
fn test_config_file_exists() {
    let config_path = Path::new("config.toml");
    assert!(
        config_path.exists(),
        "config.toml should exist in project root"
    );
}

#[test]
fn test_config_toml_readable() {
    let content =
        std::fs::read_to_string("config.toml").expect("Should be able to read config.toml");

    // Basic validation - should have expected sections
    for section in ["[supervisor]", "[worker]", "[scheduler]", "[logging]"] {
        assert!(
            content.contains(section),
            "config.toml should have {section} section"
        );
    }
}

#[test]
fn test_config_toml_loads_and_validates() {
    let config = Config::from_file(Path::new("config.toml")).expect("config.toml should parse");
    config.validate().expect("config.toml should be valid");

    assert_eq!(config.supervisor.worker_num, 4);
    assert_eq!(config.supervisor.isolation, Isolation::Process);
    assert_eq!(config.supervisor.drain_timeout(), Duration::from_secs(15));
    assert_eq!(config.supervisor.kill_after(), Duration::from_millis(15_500));
    assert_eq!(config.worker.request_limit, 10_000);
    assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(1));
}

#[test]
fn test_sample_matches_defaults_except_pool_size() {
    let mut config = Config::from_file(Path::new("config.toml")).unwrap();
    let defaults = Config::default();

    config.supervisor.worker_num = defaults.supervisor.worker_num;
    assert_eq!(config, defaults);
}
