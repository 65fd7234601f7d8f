//! Config loading tests.
//!
//! Tests for `MonitorConfig` / `RegistryConfig` loading from TOML files:
//! full files, unknown sections, validation of loaded values.

use shvar_common::config::{ConfigError, ConfigLoader, LogLevel, MonitorConfig, RegistryConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write a monitor config file into `dir` and return its path.
fn write_monitor_toml(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("shvar.toml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_full_monitor_config() {
    let dir = TempDir::new().unwrap();
    let path = write_monitor_toml(
        dir.path(),
        r#"
[shared]
log_level = "warn"
service_name = "line-3-monitor"

[registry]
segment_name = "line3"
capacity = 1048576
shm_dir = "/run/shvar"
attach_timeout_ms = 500
prefault = true
"#,
    );

    let config = MonitorConfig::load(&path).unwrap();
    assert_eq!(config.shared.log_level, LogLevel::Warn);
    assert_eq!(config.registry.segment_name, "line3");
    assert_eq!(config.registry.capacity, 1_048_576);
    assert_eq!(config.registry.attach_timeout_ms, 500);
    assert!(config.registry.prefault);
    assert_eq!(
        config.registry.segment_path(),
        Path::new("/run/shvar/line3").to_path_buf()
    );
    assert!(config.registry.validate().is_ok());
}

#[test]
fn test_registry_section_alone() {
    #[derive(Debug, serde::Deserialize)]
    struct Wrapper {
        registry: RegistryConfig,
    }

    let dir = TempDir::new().unwrap();
    let path = write_monitor_toml(
        dir.path(),
        r#"
[registry]
capacity = 12345
"#,
    );

    let config = Wrapper::load(&path).unwrap();
    assert_eq!(config.registry.capacity, 12345);
    assert!(matches!(
        config.registry.validate(),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
fn test_wrong_field_type_is_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write_monitor_toml(
        dir.path(),
        r#"
[registry]
capacity = "large"
"#,
    );

    assert!(matches!(
        MonitorConfig::load(&path),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn test_empty_file_is_all_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_monitor_toml(dir.path(), "");

    let config = MonitorConfig::load(&path).unwrap();
    assert_eq!(config.registry, RegistryConfig::default());
    assert_eq!(config.shared.service_name, "shvar");
}
