//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across all shvar applications, and the [`RegistryConfig`] every process
//! uses to locate the shared segment.
//!
//! # Usage
//!
//! ```rust,no_run
//! use shvar_common::config::{ConfigLoader, MonitorConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = MonitorConfig::load(Path::new("shvar.toml"))?;
//!     config.registry.validate()?;
//!     println!("Segment: {}", config.registry.segment_name);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_ATTACH_TIMEOUT_MS, DEFAULT_SEGMENT_NAME, DEFAULT_SEGMENT_SIZE, DEFAULT_SHM_DIR,
    ENV_SEGMENT_NAME, ENV_SEGMENT_SIZE, ENV_SHM_DIR, MAX_SEGMENT_NAME_LEN, SHM_MAX_SIZE,
    SHM_MIN_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration loading operations.
///
/// This enum represents all possible errors that can occur when loading
/// configuration files.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Represents the verbosity level of logging output.
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all shvar applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "shvar-monitor"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `service_name` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: "shvar".to_string(),
        }
    }
}

/// Location and size of the shared variable segment.
///
/// All cooperating processes must agree on `segment_name` and `shm_dir`.
/// `capacity` only matters to the process that creates the segment; openers
/// adopt the capacity recorded in the segment header.
///
/// # TOML Example
///
/// ```toml
/// [registry]
/// segment_name = "plant_vars"
/// capacity = 4194304
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Name of the backing object, identical across processes.
    pub segment_name: String,
    /// Total segment size in bytes, header and bookkeeping included.
    pub capacity: usize,
    /// Directory holding the backing file.
    pub shm_dir: PathBuf,
    /// How long an opener waits for the creator to publish the header.
    pub attach_timeout_ms: u64,
    /// Pre-fault all pages when mapping.
    pub prefault: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            segment_name: DEFAULT_SEGMENT_NAME.to_string(),
            capacity: DEFAULT_SEGMENT_SIZE,
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            attach_timeout_ms: DEFAULT_ATTACH_TIMEOUT_MS,
            prefault: false,
        }
    }
}

impl RegistryConfig {
    /// Default configuration with a different segment name.
    pub fn named(segment_name: impl Into<String>) -> Self {
        Self {
            segment_name: segment_name.into(),
            ..Self::default()
        }
    }

    /// Full path of the backing file.
    pub fn segment_path(&self) -> PathBuf {
        self.shm_dir.join(&self.segment_name)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `segment_name` is not a valid segment name
    /// - `capacity` is outside 4KB-1GB or not page-aligned
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_segment_name(&self.segment_name)?;

        if self.capacity < SHM_MIN_SIZE || self.capacity > SHM_MAX_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "capacity {} outside {}..={} bytes",
                self.capacity, SHM_MIN_SIZE, SHM_MAX_SIZE
            )));
        }
        if self.capacity % SHM_MIN_SIZE != 0 {
            return Err(ConfigError::ValidationError(format!(
                "capacity {} is not a multiple of {}",
                self.capacity, SHM_MIN_SIZE
            )));
        }
        Ok(())
    }

    /// Apply `SHVAR_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(ENV_SEGMENT_NAME) {
            tracing::debug!("{} overrides segment name: {}", ENV_SEGMENT_NAME, name);
            self.segment_name = name;
        }
        if let Some(size) = lookup(ENV_SEGMENT_SIZE) {
            self.capacity = size.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("{ENV_SEGMENT_SIZE}={size} is not a byte count"))
            })?;
        }
        if let Some(dir) = lookup(ENV_SHM_DIR) {
            self.shm_dir = PathBuf::from(dir);
        }
        Ok(())
    }
}

/// Validate a segment name: a single, non-hidden file name component.
pub fn validate_segment_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > MAX_SEGMENT_NAME_LEN {
        return Err(ConfigError::ValidationError(format!(
            "segment name must be 1..={MAX_SEGMENT_NAME_LEN} bytes"
        )));
    }
    if name.starts_with('.') {
        return Err(ConfigError::ValidationError(
            "segment name cannot start with '.'".to_string(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    {
        return Err(ConfigError::ValidationError(format!(
            "segment name '{name}' contains characters outside [A-Za-z0-9_.-]"
        )));
    }
    Ok(())
}

/// Configuration file of the `shvar_monitor` binary.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "shvar-monitor"
///
/// [registry]
/// segment_name = "plant_vars"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Common application settings.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Segment location.
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl MonitorConfig {
    /// Load from `path` if given, otherwise start from defaults; then apply
    /// environment overrides and validate.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.registry.apply_env_overrides()?;
        config.shared.validate()?;
        config.registry.validate()?;
        Ok(config)
    }
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Returns
    ///
    /// * `Ok(Self)` - Successfully loaded and parsed configuration
    /// * `Err(ConfigError)` - Loading or parsing failed
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
// This allows any serde-deserializable struct to use ConfigLoader.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct TestWrapper {
            level: LogLevel,
        }

        for (text, level) in [
            ("trace", LogLevel::Trace),
            ("debug", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            let parsed: TestWrapper = toml::from_str(&format!("level = \"{text}\"")).unwrap();
            assert_eq!(parsed.level, level);
            assert_eq!(level.as_str(), text);
        }
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_registry_config_defaults_are_valid() {
        let config = RegistryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.segment_path(), PathBuf::from("/dev/shm/shvar_registry_v0"));
    }

    #[test]
    fn test_registry_config_rejects_bad_capacity() {
        let mut config = RegistryConfig::named("caps");
        config.capacity = 1024;
        assert!(config.validate().is_err());

        config.capacity = SHM_MIN_SIZE + 1;
        assert!(config.validate().is_err());

        config.capacity = SHM_MAX_SIZE + SHM_MIN_SIZE;
        assert!(config.validate().is_err());

        config.capacity = 8 * SHM_MIN_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_segment_name_validation() {
        assert!(validate_segment_name("plant_vars-1.v0").is_ok());
        assert!(validate_segment_name("").is_err());
        assert!(validate_segment_name(".hidden").is_err());
        assert!(validate_segment_name("a/b").is_err());
        assert!(validate_segment_name("with space").is_err());
        assert!(validate_segment_name(&"x".repeat(MAX_SEGMENT_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env: HashMap<&str, &str> = [
            (ENV_SEGMENT_NAME, "override_seg"),
            (ENV_SEGMENT_SIZE, " 65536 "),
            (ENV_SHM_DIR, "/tmp/shvar"),
        ]
        .into_iter()
        .collect();

        let mut config = RegistryConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.segment_name, "override_seg");
        assert_eq!(config.capacity, 65536);
        assert_eq!(config.shm_dir, PathBuf::from("/tmp/shvar"));
    }

    #[test]
    fn test_override_rejects_non_numeric_size() {
        let mut config = RegistryConfig::default();
        let result = config.apply_overrides(|key| {
            (key == ENV_SEGMENT_SIZE).then(|| "two megabytes".to_string())
        });
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
        assert_eq!(config.capacity, DEFAULT_SEGMENT_SIZE);
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = MonitorConfig::load(Path::new("/nonexistent/path/shvar.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = MonitorConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_monitor_config_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[shared]
log_level = "debug"
service_name = "monitor-01"

[registry]
segment_name = "plant_vars"
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.shared.service_name, "monitor-01");
        assert_eq!(config.registry.segment_name, "plant_vars");
        assert_eq!(config.registry.capacity, DEFAULT_SEGMENT_SIZE);
        assert_eq!(config.registry.attach_timeout_ms, DEFAULT_ATTACH_TIMEOUT_MS);
    }
}
