//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across devsup applications, plus the host configuration read by `devsupd`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use devsup_common::config::{ConfigLoader, HostConfig, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = HostConfig::load(Path::new("devsupd.toml"))?;
//!     config.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::params::Parameters;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
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

/// Log severity, used both for the process-wide tracing filter and for the
/// per-node filters of the device tree.
///
/// Ordered from most to least verbose; `None` disables output.
/// Uses lowercase serde values for TOML compatibility.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogLevel {
    /// Debug information useful during development.
    Debug = 0,
    /// General information about device operation.
    Info = 1,
    /// Potentially problematic situations.
    #[default]
    Warning = 2,
    /// Serious problems.
    Error = 3,
    /// Stream disabled.
    None = 4,
}

impl LogLevel {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Debug),
            1 => Some(Self::Info),
            2 => Some(Self::Warning),
            3 => Some(Self::Error),
            4 => Some(Self::None),
            _ => None,
        }
    }

    /// True if a message of `severity` passes a filter set to `self`.
    #[inline]
    pub fn allows(self, severity: LogLevel) -> bool {
        severity != LogLevel::None && self != LogLevel::None && severity >= self
    }

    /// Equivalent `tracing_subscriber::EnvFilter` directive.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
            Self::None => "off",
        }
    }
}

/// Common configuration fields shared across devsup applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "info"
/// service_name = "devsupd-lab-01"
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
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where drivers come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriversConfig {
    /// Directories scanned for driver modules.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Module files loaded explicitly, in order.
    #[serde(default)]
    pub modules: Vec<PathBuf>,
}

/// One device to allocate at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Registered driver name.
    pub driver: String,

    /// Unique instance name; becomes the root of the device's channel names.
    pub name: String,

    /// Driver-specific construction parameters.
    #[serde(default)]
    pub parameters: Parameters,
}

/// Lifecycle requests issued to every device after allocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Request `ON` after allocation.
    #[serde(default)]
    pub switch_on: bool,

    /// Request `RUNNING` once on.
    #[serde(default)]
    pub start: bool,
}

/// Configuration of the `devsupd` host.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "devsupd"
///
/// [drivers]
/// search_paths = ["/usr/lib/devsup"]
///
/// [[devices]]
/// driver = "thermo"
/// name = "probe1"
/// parameters = { ambient = "21.0" }
///
/// [startup]
/// switch_on = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Common fields.
    pub shared: SharedConfig,

    /// Driver discovery.
    #[serde(default)]
    pub drivers: DriversConfig,

    /// Devices allocated at startup.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Startup lifecycle requests.
    #[serde(default)]
    pub startup: StartupConfig,
}

impl HostConfig {
    /// Minimal configuration used when no file is given.
    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            shared: SharedConfig {
                log_level: LogLevel::Info,
                service_name: service_name.into(),
            },
            drivers: DriversConfig::default(),
            devices: Vec::new(),
            startup: StartupConfig::default(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - the shared section is invalid
    /// - a device has an empty driver or instance name
    /// - two devices share an instance name
    /// - `startup.start` is set without `startup.switch_on`
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.driver.is_empty() || device.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "device driver and name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "device name '{}' used twice",
                    device.name
                )));
            }
        }

        if self.startup.start && !self.startup.switch_on {
            return Err(ConfigError::ValidationError(
                "startup.start requires startup.switch_on".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for every `serde::de::DeserializeOwned` type.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading configuration from {:?}", path);
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

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default_is_warning() {
        assert_eq!(LogLevel::default(), LogLevel::Warning);
    }

    #[test]
    fn test_log_level_filtering() {
        assert!(LogLevel::Warning.allows(LogLevel::Error));
        assert!(LogLevel::Warning.allows(LogLevel::Warning));
        assert!(!LogLevel::Warning.allows(LogLevel::Info));
        assert!(LogLevel::Debug.allows(LogLevel::Debug));
        assert!(!LogLevel::None.allows(LogLevel::Error));
        assert!(!LogLevel::Debug.allows(LogLevel::None));
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct TestWrapper {
            level: LogLevel,
        }

        for (text, level) in [
            ("debug", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warning", LogLevel::Warning),
            ("error", LogLevel::Error),
            ("none", LogLevel::None),
        ] {
            let parsed = toml::from_str::<TestWrapper>(&format!("level = \"{text}\""))
                .unwrap()
                .level;
            assert_eq!(parsed, level);
            assert_eq!(LogLevel::from_u8(level as u8), Some(level));
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
    fn test_config_loader_file_not_found() {
        let result = HostConfig::load(Path::new("/nonexistent/path/devsupd.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = HostConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_host_config_load() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[shared]
log_level = "debug"
service_name = "devsupd-test"

[drivers]
search_paths = ["/usr/lib/devsup", "/opt/devsup"]

[[devices]]
driver = "thermo"
name = "probe1"
parameters = {{ ambient = "21.5" }}

[[devices]]
driver = "thermo"
name = "probe2"

[startup]
switch_on = true
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = HostConfig::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.drivers.search_paths.len(), 2);
        assert!(config.drivers.modules.is_empty());
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].parameters.get("ambient"), Some("21.5"));
        assert!(config.devices[1].parameters.is_empty());
        assert!(config.startup.switch_on);
        assert!(!config.startup.start);
    }

    #[test]
    fn test_host_config_rejects_duplicate_devices() {
        let mut config = HostConfig::with_service_name("devsupd");
        for _ in 0..2 {
            config.devices.push(DeviceConfig {
                driver: "thermo".to_string(),
                name: "probe1".to_string(),
                parameters: Parameters::new(),
            });
        }
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_host_config_start_requires_switch_on() {
        let mut config = HostConfig::with_service_name("devsupd");
        config.startup.start = true;
        assert!(config.validate().is_err());
        config.startup.switch_on = true;
        assert!(config.validate().is_ok());
    }
}
