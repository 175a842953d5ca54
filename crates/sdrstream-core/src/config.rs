//! # Configuration
//!
//! YAML configuration for sdrstream applications: which device to open,
//! how to tune it, stream defaults and logging.
//!
//! ## Search Path
//!
//! [`SdrStreamConfig::load`] reads the first file found:
//! 1. Path in the `SDRSTREAM_CONFIG` environment variable
//! 2. `./sdrstream.yaml`
//! 3. `<user config dir>/sdrstream/config.yaml`
//! 4. `/etc/sdrstream/config.yaml`
//!
//! ## Example
//!
//! ```yaml
//! device:
//!   args: "driver=loopback"
//!   sample_rate: 1e6
//!   frequency: 915e6
//!   gain: 20.0
//!
//! stream:
//!   format: CF32
//!   channels: [0]
//!   args: "bufflen=4096"
//!   timeout_us: 100000
//!
//! logging:
//!   level: debug
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SdrError;
use crate::format::StreamFormat;
use crate::kwargs::Kwargs;
use crate::observe::LogConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SDRSTREAM_CONFIG";

/// Error type for configuration operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config not found: {0}")]
    NotFound(String),
    #[error("failed to read config: {0}")]
    ReadError(String),
    #[error("failed to parse config: {0}")]
    ParseError(String),
    #[error("invalid config: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for SdrError {
    fn from(err: ConfigError) -> Self {
        SdrError::Config(err.to_string())
    }
}

/// Device selection and frontend tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device args markup, e.g. `driver=loopback,serial=1`
    pub args: String,
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Center frequency in Hz
    pub frequency: f64,
    /// Overall gain in dB
    pub gain: f64,
    /// Antenna name, empty for the driver default
    pub antenna: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            args: String::new(),
            sample_rate: 1_000_000.0,
            frequency: 915_000_000.0,
            gain: 0.0,
            antenna: String::new(),
        }
    }
}

impl DeviceConfig {
    pub fn kwargs(&self) -> Kwargs {
        Kwargs::from(self.args.as_str())
    }
}

/// Defaults applied when an application sets up a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamDefaults {
    /// Format token
    pub format: String,
    pub channels: Vec<usize>,
    /// Stream args markup
    pub args: String,
    /// Per-call timeout in microseconds
    pub timeout_us: i64,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            format: StreamFormat::CF32.to_string(),
            channels: vec![0],
            args: String::new(),
            timeout_us: 100_000,
        }
    }
}

impl StreamDefaults {
    pub fn format(&self) -> Result<StreamFormat, ConfigError> {
        self.format
            .parse()
            .map_err(|_| ConfigError::ValidationError(format!("unknown stream format '{}'", self.format)))
    }

    pub fn kwargs(&self) -> Kwargs {
        Kwargs::from(self.args.as_str())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdrStreamConfig {
    pub version: String,
    pub device: DeviceConfig,
    pub stream: StreamDefaults,
    pub logging: LogConfig,
    /// Named device configurations selectable with [`with_profile`](Self::with_profile)
    pub profiles: BTreeMap<String, DeviceConfig>,
}

impl Default for SdrStreamConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            device: DeviceConfig::default(),
            stream: StreamDefaults::default(),
            logging: LogConfig::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl SdrStreamConfig {
    /// Load from the search path, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(ConfigError::NotFound(format!(
                    "{} points at {}",
                    CONFIG_ENV,
                    path.display()
                )));
            }
            return Self::load_from(&path);
        }

        for path in Self::config_search_paths() {
            if path.exists() {
                tracing::debug!(path = %path.display(), "loading config");
                return Self::load_from(&path);
            }
        }

        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse and validate YAML text.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))
    }

    /// Copy of this config with `device` replaced by a named profile.
    pub fn with_profile(&self, name: &str) -> Result<Self, ConfigError> {
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| ConfigError::NotFound(format!("profile '{}' not found", name)))?;
        let mut config = self.clone();
        config.device = profile.clone();
        Ok(config)
    }

    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./sdrstream.yaml")];
        if let Some(dirs) = directories::ProjectDirs::from("", "", "sdrstream") {
            paths.push(dirs.config_dir().join("config.yaml"));
        }
        paths.push(PathBuf::from("/etc/sdrstream/config.yaml"));
        paths
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.device.sample_rate.is_finite() && self.device.sample_rate > 0.0) {
            return Err(ConfigError::ValidationError(
                "sample_rate must be positive".to_string(),
            ));
        }
        self.stream.format()?;
        if self.stream.channels.is_empty() {
            return Err(ConfigError::ValidationError(
                "stream.channels must not be empty".to_string(),
            ));
        }
        if self.stream.timeout_us < 0 {
            return Err(ConfigError::ValidationError(
                "stream.timeout_us must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::LogLevel;

    #[test]
    fn test_default_config() {
        let config = SdrStreamConfig::default();
        assert_eq!(config.stream.format().unwrap(), StreamFormat::CF32);
        assert_eq!(config.stream.channels, vec![0]);
        assert!(config.device.kwargs().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
device:
  args: "driver=loopback, serial=7"
  sample_rate: 2.4e6
  gain: 35.0

stream:
  format: CS16
  channels: [0, 1]
  args: "bufflen=8192, buffers=15"

logging:
  level: debug
"#;
        let config = SdrStreamConfig::parse(yaml).unwrap();
        assert_eq!(config.device.kwargs().get("driver"), Some("loopback"));
        assert_eq!(config.device.sample_rate, 2_400_000.0);
        assert_eq!(config.stream.format().unwrap(), StreamFormat::CS16);
        assert_eq!(config.stream.kwargs().get("buffers"), Some("15"));
        assert_eq!(config.logging.level, LogLevel::Debug);
        // defaults fill the rest
        assert_eq!(config.stream.timeout_us, 100_000);
    }

    #[test]
    fn test_validation() {
        let err = SdrStreamConfig::parse("stream:\n  format: CF99\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = SdrStreamConfig::parse("device:\n  sample_rate: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = SdrStreamConfig::parse("device: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_profiles() {
        let yaml = r#"
profiles:
  bench:
    args: "driver=loopback"
    sample_rate: 8e6
"#;
        let config = SdrStreamConfig::parse(yaml).unwrap();
        let bench = config.with_profile("bench").unwrap();
        assert_eq!(bench.device.sample_rate, 8_000_000.0);
        assert!(config.with_profile("missing").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!("sdrstream-config-{}.yaml", std::process::id()));
        let mut config = SdrStreamConfig::default();
        config.device.args = "driver=null,type=null".to_string();
        config.save(&path).unwrap();
        let loaded = SdrStreamConfig::load_from(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_error_into_sdr_error() {
        let err: SdrError = ConfigError::NotFound("x".into()).into();
        assert!(matches!(err, SdrError::Config(_)));
    }
}
