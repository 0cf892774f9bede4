//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Device configuration.
    pub device: Option<DeviceConfig>,
}

/// Block device settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    /// Path of the device node or backing file.
    pub path: Option<PathBuf>,
    /// Device size in blocks; used when creating a backing file.
    pub blocks: Option<u64>,
    /// Depth of the I/O submission queue.
    pub queue_depth: Option<usize>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `VERSLOG_CONFIG` env var (if set),
    /// then apply `VERSLOG__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("VERSLOG_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("VERSLOG__") {
                continue;
            }
            let path = key["VERSLOG__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["device", "path"] => {
                    self.device_mut().path = Some(PathBuf::from(&value));
                }
                ["device", "blocks"] => {
                    self.device_mut().blocks = Some(parse_value(&key, &value)?);
                }
                ["device", "queue_depth"] => {
                    self.device_mut().queue_depth = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Configured device path, if any.
    pub fn device_path(&self) -> Option<&Path> {
        self.device.as_ref()?.path.as_deref()
    }

    /// Configured device size in blocks, if any.
    pub fn device_blocks(&self) -> Option<u64> {
        self.device.as_ref()?.blocks
    }

    /// Submission queue depth, with its default.
    pub fn queue_depth(&self) -> usize {
        self.device
            .as_ref()
            .and_then(|device| device.queue_depth)
            .unwrap_or(64)
    }

    fn device_mut(&mut self) -> &mut DeviceConfig {
        self.device.get_or_insert_with(DeviceConfig::default)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.device_path().is_none());
        assert!(config.device_blocks().is_none());
        assert_eq!(config.queue_depth(), 64);
    }

    #[test]
    fn test_parse_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [device]
            path = "/dev/nvme0n1"
            blocks = 2048
            queue_depth = 128
            "#,
        )
        .unwrap();

        assert_eq!(
            config.device_path(),
            Some(Path::new("/dev/nvme0n1"))
        );
        assert_eq!(config.device_blocks(), Some(2048));
        assert_eq!(config.queue_depth(), 128);
    }

    #[test]
    fn test_parse_value_rejects_garbage() {
        assert!(parse_value::<u64>("VERSLOG__device__blocks", "not-a-number").is_err());
    }
}
