//! Configuration file I/O operations.

use crate::config::ServiceConfig;
use std::fs;
use std::io;
use std::path::Path;

/// Error type for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Load configuration from the default location.
pub fn load_config() -> Result<ServiceConfig, ConfigError> {
    load_config_from(&ServiceConfig::config_file())
}

/// Load configuration from a specific path.
pub fn load_config_from(path: &Path) -> Result<ServiceConfig, ConfigError> {
    if !path.exists() {
        return Ok(ServiceConfig::default());
    }

    let contents = fs::read_to_string(path)?;
    let config: ServiceConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Save configuration to the default location.
pub fn save_config(config: &ServiceConfig) -> Result<(), ConfigError> {
    save_config_to(config, &ServiceConfig::config_file())
}

/// Save configuration to a specific path.
pub fn save_config_to(config: &ServiceConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LunConfig;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn default_config_roundtrip() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        let mut config = ServiceConfig::default();
        config.luns.push(LunConfig {
            lun: 0,
            path: PathBuf::from("/tmp/image.iso"),
            ..LunConfig::default()
        });
        save_config_to(&config, &config_path).unwrap();

        let loaded = load_config_from(&config_path).unwrap();
        assert_eq!(loaded.listen.address, config.listen.address);
        assert_eq!(loaded.luns.len(), 1);
        assert_eq!(loaded.luns[0].path, PathBuf::from("/tmp/image.iso"));
    }

    #[test]
    fn load_nonexistent_returns_default() {
        let config = load_config_from(Path::new("/nonexistent/path/config.toml")).unwrap();
        assert!(config.luns.is_empty());
    }
}
