//! Configuration file support for stmboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (STMBOOT_*)
//! 3. Local config file (./stmboot.toml)
//! 4. Global config file (~/.config/stmboot/config.toml)
//!
//! `--config PATH` replaces both files.
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//! timeout_ms = 1000
//! parity = "even"
//!
//! [target]
//! app_address = 0x0800_8000
//! erase_sectors = 6
//! verify = true
//! ```

use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use stmboot::Parity;

use crate::CliError;

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = "stmboot.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Read timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Parity ("none", "even", "odd").
    pub parity: Option<Parity>,
}

/// Target memory layout configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Application start address.
    pub app_address: Option<u32>,
    /// Number of application sectors to erase.
    pub erase_sectors: Option<u8>,
    /// Verify after flashing.
    pub verify: Option<bool>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Target settings.
    #[serde(default)]
    pub target: TargetConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Unreadable or malformed files are reported and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            match Self::load_from_file(&global_path) {
                Ok(Some(global_config)) => {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                },
                Ok(None) => {},
                Err(e) => warn!("{e:#}"),
            }
        }

        // Load local config (overrides global)
        match Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            Ok(Some(local_config)) => {
                debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
                config.merge(local_config);
            },
            Ok(None) => {},
            Err(e) => warn!("{e:#}"),
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike the implicit files, an explicit path must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        match Self::load_from_file(path) {
            Ok(Some(config)) => {
                debug!("Loaded config from {}", path.display());
                Ok(config)
            },
            Ok(None) => Err(CliError::Usage(format!(
                "Config file {} does not exist",
                path.display()
            ))
            .into()),
            Err(e) => Err(CliError::Usage(format!("{e:#}")).into()),
        }
    }

    /// Load configuration from a specific file, `None` if it does not exist.
    fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(Some(config))
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "stmboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        let Self { connection, target } = other;

        if connection.port.is_some() {
            self.connection.port = connection.port;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }
        if connection.timeout_ms.is_some() {
            self.connection.timeout_ms = connection.timeout_ms;
        }
        if connection.parity.is_some() {
            self.connection.parity = connection.parity;
        }

        if target.app_address.is_some() {
            self.target.app_address = target.app_address;
        }
        if target.erase_sectors.is_some() {
            self.target.erase_sectors = target.erase_sectors;
        }
        if target.verify.is_some() {
            self.target.verify = target.verify;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.connection.parity.is_none());
        assert!(config.target.app_address.is_none());
        assert!(config.target.verify.is_none());
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_overrides_set_values() {
        let mut base = Config::default();
        base.connection.port = Some("/dev/ttyUSB0".to_string());
        base.connection.baud = Some(57600);

        let mut other = Config::default();
        other.connection.port = Some("/dev/ttyACM0".to_string());
        other.target.erase_sectors = Some(2);

        base.merge(other);
        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.connection.baud, Some(57600));
        assert_eq!(base.target.erase_sectors, Some(2));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.target.verify = Some(false);
        base.connection.parity = Some(Parity::Even);

        base.merge(Config::default());
        assert_eq!(base.target.verify, Some(false));
        assert_eq!(base.connection.parity, Some(Parity::Even));
    }

    // ---- TOML parsing ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
port = "COM3"
baud = 115200
timeout_ms = 500
parity = "even"

[target]
app_address = 0x0801_0000
erase_sectors = 4
verify = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("COM3"));
        assert_eq!(config.connection.baud, Some(115200));
        assert_eq!(config.connection.timeout_ms, Some(500));
        assert_eq!(config.connection.parity, Some(Parity::Even));
        assert_eq!(config.target.app_address, Some(0x0801_0000));
        assert_eq!(config.target.erase_sectors, Some(4));
        assert_eq!(config.target.verify, Some(false));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.port.is_none());
        assert!(config.target.app_address.is_none());
    }

    #[test]
    fn test_config_rejects_unknown_parity() {
        assert!(toml::from_str::<Config>("[connection]\nparity = \"mark\"\n").is_err());
    }

    // ---- load_from_path with tempfile ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[connection]\nport = \"/dev/ttyUSB1\"\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_load_from_path_invalid_is_usage_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let err = Config::load_from_path(Path::new("/nonexistent/path/config.toml")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    // ---- global_config_path ----

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("stmboot"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
