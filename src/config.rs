//! Configuration
//!
//! [`Config`] holds the handful of locations and limits the restore and
//! rollback machinery needs. It is loaded once, at process start, and
//! passed by reference to whatever needs it.
//!
//! ```rust
//! use fsdelta::Config;
//!
//! let config = Config::default()
//!     .with_rollback_path("/var/backups/fsdelta-rollback")
//!     .with_limits(vec!["/etc".to_string(), "-/etc/.git".to_string()]);
//! config.validate().unwrap();
//! ```

use crate::error::{DeltaError, Result};
use crate::limits::Limits;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default location of rollback state
pub const DEFAULT_ROLLBACK_PATH: &str = "/var/backups/fsdelta-rollback";

/// Default location of the profile's baseline index
pub const DEFAULT_PROFILE_DIRINDEX: &str = "/var/lib/fsdelta/profile/dirindex";

/// Process-wide settings, passed explicitly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where rollback state lives
    pub rollback_path: PathBuf,
    /// Directory holding `passwd` and `group`
    pub etc_path: PathBuf,
    /// Baseline directory index of the profile
    pub profile_dirindex: PathBuf,
    /// Limit tokens scoping backups and restores
    pub limits: Vec<String>,
    /// Whether restores record rollback state
    pub rollback_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rollback_path: PathBuf::from(DEFAULT_ROLLBACK_PATH),
            etc_path: PathBuf::from("/etc"),
            profile_dirindex: PathBuf::from(DEFAULT_PROFILE_DIRINDEX),
            limits: Vec::new(),
            rollback_enabled: true,
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        crate::utils::atomic_write(path, content.as_bytes())
    }

    /// Check paths are absolute and limits parse
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("rollback_path", &self.rollback_path),
            ("etc_path", &self.etc_path),
            ("profile_dirindex", &self.profile_dirindex),
        ] {
            if !path.is_absolute() {
                return Err(DeltaError::InvalidConfiguration(format!(
                    "{} must be absolute, got {:?}",
                    name, path
                )));
            }
        }
        self.parsed_limits()?;
        Ok(())
    }

    /// Parsed form of [`Config::limits`]
    pub fn parsed_limits(&self) -> Result<Limits> {
        Limits::from_tokens(&self.limits)
    }

    /// Set the rollback location
    pub fn with_rollback_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rollback_path = path.into();
        self
    }

    /// Set the directory holding `passwd` and `group`
    pub fn with_etc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.etc_path = path.into();
        self
    }

    /// Set the baseline index location
    pub fn with_profile_dirindex(mut self, path: impl Into<PathBuf>) -> Self {
        self.profile_dirindex = path.into();
        self
    }

    /// Set the limit tokens
    pub fn with_limits(mut self, limits: Vec<String>) -> Self {
        self.limits = limits;
        self
    }

    /// Enable or disable rollback state
    pub fn with_rollback(mut self, enabled: bool) -> Self {
        self.rollback_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.etc_path, PathBuf::from("/etc"));
        assert!(config.rollback_enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{ "limits": ["/etc", "mysql:app"], "rollback_enabled": false }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.rollback_path, PathBuf::from(DEFAULT_ROLLBACK_PATH));
        assert!(!config.rollback_enabled);
        assert_eq!(config.parsed_limits().unwrap().db, vec!["app"]);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        let config = Config::default()
            .with_etc_path(temp.path().join("etc"))
            .with_limits(vec!["/srv".to_string()]);
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_relative_and_bad_limits() {
        let config = Config::default().with_rollback_path("rollback");
        assert!(matches!(config.validate(), Err(DeltaError::InvalidConfiguration(_))));

        let config = Config::default().with_limits(vec!["etc".to_string()]);
        assert!(matches!(config.validate(), Err(DeltaError::InvalidLimit(_))));
    }
}
