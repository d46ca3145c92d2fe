//! Configuration module for usrecon-rs
//!
//! This module handles application configuration including:
//! - Acquisition readiness requirements
//! - Frame/pose matching tolerances
//! - Reconstruction grid parameters
//! - Session storage location
//!
//! # App Data Location
//!
//! Application data is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.usrecon.usrecon-rs/`
//! - **macOS**: `~/Library/Application Support/dev.usrecon.usrecon-rs/`
//! - **Windows**: `%APPDATA%\dev.usrecon.usrecon-rs\`
//!
//! # Files
//!
//! - `usrecon.toml` - Application configuration
//! - `sessions/` - Recorded sessions (default session root)
//! - `logs/` - Rolling log files written by the binary
//!
//! # Example
//!
//! ```ignore
//! use usrecon_rs::config::AppConfig;
//!
//! let mut config = AppConfig::load_or_default();
//! config.reconstruction.output_spacing_mm = Some(0.5);
//! config.save_to(AppConfig::default_path().unwrap())?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{Result, UsReconError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "dev.usrecon.usrecon-rs";

/// Configuration filename
pub const CONFIG_FILE: &str = "usrecon.toml";

/// Sessions sub-directory
pub const SESSIONS_DIR: &str = "sessions";

/// Log sub-directory
pub const LOGS_DIR: &str = "logs";

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        UsReconError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            UsReconError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

// ==================== App Config ====================

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Version for future migration support
    #[serde(default = "default_config_version")]
    pub version: u32,

    /// Recording settings
    #[serde(default)]
    pub acquisition: AcquisitionSettings,

    /// Frame/pose matching settings
    #[serde(default)]
    pub assembly: AssemblySettings,

    /// Volume reconstruction settings
    #[serde(default)]
    pub reconstruction: ReconstructionSettings,

    /// Session storage settings
    #[serde(default)]
    pub persistence: PersistenceSettings,
}

fn default_config_version() -> u32 {
    1
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            acquisition: AcquisitionSettings::default(),
            assembly: AssemblySettings::default(),
            reconstruction: ReconstructionSettings::default(),
            persistence: PersistenceSettings::default(),
        }
    }
}

impl AppConfig {
    /// Path of the configuration file in the app data directory
    pub fn default_path() -> Option<PathBuf> {
        app_data_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| UsReconError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            UsReconError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load the configuration from the default location
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = Self::default_path().ok_or_else(|| {
            UsReconError::Config("Could not determine config path".to_string())
        })?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(path)
    }

    /// Load the configuration, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the configuration as TOML
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UsReconError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| UsReconError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            UsReconError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.assembly.validate()?;
        self.reconstruction.validate()?;
        Ok(())
    }
}
