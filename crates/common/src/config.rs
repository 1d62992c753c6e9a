//! Library and tool configuration
//!
//! ```toml
//! [context]
//! debug_level = 0
//! event_timeout_ms = 60000
//!
//! [transfers]
//! default_timeout_ms = 1000
//! worker_threads = 4
//!
//! [logging]
//! level = "info"
//! ```

use crate::logging::VALID_LEVELS;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest libusb-style debug level
pub const MAX_DEBUG_LEVEL: u8 = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LusbConfig {
    pub context: ContextSettings,
    pub transfers: TransferSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// 0 none, 1 error, 2 warning, 3 info, 4 debug
    pub debug_level: u8,
    /// Timeout used by `handle_events()` when none is given
    pub event_timeout_ms: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            debug_level: 0,
            event_timeout_ms: 60_000,
        }
    }
}

impl ContextSettings {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Timeout for tool-issued transfers, 0 = unlimited
    pub default_timeout_ms: u64,
    /// Worker threads carrying asynchronous transfers on the rusb backend
    pub worker_threads: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 1000,
            worker_threads: 4,
        }
    }
}

impl TransferSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LusbConfig {
    /// Load configuration from file
    ///
    /// With no explicit path the default location is tried; a missing default
    /// file is an error so callers can decide whether to fall back.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p)?,
            None => {
                let candidate = Self::default_path();
                if !candidate.exists() {
                    return Err(Error::Config(format!(
                        "No configuration file found at {}",
                        candidate.display()
                    )));
                }
                candidate
            }
        };

        let content = fs::read_to_string(&config_path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let config = Self::from_toml(&content)?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration from the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: LusbConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("lusb").join("lusb.toml")
        } else {
            PathBuf::from(".config/lusb/lusb.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.context.debug_level > MAX_DEBUG_LEVEL {
            return Err(Error::Config(format!(
                "Invalid debug_level {}, must be 0..={}",
                self.context.debug_level, MAX_DEBUG_LEVEL
            )));
        }

        if self.transfers.worker_threads == 0 {
            return Err(Error::Config(
                "worker_threads must be at least 1".to_string(),
            ));
        }

        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }

        Ok(())
    }
}

/// Expand `~` and environment variables in a user supplied path
fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .map_err(|e| Error::Config(format!("Failed to expand path {}: {}", raw, e)))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
