//! Configuration file support for the T2LM subsystem
//!
//! Loads and validates tunables from TOML. Every field has a default, so an
//! empty file (or none at all) yields a working configuration.

use crate::error::{Result, T2lmError};
use crate::types::MAX_T2LM_HANDLERS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wlan/t2lm.toml";

/// Timer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Beacon interval (TU) used when the connection reports none
    #[serde(default = "default_beacon_interval_tu")]
    pub default_beacon_interval_tu: u16,
}

/// Link update notifier configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Capacity of the link update handler registry
    #[serde(default = "default_max_handlers")]
    pub max_handlers: usize,
}

/// Beacon processing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Only arm the mapping timer while the connection is up
    #[serde(default = "default_arm_only_when_connected")]
    pub arm_only_when_connected: bool,
}

/// Complete T2LM configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct T2lmConfig {
    /// Timer configuration
    #[serde(default)]
    pub timer: TimerConfig,

    /// Notifier configuration
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Beacon configuration
    #[serde(default)]
    pub beacon: BeaconConfig,
}

fn default_beacon_interval_tu() -> u16 {
    100
}

fn default_max_handlers() -> usize {
    MAX_T2LM_HANDLERS
}

fn default_arm_only_when_connected() -> bool {
    true
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            default_beacon_interval_tu: default_beacon_interval_tu(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_handlers: default_max_handlers(),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            arm_only_when_connected: default_arm_only_when_connected(),
        }
    }
}

impl T2lmConfig {
    /// Parses and validates a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| T2lmError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            T2lmError::Config(msg) => T2lmError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Loads configuration from `path`, falling back to defaults if the file
    /// does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match Self::load(path) {
            Err(T2lmError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Serializes the configuration to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| T2lmError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timer.default_beacon_interval_tu == 0 {
            return Err(T2lmError::Config(
                "default_beacon_interval_tu must be > 0".to_string(),
            ));
        }

        if self.notifier.max_handlers == 0 {
            return Err(T2lmError::Config("max_handlers must be > 0".to_string()));
        }

        Ok(())
    }
}
