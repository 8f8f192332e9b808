//! # Peripheral Configuration
//!
//! Static configuration for the GPS receiver, the tag scanner, the actuator
//! pins and the system-log journal.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [gps]
//! serial = "/dev/ttyAMA0"
//! baud = 9600
//!
//! [rfid]
//! strategy = "persistent"
//! client = "/home/pi/proxmark3/client/proxmark3"
//! port = "/dev/ttyACM0"
//! target = "enzogenovese.com"
//!
//! [actuator]
//! hold_pin = 26
//! trigger_pin = 21
//! pulse_ms = 3000
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the GPS, tag scanner, actuator and journal.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gps: GpsConfig,
    #[serde(default)]
    pub rfid: RfidConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

/// GPS receiver serial configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GpsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_gps_serial")]
    pub serial: String,
    #[serde(default = "default_gps_baud")]
    pub baud: u32,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serial: default_gps_serial(),
            baud: default_gps_baud(),
        }
    }
}

/// How the tag tool is driven.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    /// A fresh tool process per scan, commands passed with `-c`.
    OneShot,
    /// One interactive tool process for the scanner's lifetime.
    #[default]
    Persistent,
}

/// Tag scanner configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RfidConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: SessionStrategy,
    #[serde(default = "default_client")]
    pub client: String,
    #[serde(default = "default_rfid_port")]
    pub port: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_snippet_padding")]
    pub snippet_padding: usize,
    #[serde(default)]
    pub first_block: u32,
    #[serde(default = "default_block_count")]
    pub block_count: u32,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub deduplicate: bool,
}

impl Default for RfidConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: SessionStrategy::default(),
            client: default_client(),
            port: default_rfid_port(),
            target: default_target(),
            poll_interval_ms: default_poll_interval_ms(),
            snippet_padding: default_snippet_padding(),
            first_block: 0,
            block_count: default_block_count(),
            prompt: default_prompt(),
            response_timeout_ms: default_response_timeout_ms(),
            deduplicate: true,
        }
    }
}

impl RfidConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Block numbers read on every memory scan.
    pub fn blocks(&self) -> std::ops::Range<u32> {
        self.first_block..self.first_block.saturating_add(self.block_count)
    }
}

/// Actuator output pins (sysfs GPIO numbering).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActuatorConfig {
    #[serde(default = "default_sysfs_base")]
    pub sysfs_base: String,
    #[serde(default = "default_hold_pin")]
    pub hold_pin: u32,
    #[serde(default)]
    pub hold_active_low: bool,
    #[serde(default = "default_trigger_pin")]
    pub trigger_pin: u32,
    #[serde(default)]
    pub trigger_active_low: bool,
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            sysfs_base: default_sysfs_base(),
            hold_pin: default_hold_pin(),
            hold_active_low: false,
            trigger_pin: default_trigger_pin(),
            trigger_active_low: false,
            pulse_ms: default_pulse_ms(),
        }
    }
}

impl ActuatorConfig {
    pub fn pulse_duration(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }
}

/// System log side channel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JournalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_journal_tag")]
    pub tag: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tag: default_journal_tag(),
        }
    }
}

impl Config {
    /// Reject values that would make a worker spin or never match.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gps.baud == 0 {
            return Err(ConfigError::Invalid("gps.baud must be > 0".to_string()));
        }
        if self.rfid.target.is_empty() {
            return Err(ConfigError::Invalid("rfid.target cannot be empty".to_string()));
        }
        if self.rfid.block_count == 0 {
            return Err(ConfigError::Invalid("rfid.block_count must be > 0".to_string()));
        }
        if self.rfid.prompt.is_empty() {
            return Err(ConfigError::Invalid("rfid.prompt cannot be empty".to_string()));
        }
        if self.rfid.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("rfid.poll_interval_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_gps_serial() -> String { "/dev/ttyAMA0".to_string() }
fn default_gps_baud() -> u32 { 9600 }
fn default_client() -> String { "proxmark3".to_string() }
fn default_rfid_port() -> String { "/dev/ttyACM0".to_string() }
fn default_target() -> String { "enzogenovese.com".to_string() }
fn default_poll_interval_ms() -> u64 { 50 }
fn default_snippet_padding() -> usize { 10 }
fn default_block_count() -> u32 { 4 }
fn default_prompt() -> String { "pm3>".to_string() }
fn default_response_timeout_ms() -> u64 { 5000 }
fn default_sysfs_base() -> String { "/sys/class/gpio".to_string() }
fn default_hold_pin() -> u32 { 26 }
fn default_trigger_pin() -> u32 { 21 }
fn default_pulse_ms() -> u64 { 3000 }
fn default_journal_tag() -> String { "gimo-events".to_string() }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
