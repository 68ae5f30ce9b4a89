use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::device::{
    DeviceVariant, DEFAULT_RECONNECT_INTERVAL, HANDSHAKE_ATTEMPTS, HANDSHAKE_RETRY_DELAY,
    HANDSHAKE_TIMEOUT, READ_POLL_INTERVAL, RESPONSE_TIMEOUT,
};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub protocol: ProtocolConfig,
    pub display: DisplayConfig,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&contents)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, contents)?;
        Ok(())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")?;
        Ok(PathBuf::from(home).join(".config/loupedeck-link/config.toml"))
    }

    /// Baud rate to open the port with (explicit setting wins over the variant default)
    pub fn baud_rate(&self) -> u32 {
        self.device
            .baud_rate
            .unwrap_or_else(|| self.device.variant.default_baud_rate())
    }

    /// Runtime link settings
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            response_timeout: Duration::from_millis(self.protocol.response_timeout_ms),
            handshake_attempts: self.protocol.handshake_attempts,
            handshake_timeout: Duration::from_millis(self.protocol.handshake_timeout_ms),
            handshake_retry_delay: Duration::from_millis(self.protocol.handshake_retry_delay_ms),
            reconnect_interval: Duration::from_millis(self.device.reconnect_interval_ms),
            read_poll_interval: READ_POLL_INTERVAL,
            await_refresh: self.protocol.await_refresh,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial port path; discovered by USB id when unset
    pub port: Option<String>,
    /// Hardware variant (`live-s` or `razer-stream-controller`)
    pub variant: DeviceVariant,
    /// Overrides the variant's default baud rate
    pub baud_rate: Option<u32>,
    /// Display brightness (0-100)
    pub brightness: u8,
    /// Delay before reconnecting after the link drops
    pub reconnect_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: None,
            variant: DeviceVariant::LiveS,
            baud_rate: None,
            brightness: 80,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long a command may wait for its reply after being written
    pub response_timeout_ms: u64,
    pub handshake_attempts: u32,
    pub handshake_timeout_ms: u64,
    pub handshake_retry_delay_ms: u64,
    /// Wait for the device to acknowledge display refreshes
    pub await_refresh: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: RESPONSE_TIMEOUT.as_millis() as u64,
            handshake_attempts: HANDSHAKE_ATTEMPTS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
            handshake_retry_delay_ms: HANDSHAKE_RETRY_DELAY.as_millis() as u64,
            await_refresh: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// TrueType font for text labels; a system font is used when unset
    pub font_path: Option<PathBuf>,
    /// Print each tile's number on it
    pub show_labels: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            show_labels: true,
        }
    }
}

/// Timing and retry policy of one device connection
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub response_timeout: Duration,
    pub handshake_attempts: u32,
    pub handshake_timeout: Duration,
    pub handshake_retry_delay: Duration,
    pub reconnect_interval: Duration,
    pub read_poll_interval: Duration,
    pub await_refresh: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Config::default().link_config()
    }
}
