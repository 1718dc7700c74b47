//! SFU Configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::jitter::{DEFAULT_EVICTION_THRESHOLD, DEFAULT_NACK_WINDOW_SIZE};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Buffer forwarded RTP so NACKs can be answered locally.
    /// When disabled nothing is buffered and subscriber NACKs are dropped.
    pub jitter_buffer_enabled: bool,
    /// Number of sequence numbers inspected per loss-detection window
    pub nack_window_size: u16,
    /// Packets older than this many media-clock units are evicted
    /// (180000 is two seconds at 90 kHz)
    pub eviction_threshold: u32,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum transports per room (0 = unlimited)
    pub max_transports_per_room: usize,
    /// Logging setup for binaries embedding the engine
    pub logging: LoggingConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            jitter_buffer_enabled: true,
            nack_window_size: DEFAULT_NACK_WINDOW_SIZE,
            eviction_threshold: DEFAULT_EVICTION_THRESHOLD,
            max_rooms: 0,
            max_transports_per_room: 0,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl SfuConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMCAST_JITTER_BUFFER_ENABLED, ROOMCAST_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the ring buffer cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nack_window_size < 2 {
            return Err(ConfigError::Message(format!(
                "nack_window_size must be at least 2, got {}",
                self.nack_window_size
            )));
        }
        if self.eviction_threshold == 0 {
            return Err(ConfigError::Message(
                "eviction_threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
