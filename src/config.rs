//! Configuration management for crabstream
//!
//! Provides loading, saving and validation of stream defaults, slot
//! layouts, snapshot defaults, hot-plug debounce and timeouts.

use crate::errors::CameraError;
use crate::slots::{BaseStreamConfig, MatchLabel, StreamSlotConfig};
use crate::snapshot::SnapOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrabStreamConfig {
    pub video: VideoConfig,
    pub default_stream: BaseStreamConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamSlotConfig>,
    pub snapshot: SnapOptions,
    pub device_change: DeviceChangeConfig,
    pub timeouts: TimeoutConfig,
    pub events: EventConfig,
}

/// Preview/connection defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Shrink factor per over-constrained retry (0 < r < 1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_ratio: Option<f64>,
    /// Mirror captured stills
    pub flip_horiz: bool,
    /// Tear down the live session before opening another
    pub disconnect_before_switch: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 400,
            height: 300,
            fps: 30,
            retry_ratio: None,
            flip_horiz: false,
            disconnect_before_switch: false,
        }
    }
}

/// Hot-plug handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceChangeConfig {
    /// Debounce window in milliseconds; values under 100 are raised to 100
    pub delay_ms: u64,
    /// Poll interval for the device watcher; unset disables polling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

impl Default for DeviceChangeConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            poll_interval_ms: None,
        }
    }
}

impl DeviceChangeConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.max(100))
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// Bounds on calls that may never resolve (milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub permission_ms: u64,
    pub enumeration_ms: u64,
    pub sink_ready_ms: u64,
    /// Base snapshot budget; the snap delay is added per call
    pub snapshot_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            permission_ms: 10_000,
            enumeration_ms: 20_000,
            sink_ready_ms: 10_000,
            snapshot_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn permission(&self) -> Duration {
        Duration::from_millis(self.permission_ms)
    }

    pub fn enumeration(&self) -> Duration {
        Duration::from_millis(self.enumeration_ms)
    }

    pub fn sink_ready(&self) -> Duration {
        Duration::from_millis(self.sink_ready_ms)
    }

    pub fn snapshot(&self) -> Duration {
        Duration::from_millis(self.snapshot_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Buffered events per subscriber before the oldest are dropped
    pub capacity: usize,
    /// Skip opening a camera once at startup to trigger the OS prompt
    pub skip_invoke_permission: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            skip_invoke_permission: false,
        }
    }
}

impl Default for CrabStreamConfig {
    fn default() -> Self {
        let video = VideoConfig::default();
        Self {
            snapshot: SnapOptions::default(),
            default_stream: BaseStreamConfig {
                width: video.width,
                height: video.height,
                ..BaseStreamConfig::default()
            },
            video,
            streams: Vec::new(),
            device_change: DeviceChangeConfig::default(),
            timeouts: TimeoutConfig::default(),
            events: EventConfig::default(),
        }
    }
}

impl CrabStreamConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CameraError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            CameraError::InvalidConfig(format!("Failed to read config file: {}", e))
        })?;

        let config: CrabStreamConfig = toml::from_str(&contents).map_err(|e| {
            CameraError::InvalidConfig(format!("Failed to parse config file: {}", e))
        })?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CameraError::InvalidConfig(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(|e| {
            CameraError::InvalidConfig(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, toml_string).map_err(|e| {
            CameraError::InvalidConfig(format!("Failed to write config file: {}", e))
        })?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabstream.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err("Invalid video resolution".to_string());
        }
        if self.video.fps == 0 || self.video.fps > 240 {
            return Err("Invalid video FPS (must be 1-240)".to_string());
        }
        if let Some(ratio) = self.video.retry_ratio {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err("Retry ratio must be between 0 and 1 (exclusive)".to_string());
            }
        }

        if self.default_stream.width == 0 || self.default_stream.height == 0 {
            return Err("Invalid default stream resolution".to_string());
        }

        for (i, stream) in self.streams.iter().enumerate() {
            if (stream.width == 0) != (stream.height == 0) {
                return Err(format!("Stream {} sets only one of width/height", i));
            }
            for label in &stream.match_labels {
                if let MatchLabel::Substring(s) = label {
                    if s.trim().is_empty() {
                        return Err(format!("Stream {} has an empty match label", i));
                    }
                }
            }
        }

        if self.snapshot.width == 0 || self.snapshot.height == 0 {
            return Err("Invalid snapshot resolution".to_string());
        }
        if self.snapshot.jpeg_quality == 0 || self.snapshot.jpeg_quality > 100 {
            return Err("JPEG quality must be between 1 and 100".to_string());
        }

        if self.timeouts.permission_ms == 0
            || self.timeouts.enumeration_ms == 0
            || self.timeouts.sink_ready_ms == 0
            || self.timeouts.snapshot_ms == 0
        {
            return Err("Timeouts must be non-zero".to_string());
        }

        if self.events.capacity == 0 {
            return Err("Event capacity must be at least 1".to_string());
        }

        Ok(())
    }

    /// Configured stream slots with unset sizes filled from the default
    /// stream and minimums clamped.
    pub fn stream_configs(&self) -> Vec<StreamSlotConfig> {
        self.streams
            .iter()
            .map(|stream| stream.normalized(&self.default_stream))
            .collect()
    }
}
