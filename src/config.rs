//! Application configuration
//!
//! Persisted as TOML. Missing files fall back to defaults so a fresh
//! install runs without any setup.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub network: NetworkConfig,
    pub room: RoomConfig,
    pub logging: LoggingConfig,
}

/// Local audio device settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture device id (see `audio::device::list_devices`), default device if unset
    pub input_device: Option<String>,
    /// Render device id, default device if unset
    pub output_device: Option<String>,
    /// Requested device buffer in sample frames; `None` lets the host decide
    pub buffer_frames: Option<u32>,
    /// Capacity of the sample ring between the render loop and the device
    pub render_ring_samples: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            buffer_frames: Some(FRAME_SAMPLES as u32),
            render_ring_samples: FRAME_SAMPLES * 16,
        }
    }
}

/// Socket settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: IpAddr,
    /// Datagram port shared by all peers for media
    pub media_port: u16,
    /// Stream port the room host listens on
    pub control_port: u16,
    pub socket_buffer_bytes: usize,
    /// Sleep between empty receive polls
    pub receive_poll_ms: u64,
    /// Sleep between empty accept polls
    pub accept_poll_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            media_port: DEFAULT_AUDIO_PORT,
            control_port: DEFAULT_AUDIO_PORT,
            socket_buffer_bytes: SOCKET_BUFFER_SIZE,
            receive_poll_ms: 1,
            accept_poll_ms: 100,
        }
    }
}

impl NetworkConfig {
    pub fn receive_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }
}

/// Room membership settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomConfig {
    /// Target call size including the local participant (clamped to 2..=4)
    pub expected_participants: usize,
    pub peer_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    /// How often the call loop runs the heartbeat check
    pub heartbeat_interval_ms: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            expected_participants: MIN_PARTICIPANTS,
            peer_timeout_ms: PEER_TIMEOUT.as_millis() as u64,
            connection_timeout_ms: CONNECTION_TIMEOUT.as_millis() as u64,
            heartbeat_interval_ms: 1000,
        }
    }
}

impl RoomConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Append-only log file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl AppConfig {
    /// Default config file location (`<config dir>/voice-room/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voice-room")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.media_port == 0 || self.network.control_port == 0 {
            return Err(Error::Config("ports must be non-zero".into()));
        }
        if self.network.accept_poll_ms == 0 || self.network.receive_poll_ms == 0 {
            return Err(Error::Config("poll intervals must be non-zero".into()));
        }
        if self.room.peer_timeout_ms == 0 || self.room.heartbeat_interval_ms == 0 {
            return Err(Error::Config("room timers must be non-zero".into()));
        }
        if self.audio.render_ring_samples < FRAME_SAMPLES {
            return Err(Error::Config(format!(
                "render ring must hold at least one frame ({} samples)",
                FRAME_SAMPLES
            )));
        }
        Ok(())
    }
}
