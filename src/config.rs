//! Session configuration.
//!
//! Defaults match a stock drone on its own access point. Every section can be
//! overridden from a YAML file; missing keys fall back to their defaults.
//!
//! ```yaml
//! device:
//!   address: 192.168.10.1
//! command:
//!   max_attempts: 5
//! media_root: /home/pilot/Videos/TelloMedia
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, SessionError};

/// Top-level configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub device: DeviceConfig,
    pub command: CommandConfig,
    pub telemetry: TelemetryConfig,
    pub video: VideoConfig,
    pub transcoder: TranscoderConfig,
    pub recording: RecordingConfig,
    pub viewer: ViewerConfig,
    pub photo: PhotoConfig,
    /// Root directory for photos and recordings
    pub media_root: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            command: CommandConfig::default(),
            telemetry: TelemetryConfig::default(),
            video: VideoConfig::default(),
            transcoder: TranscoderConfig::default(),
            recording: RecordingConfig::default(),
            viewer: ViewerConfig::default(),
            photo: PhotoConfig::default(),
            media_root: PathBuf::from("media"),
        }
    }
}

impl SessionConfig {
    /// Parse a YAML document into a validated configuration.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SessionConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| SessionError::config(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml =
            std::fs::read_to_string(path).map_err(|e| SessionError::file_error(path, e))?;
        Self::from_yaml(&yaml)
    }

    /// Reject values that would make the session unusable.
    pub fn validate(&self) -> Result<()> {
        self.command.validate()?;
        if self.telemetry.min_interval_ms == 0 {
            return Err(SessionError::config("telemetry.min_interval_ms must be positive"));
        }
        if self.telemetry.link_timeout_ms == 0 {
            return Err(SessionError::config("telemetry.link_timeout_ms must be positive"));
        }
        if self.video.bind_attempts == 0 {
            return Err(SessionError::config("video.bind_attempts must be at least 1"));
        }
        if self.video.consumer_buffer == 0 || self.viewer.buffer == 0 {
            return Err(SessionError::config("queue sizes must be positive"));
        }
        if self.photo.poll_attempts == 0 {
            return Err(SessionError::config("photo.poll_attempts must be at least 1"));
        }
        if self.transcoder.program.trim().is_empty() {
            return Err(SessionError::config("transcoder.program must not be empty"));
        }
        if self.transcoder.still_fps == 0 || self.transcoder.fps == 0 || self.recording.fps == 0 {
            return Err(SessionError::config("frame rates must be positive"));
        }
        Ok(())
    }
}

/// Addresses of the drone's three UDP channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub address: IpAddr,
    pub command_port: u16,
    /// Local port the drone pushes state datagrams to
    pub telemetry_port: u16,
    /// Local port the drone pushes raw H.264 to
    pub video_port: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 10, 1)),
            command_port: 8889,
            telemetry_port: 8890,
            video_port: 11111,
        }
    }
}

impl DeviceConfig {
    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.command_port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Total attempts per command, including the first
    pub max_attempts: u32,
    /// Length of one attempt slot: the reply window and the spacing between sends
    pub retry_delay_ms: u64,
    /// Hard cap on a whole call, all attempts included
    pub command_timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { max_attempts: 3, retry_delay_ms: 1000, command_timeout_ms: 5000 }
    }
}

impl CommandConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// The overall cap must leave room for every attempt slot.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SessionError::config("command.max_attempts must be at least 1"));
        }
        if self.retry_delay_ms == 0 {
            return Err(SessionError::config("command.retry_delay_ms must be positive"));
        }
        let slots = u64::from(self.max_attempts).saturating_mul(self.retry_delay_ms);
        if self.command_timeout_ms < slots {
            return Err(SessionError::config(format!(
                "command.command_timeout_ms ({}) is shorter than max_attempts x retry_delay_ms ({slots})",
                self.command_timeout_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Minimum spacing between two applied snapshots
    pub min_interval_ms: u64,
    /// Silence after which the link is reported lost
    pub link_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { min_interval_ms: 100, link_timeout_ms: 5000 }
    }
}

impl TelemetryConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Bind attempts before giving up with `PortUnavailable`
    pub bind_attempts: u32,
    /// Base backoff between bind attempts, multiplied by the attempt number
    pub bind_backoff_ms: u64,
    /// Datagrams queued per consumer before new ones are dropped for it
    pub consumer_buffer: usize,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self { bind_attempts: 5, bind_backoff_ms: 500, consumer_buffer: 256 }
    }
}

impl VideoConfig {
    pub fn bind_backoff(&self) -> Duration {
        Duration::from_millis(self.bind_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub program: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: String,
    pub fps: u32,
    /// Refresh rate of the still frame used for photo capture
    pub still_fps: u32,
    pub stop_grace_ms: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            width: 960,
            height: 720,
            bitrate: "800k".to_string(),
            fps: 30,
            still_fps: 2,
            stop_grace_ms: 3000,
        }
    }
}

impl TranscoderConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Time allowed for the muxer to finalize the container after EOF
    pub stop_grace_ms: u64,
    /// Frame rate used to generate timestamps for the raw feed
    pub fps: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self { stop_grace_ms: 10_000, fps: 30 }
    }
}

impl RecordingConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub bind: SocketAddr,
    /// Chunks queued per viewer before new ones are skipped for it
    pub buffer: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self { bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3001), buffer: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotoConfig {
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self { poll_attempts: 10, poll_interval_ms: 100 }
    }
}

impl PhotoConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_drone() {
        let config = SessionConfig::default();
        assert_eq!(config.device.command_addr(), "192.168.10.1:8889".parse().unwrap());
        assert_eq!(config.device.telemetry_port, 8890);
        assert_eq!(config.device.video_port, 11111);
        assert_eq!(config.command.max_attempts, 3);
        assert_eq!(config.command.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.telemetry.min_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r#"
device:
  address: 10.0.0.7
command:
  max_attempts: 5
media_root: /tmp/drone-media
"#;
        let config = SessionConfig::from_yaml(yaml).expect("valid config");
        assert_eq!(config.device.address, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(config.device.command_port, 8889);
        assert_eq!(config.command.max_attempts, 5);
        assert_eq!(config.command.retry_delay_ms, 1000);
        assert_eq!(config.media_root, PathBuf::from("/tmp/drone-media"));
        assert_eq!(config.transcoder.program, "ffmpeg");
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = SessionConfig::from_yaml("command:\n  max_attempts: 0\n").unwrap_err();
        assert!(matches!(err, SessionError::Config { .. }));
    }

    #[test]
    fn command_timeout_must_cover_every_attempt() {
        let err = SessionConfig::from_yaml("command:\n  command_timeout_ms: 0\n").unwrap_err();
        assert!(matches!(err, SessionError::Config { .. }), "{err}");

        let yaml = "command:\n  max_attempts: 3\n  retry_delay_ms: 1000\n  command_timeout_ms: 2999\n";
        let err = SessionConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("command_timeout_ms"), "{err}");

        let yaml = "command:\n  max_attempts: 3\n  retry_delay_ms: 1000\n  command_timeout_ms: 3000\n";
        assert!(SessionConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn zero_telemetry_intervals_rejected() {
        let err = SessionConfig::from_yaml("telemetry:\n  link_timeout_ms: 0\n").unwrap_err();
        assert!(err.to_string().contains("link_timeout_ms"), "{err}");

        let err = SessionConfig::from_yaml("telemetry:\n  min_interval_ms: 0\n").unwrap_err();
        assert!(err.to_string().contains("min_interval_ms"), "{err}");
    }

    #[test]
    fn zero_retry_delay_rejected() {
        let mut config = SessionConfig::default();
        config.command.retry_delay_ms = 0;
        assert!(matches!(config.validate(), Err(SessionError::Config { .. })));
    }

    #[test]
    fn malformed_yaml_rejected() {
        let err = SessionConfig::from_yaml("device: [unclosed").unwrap_err();
        assert!(err.to_string().contains("invalid YAML"));
    }
}
