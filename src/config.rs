//! Server configuration loaded from YAML
//!
//! Every field has a default, so an empty file (or no file at all) describes a working
//! server: port 80, 14 frames per second, the synthetic sensor.
//!
//! ```yaml
//! bind: 0.0.0.0:8080
//! frame_rate: 14
//! settings_path: framecast-settings.yaml
//! client_write_timeout_ms: 5000
//! memory:
//!   internal_bytes: 327680
//!   external_bytes: 4194304
//! sensor:
//!   kind: directory
//!   path: ./frames
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::memory::MemoryBudget;
use crate::{Result, StreamError};

/// Environment variable consulted when no config path is given on the command line.
pub const CONFIG_ENV: &str = "FRAMECAST_CONFIG";

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorSource {
    /// Fabricated frames sized like real captures
    Synthetic {
        /// Fraction of the estimated encoded size each frame occupies
        #[serde(default = "default_scale")]
        scale: f64,
    },
    /// Recorded JPEG files replayed in a loop
    Directory { path: PathBuf },
}

impl Default for SensorSource {
    fn default() -> Self {
        SensorSource::Synthetic { scale: default_scale() }
    }
}

fn default_scale() -> f64 {
    0.1
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Listening address
    pub bind: SocketAddr,
    /// Target acquisition rate in frames per second
    pub frame_rate: u32,
    /// Memory pool budgets for frame buffers
    pub memory: MemoryBudget,
    /// Settings file; without one, setting changes last until the next restart
    pub settings_path: Option<PathBuf>,
    /// Frame source
    pub sensor: SensorSource,
    /// Upper bound on a single write to a stream client, in milliseconds (0 disables)
    pub client_write_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 80)),
            frame_rate: 14,
            memory: MemoryBudget::default(),
            settings_path: None,
            sensor: SensorSource::default(),
            client_write_timeout_ms: 5_000,
        }
    }
}

impl StreamConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StreamError::config_error(path, format!("cannot read file: {e}")))?;
        let config = Self::from_yaml(&text).map_err(|details| StreamError::config_error(path, details))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path` if given, else from `$FRAMECAST_CONFIG` if set, else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => Self::load(PathBuf::from(path)),
                None => {
                    info!("No configuration file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    fn from_yaml(text: &str) -> std::result::Result<Self, String> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml_ng::from_str(text).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !(1..=60).contains(&self.frame_rate) {
            return Err(format!("frame_rate must be between 1 and 60, got {}", self.frame_rate));
        }
        if self.memory.internal_bytes == 0 {
            return Err("memory.internal_bytes must be non-zero".to_string());
        }
        if let SensorSource::Synthetic { scale } = self.sensor {
            if !(scale > 0.0 && scale <= 1.0) {
                return Err(format!("sensor.scale must be in (0, 1], got {scale}"));
            }
        }
        Ok(())
    }

    /// Nominal acquisition period
    pub fn frame_period(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.frame_rate.max(1)))
    }

    /// Per-write timeout for stream clients
    pub fn client_write_timeout(&self) -> Option<Duration> {
        (self.client_write_timeout_ms > 0).then(|| Duration::from_millis(self.client_write_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_the_firmware() {
        let config = StreamConfig::default();
        assert_eq!(config.bind.port(), 80);
        assert_eq!(config.frame_period(), Duration::from_millis(71));
        assert_eq!(config.client_write_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.sensor, SensorSource::Synthetic { scale: 0.1 });
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let config = StreamConfig::from_yaml(
            "bind: 127.0.0.1:8080\nsensor:\n  kind: directory\n  path: /srv/frames\nclient_write_timeout_ms: 0\n",
        )
        .unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.frame_rate, 14);
        assert_eq!(config.sensor, SensorSource::Directory { path: PathBuf::from("/srv/frames") });
        assert_eq!(config.client_write_timeout(), None);
    }

    #[test]
    fn empty_file_is_defaults() {
        assert_eq!(StreamConfig::from_yaml("  \n").unwrap(), StreamConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(StreamConfig::from_yaml("frame_rate: 0").is_err());
        assert!(StreamConfig::from_yaml("sensor:\n  kind: synthetic\n  scale: 2.5\n").is_err());
        assert!(StreamConfig::from_yaml("sensor:\n  kind: webcam\n").is_err());
    }

    #[test]
    fn load_reports_the_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("framecast.yaml");
        std::fs::write(&path, "frame_rate: nope").unwrap();

        let err = StreamConfig::load(&path).unwrap_err();
        match err {
            StreamError::Config { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }

        std::fs::write(&path, "frame_rate: 10").unwrap();
        assert_eq!(StreamConfig::load(&path).unwrap().frame_period(), Duration::from_millis(100));
    }
}
