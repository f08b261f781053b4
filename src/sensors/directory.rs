//! Sensor that replays JPEG files from a directory

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::sensor::SensorDriver;
use crate::settings::{SensorSettings, Setting};
use crate::{Result, StreamError};

/// Replays every `.jpg`/`.jpeg` file in a directory, in name order, looping forever.
///
/// Settings are accepted and reported but do not alter the recorded frames.
pub struct DirectorySensor {
    frames: Vec<Vec<u8>>,
    position: usize,
    settings: SensorSettings,
}

impl DirectorySensor {
    /// Load all frames from `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            StreamError::sensor_failed_with_source(
                format!("cannot read frame directory {}", dir.display()),
                Box::new(e),
            )
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in &paths {
            let bytes = std::fs::read(path).map_err(|e| {
                StreamError::sensor_failed_with_source(
                    format!("cannot read frame {}", path.display()),
                    Box::new(e),
                )
            })?;
            debug!("Loaded frame {} ({} bytes)", path.display(), bytes.len());
            frames.push(bytes);
        }

        if frames.is_empty() {
            return Err(StreamError::sensor_failed(format!(
                "no JPEG files in {}",
                dir.display()
            )));
        }

        info!("Replaying {} frames from {}", frames.len(), dir.display());
        Ok(Self { frames, position: 0, settings: SensorSettings::default() })
    }

    /// Number of frames in the loop
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait::async_trait]
impl SensorDriver for DirectorySensor {
    async fn capture(&mut self) -> Result<&[u8]> {
        let index = self.position;
        self.position = (self.position + 1) % self.frames.len();
        Ok(&self.frames[index])
    }

    fn apply(&mut self, setting: Setting, value: i32) -> Result<()> {
        self.settings.set(setting, value)
    }

    fn settings(&self) -> SensorSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn loops_over_frames_in_name_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"second").unwrap();
        std::fs::write(dir.path().join("a.JPEG"), b"first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut sensor = DirectorySensor::open(dir.path()).unwrap();
        assert_eq!(sensor.frame_count(), 2);
        assert_eq!(sensor.capture().await.unwrap(), b"first");
        assert_eq!(sensor.capture().await.unwrap(), b"second");
        assert_eq!(sensor.capture().await.unwrap(), b"first");
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = DirectorySensor::open(dir.path()).err().unwrap();
        assert!(matches!(err, StreamError::Sensor { .. }));
    }
}
