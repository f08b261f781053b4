//! YAML-backed store for explicitly chosen settings and the boot counter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{SensorSettings, Setting};
use crate::{Result, StreamError};

/// Contents of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Number of times the pipeline has started
    pub boot_count: u32,
    /// Settings changed through the control endpoint, by key
    pub overrides: BTreeMap<String, i32>,
}

impl PersistedState {
    /// Apply stored overrides on top of `settings`.
    ///
    /// Unknown keys and out-of-range values (for example from an older release) are
    /// skipped with a warning.
    pub fn apply_to(&self, settings: &mut SensorSettings) {
        for (key, &value) in &self.overrides {
            let applied = key.parse::<Setting>().and_then(|s| settings.set(s, value));
            if let Err(e) = applied {
                warn!("Ignoring stored setting {}={}: {}", key, value, e);
            }
        }
    }
}

/// Settings file on disk. A store without a path keeps everything in memory.
///
/// Every read-modify-write happens under one lock and files are replaced atomically, so
/// concurrent control requests never lose an update or leave a partial file behind.
#[derive(Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()), lock: Mutex::new(()) }
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self { path: None, lock: Mutex::new(()) }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn locked(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the stored state; a missing file is an empty state.
    pub fn load(&self) -> Result<PersistedState> {
        let _guard = self.locked();
        self.read()
    }

    fn read(&self) -> Result<PersistedState> {
        let Some(path) = &self.path else {
            return Ok(PersistedState::default());
        };

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}", path.display());
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(StreamError::persistence_error(path, e)),
        };

        if text.trim().is_empty() {
            return Ok(PersistedState::default());
        }

        serde_yaml_ng::from_str(&text)
            .map_err(|e| StreamError::config_error(path.clone(), e.to_string()))
    }

    /// Write `state` back to disk.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let _guard = self.locked();
        self.write(state)
    }

    fn write(&self, state: &PersistedState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let yaml = serde_yaml_ng::to_string(state)
            .map_err(|e| StreamError::config_error(path.clone(), e.to_string()))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut staged = NamedTempFile::new_in(dir).map_err(|e| StreamError::persistence_error(path, e))?;
        staged
            .write_all(yaml.as_bytes())
            .map_err(|e| StreamError::persistence_error(path, e))?;
        staged.persist(path).map_err(|e| StreamError::persistence_error(path, e.error))?;
        Ok(())
    }

    /// Load, bump the boot counter, save. Returns the updated state.
    ///
    /// A settings file that cannot be read is replaced by a fresh one rather than
    /// keeping the camera from starting.
    pub fn record_boot(&self) -> Result<PersistedState> {
        let _guard = self.locked();
        let mut state = self.read().unwrap_or_else(|e| {
            warn!("Discarding unreadable settings: {}", e);
            PersistedState::default()
        });
        state.boot_count = state.boot_count.wrapping_add(1);
        self.write(&state)?;
        info!("Boot #{}", state.boot_count);
        Ok(state)
    }

    /// Remember one changed setting.
    pub fn store_setting(&self, setting: Setting, value: i32) -> Result<()> {
        let _guard = self.locked();
        let mut state = self.read()?;
        state.overrides.insert(setting.key().to_string(), value);
        self.write(&state)
    }

    /// Forget every stored setting. The boot counter is cleared too.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.locked();
        let Some(path) = &self.path else {
            return Ok(());
        };
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StreamError::persistence_error(path, e)),
        }
    }
}
