//! Flat key-value settings persistence.
//!
//! Settings are a string-to-string map stored as one JSON document under
//! the platform config directory. Saving merges a partial map into the
//! loaded state and persists immediately; there is no write-buffering.
//! Load failures (missing or corrupt file) fall back to an empty map and
//! are never surfaced as errors.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;

/// Key holding the external transcoder (ffmpeg) location.
pub const KEY_TRANSCODER_PATH: &str = "ffmpeg_path";

/// Key holding the default download folder.
pub const KEY_SAVE_PATH: &str = "save_path";

/// Key holding the UI theme name.
pub const KEY_THEME: &str = "theme";

/// Theme applied when none is stored.
pub const DEFAULT_THEME: &str = "light";

/// Persistent application settings.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl SettingsStore {
    /// Load settings from the default platform location.
    #[must_use]
    pub fn load() -> Self {
        Self::load_from(default_file_path())
    }

    /// Load settings from an explicit file path.
    ///
    /// A missing or unparseable file yields an empty store; the next save
    /// recreates it.
    #[must_use]
    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(values) => {
                    info!("Loaded settings from {}", path.display());
                    values
                }
                Err(e) => {
                    warn!(
                        "Settings file {} is corrupt ({}); starting empty",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) => {
                debug!(
                    "No settings file at {} ({}); starting empty",
                    path.display(),
                    e
                );
                BTreeMap::new()
            }
        };

        Self { path, values }
    }

    /// Merge a partial map into the settings and persist immediately.
    pub fn save(&mut self, partial: BTreeMap<String, String>) -> Result<()> {
        self.values.extend(partial);
        self.persist()
    }

    /// Set one key and persist immediately.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.values.insert(key.into(), value.into());
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&self.values)?;
        fs::write(&self.path, content)?;
        info!("Saved settings to {}", self.path.display());
        Ok(())
    }

    /// Raw value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Path of the backing file.
    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.path
    }

    /// The configured download folder, if any.
    #[must_use]
    pub fn save_path(&self) -> Option<PathBuf> {
        self.non_empty(KEY_SAVE_PATH).map(PathBuf::from)
    }

    /// The configured transcoder location, if any.
    #[must_use]
    pub fn transcoder_path(&self) -> Option<PathBuf> {
        self.non_empty(KEY_TRANSCODER_PATH).map(PathBuf::from)
    }

    /// The stored theme name, or the default.
    #[must_use]
    pub fn theme(&self) -> &str {
        self.non_empty(KEY_THEME).unwrap_or(DEFAULT_THEME)
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|value| !value.trim().is_empty())
    }
}

/// Default settings file location under the platform config directory.
#[must_use]
pub fn default_file_path() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vintagetube")
        .join("settings.json")
}
