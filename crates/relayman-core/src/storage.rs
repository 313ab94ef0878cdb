//! Storage layer for the data directory (settings file; tasks live in SQLite)

use crate::error::RelayError;
use crate::validation::validate_settings;
use relayman_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const SETTINGS_FILE: &str = "settings.json";
const DATABASE_FILE: &str = "tasks.db";

/// Storage manager for Relayman data
#[derive(Clone, Debug)]
pub struct Storage {
    /// Data directory
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, RelayError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Location of the task database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    // ========================================================================
    // Settings (JSON file)
    // ========================================================================

    /// Load settings, falling back to defaults when the file is missing,
    /// unreadable or out of range
    pub async fn load_settings(&self) -> Result<Settings, RelayError> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&path).await?;
        let settings = match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring unreadable settings file {}: {}", path.display(), e);
                return Ok(Settings::default());
            }
        };

        match validate_settings(&settings) {
            Ok(()) => Ok(settings),
            Err(e) => {
                warn!("Ignoring settings file {}: {}", path.display(), e);
                Ok(Settings::default())
            }
        }
    }

    /// Save settings to storage
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), RelayError> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| RelayError::Serialization(e.to_string()))?;

        fs::write(self.settings_path(), content).await?;

        Ok(())
    }
}
