// Settings management and persistence
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assets::DurationPolicy;
use crate::error::{PlayerError, Result};
use crate::seek::TrackArea;

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub duration: DurationPolicy,
    pub start_lead_ms: u32, // voices are scheduled this far ahead
    pub loop_on_start: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            duration: DurationPolicy::default(),
            start_lead_ms: 50,
            loop_on_start: false,
        }
    }
}

impl TransportSettings {
    pub fn start_lead_secs(&self) -> f64 {
        self.start_lead_ms as f64 / 1000.0
    }
}

/// Cursor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorSettings {
    pub frame_interval_ms: u64, // render cadence, ~60 fps by default
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
        }
    }
}

impl CursorSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub resample: bool,       // convert stems to the device rate at load time
    pub ring_capacity: usize, // pending mixer commands
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            resample: true,
            ring_capacity: 256,
        }
    }
}

/// Main player settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    pub version: i32, // Settings schema version for future migrations
    pub transport: TransportSettings,
    pub cursor: CursorSettings,
    pub output: OutputSettings,
    pub track_area: TrackArea,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            version: 1,
            transport: TransportSettings::default(),
            cursor: CursorSettings::default(),
            output: OutputSettings::default(),
            track_area: TrackArea::default(),
        }
    }
}

impl PlayerSettings {
    /// Get the settings file path
    pub fn get_settings_path(dir: &Path) -> PathBuf {
        dir.join("stemdeck.json")
    }

    /// Load settings from file, or return defaults if file doesn't exist
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::get_settings_path(dir);

        if !path.exists() {
            log::info!("[Settings] No settings file found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| PlayerError::Settings(format!("Failed to read settings file: {}", e)))?;

        let settings: PlayerSettings = serde_json::from_str(&content)
            .map_err(|e| PlayerError::Settings(format!("Failed to parse settings: {}", e)))?;

        log::info!("[Settings] Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Save settings to file
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| {
            PlayerError::Settings(format!("Failed to create settings directory: {}", e))
        })?;

        let path = Self::get_settings_path(dir);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| PlayerError::Settings(format!("Failed to serialize settings: {}", e)))?;

        fs::write(&path, content)
            .map_err(|e| PlayerError::Settings(format!("Failed to write settings file: {}", e)))?;

        log::info!("[Settings] Saved settings to {:?}", path);
        Ok(())
    }
}
