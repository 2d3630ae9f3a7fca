use std::fs;
use std::path::{Path, PathBuf};

use image::Rgb;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::components::mask::BrushSettings;
use crate::io::{DEFAULT_QUALITY, ExportFormat};
use crate::logger;
use crate::ops::background::DetectionThresholds;
use crate::ops::watermark::{Anchor, DEFAULT_MARGIN_RATIO};

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("no settings directory available on this platform")]
    NoPath,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSettings {
    /// Relative scale change per wheel notch.
    pub wheel_step: f32,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self { wheel_step: 0.1 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskDefaults {
    pub brush: BrushSettings,
    pub color: [u8; 3],
}

impl Default for MaskDefaults {
    fn default() -> Self {
        Self {
            brush: BrushSettings::default(),
            color: [255, 0, 80],
        }
    }
}

impl MaskDefaults {
    pub fn color(&self) -> Rgb<u8> {
        Rgb(self.color)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkDefaults {
    pub anchor: Anchor,
    pub opacity: f32,
    pub margin_ratio: f32,
    /// Text size as a fraction of the canvas width.
    pub font_scale: f32,
    pub font_family: Option<String>,
    pub text_color: [u8; 4],
    /// Logo width as a percentage of the canvas width.
    pub logo_width_percent: f32,
}

impl Default for WatermarkDefaults {
    fn default() -> Self {
        Self {
            anchor: Anchor::default(),
            opacity: 0.8,
            margin_ratio: DEFAULT_MARGIN_RATIO,
            font_scale: 0.05,
            font_family: None,
            text_color: [255, 255, 255, 255],
            logo_width_percent: 20.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDefaults {
    pub format: ExportFormat,
    pub quality: u8,
}

impl Default for ExportDefaults {
    fn default() -> Self {
        Self {
            format: ExportFormat::Png,
            quality: DEFAULT_QUALITY,
        }
    }
}

/// Engine configuration, stored as JSON in the platform config directory.
/// Unknown keys are ignored and missing keys take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub view: ViewSettings,
    pub mask: MaskDefaults,
    pub detection: DetectionThresholds,
    pub watermark: WatermarkDefaults,
    pub export: ExportDefaults,
    /// Where session stores live. `None` uses `<data>/RetouchFE/sessions`.
    pub store_root: Option<PathBuf>,
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/retouchfe/settings.json  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\RetouchFE\settings.json
    /// On macOS:   ~/Library/Application Support/RetouchFE/settings.json
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join(logger::APP_DIR).join("settings.json"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join(logger::APP_DIR)
                    .join("settings.json"),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
                .ok()?;
            Some(config_dir.join("retouchfe").join("settings.json"))
        }
    }

    /// Load settings from disk (returns default if file missing or corrupt).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else { return Self::default() };
        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring invalid settings file");
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::settings_path().ok_or(SettingsError::NoPath)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn store_root(&self) -> PathBuf {
        self.store_root
            .clone()
            .unwrap_or_else(|| logger::data_dir().join(logger::APP_DIR).join("sessions"))
    }
}
