use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::components::history::HistoryManager;
use crate::io::ExportFormat;
use crate::ops::aspect;
use crate::ops::inpaint::{FillOptions, ImageSize, Model};

const SETTINGS_FILE: &str = "bananaslice_settings.cfg";

/// User preferences, persisted as `key=value` lines.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub max_history: usize,
    pub history_debounce_ms: u64,
    pub time_travel_settle_ms: u64,
    pub aspect_tolerance: f64,
    pub default_model: Model,
    pub image_size: Option<ImageSize>,
    pub export_format: ExportFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_history: 50,
            history_debounce_ms: 100,
            time_travel_settle_ms: 50,
            aspect_tolerance: aspect::DEFAULT_TOLERANCE,
            default_model: Model::default(),
            image_size: None,
            export_format: ExportFormat::Png,
        }
    }
}

impl Settings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/bananaslice/bananaslice_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\BananaSlice\bananaslice_settings.cfg
    /// On macOS:   ~/Library/Application Support/BananaSlice/bananaslice_settings.cfg
    /// Fallback:   same directory as the executable.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("bananaslice");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join(SETTINGS_FILE));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).unwrap_or_else(|_| {
                std::env::current_exe()
                    .ok()
                    .and_then(|p| p.parent().map(|d| d.to_string_lossy().into_owned()))
                    .unwrap_or_default()
            });
            let config_dir = PathBuf::from(appdata).join("BananaSlice");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join(SETTINGS_FILE));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            let config_dir = PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("BananaSlice");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join(SETTINGS_FILE));
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join(SETTINGS_FILE)))
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.to_config_string())
    }

    /// Load settings from disk (defaults if the file is corrupt).  On first
    /// run the defaults are written out so there is a file to edit.
    pub fn load_or_init() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_or_init_at(&path),
            None => Self::default(),
        }
    }

    pub fn load_or_init_at(path: &Path) -> Self {
        if path.exists() {
            return Self::load_from(path);
        }
        let settings = Self::default();
        if let Err(e) = settings.save_to(path) {
            crate::log_warn!("Failed to write default settings to {}: {}", path.display(), e);
        }
        settings
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else { return Self::default() };
        Self::parse(&content)
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "max_history={}\n\
             history_debounce_ms={}\n\
             time_travel_settle_ms={}\n\
             aspect_tolerance={}\n\
             default_model={}\n\
             image_size={}\n\
             export_format={}\n",
            self.max_history,
            self.history_debounce_ms,
            self.time_travel_settle_ms,
            self.aspect_tolerance,
            self.default_model.id(),
            self.image_size.map(|s| s.as_str()).unwrap_or(""),
            self.export_format.extension(),
        )
    }

    /// Unknown keys are skipped; unparseable values keep the default.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "max_history" => {
                    s.max_history = val.parse().ok().filter(|n| *n > 0).unwrap_or(50);
                }
                "history_debounce_ms" => {
                    s.history_debounce_ms = val.parse().unwrap_or(100);
                }
                "time_travel_settle_ms" => {
                    s.time_travel_settle_ms = val.parse().unwrap_or(50);
                }
                "aspect_tolerance" => {
                    s.aspect_tolerance = val
                        .parse::<f64>()
                        .ok()
                        .filter(|t| t.is_finite() && *t >= 0.0)
                        .unwrap_or(aspect::DEFAULT_TOLERANCE);
                }
                "default_model" => {
                    s.default_model = Model::parse(val);
                }
                "image_size" => {
                    s.image_size = ImageSize::parse(val);
                }
                "export_format" => {
                    s.export_format = ExportFormat::parse(val);
                }
                _ => {}
            }
        }
        s
    }

    pub fn history_manager(&self) -> HistoryManager {
        HistoryManager::new(
            self.max_history,
            Duration::from_millis(self.history_debounce_ms),
            Duration::from_millis(self.time_travel_settle_ms),
        )
    }

    /// Fill options seeded from these preferences.
    pub fn fill_options(&self, prompt: &str) -> FillOptions {
        FillOptions {
            prompt: prompt.to_string(),
            model: self.default_model,
            image_size: self.image_size,
            aspect_tolerance: self.aspect_tolerance,
            ..FillOptions::default()
        }
    }
}
