use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "paintstack.toml";

/// Engine-level preferences, persisted as TOML. Missing keys take their
/// defaults so older files keep loading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Undo steps kept per project.
    pub max_undo_steps: usize,
    /// Same-kind operations closer together than this share one undo step.
    pub merge_interval_ms: u64,
    /// Upper bound for history memory in MiB. 0 disables the cap.
    pub max_history_memory_mb: usize,
    pub default_canvas_width: u32,
    pub default_canvas_height: u32,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Write a session log file next to the settings.
    pub log_to_file: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: 50,
            merge_interval_ms: 500,
            max_history_memory_mb: 100,
            default_canvas_width: 1280,
            default_canvas_height: 720,
            log_level: "info".to_string(),
            log_to_file: true,
        }
    }
}

impl CoreSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/paintstack/paintstack.toml  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\PaintStack\paintstack.toml
    /// On macOS:   ~/Library/Application Support/PaintStack/paintstack.toml
    /// Fallback:   same directory as the executable.
    pub fn settings_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join(SETTINGS_FILE))
    }

    /// Load settings from disk (returns default if file missing or corrupt)
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str::<CoreSettings>(&content) {
            Ok(s) => s.sanitized(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt settings file");
                Self::default()
            }
        }
    }

    /// Save settings to disk
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::settings_path() else {
            return Ok(());
        };
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, content)
    }

    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        self.max_undo_steps = self.max_undo_steps.max(1);
        if self.default_canvas_width == 0 {
            self.default_canvas_width = defaults.default_canvas_width;
        }
        if self.default_canvas_height == 0 {
            self.default_canvas_height = defaults.default_canvas_height;
        }
        if self.log_level.trim().is_empty() {
            self.log_level = defaults.log_level;
        }
        self
    }
}

/// Per-user data directory shared by settings and session logs.
pub(crate) fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                PathBuf::from(home).join(".config")
            })
            .join("paintstack");
        return Some(dir);
    }
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
        return Some(PathBuf::from(appdata).join("PaintStack"));
    }
    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
        return Some(
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("PaintStack"),
        );
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf))
    }
}
