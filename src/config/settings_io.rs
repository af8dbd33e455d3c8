use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::settings::WeaveSettings;

pub fn settings_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("chunk_weaver");
    path.push("settings.json");
    path
}

/// Missing or unreadable settings fall back to the defaults.
pub fn load_settings_from(path: &Path) -> WeaveSettings {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            log::warn!("Ignoring malformed settings {}: {}", path.display(), e);
            WeaveSettings::default()
        }),
        Err(_) => WeaveSettings::default(),
    }
}

pub fn load_settings() -> WeaveSettings {
    load_settings_from(&settings_path())
}

pub fn save_settings_to(path: &Path, settings: &WeaveSettings) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

pub fn save_settings(settings: &WeaveSettings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}
