use std::path::{Path, PathBuf};

use streamsave_core::fs_paths::AppPaths;
use streamsave_core::models::settings::AppSettings;

const SETTINGS_FILE: &str = "settings.json";
const STATE_FILE: &str = "downloads.json";

pub fn settings_path(paths: &dyn AppPaths) -> PathBuf {
    paths.data_dir().join(SETTINGS_FILE)
}

pub fn state_path(paths: &dyn AppPaths) -> PathBuf {
    paths.data_dir().join(STATE_FILE)
}

pub fn load_settings(path: &Path) -> AppSettings {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return AppSettings::default(),
    };
    match serde_json::from_str::<AppSettings>(&text) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Ignoring unreadable settings at {}: {}", path.display(), e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let val = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, val)?;
    Ok(())
}
