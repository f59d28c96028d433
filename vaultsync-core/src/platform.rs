//! Default on-disk locations

use std::path::PathBuf;

const APP_DIR: &str = "VaultSync";

/// Overrides the data directory, e.g. for several accounts on one machine.
pub const DATA_DIR_ENV: &str = "VAULTSYNC_DATA_DIR";
pub const CONFIG_DIR_ENV: &str = "VAULTSYNC_CONFIG_DIR";

fn from_env(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Directory of the local cache.
///
/// `$VAULTSYNC_DATA_DIR` if set, otherwise:
/// - Windows: %LOCALAPPDATA%\VaultSync
/// - macOS: ~/Library/Application Support/VaultSync
/// - Linux/Other: ~/.local/share/VaultSync
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = from_env(DATA_DIR_ENV) {
        return dir;
    }
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Directory of the daemon configuration, `$VAULTSYNC_CONFIG_DIR` if set.
pub fn get_config_dir() -> PathBuf {
    if let Some(dir) = from_env(CONFIG_DIR_ENV) {
        return dir;
    }
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn get_default_cache_path() -> PathBuf {
    get_data_dir().join("cache.db")
}

pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}
