//! Daemon configuration file.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vaultsync_core::SyncConfig;

pub const DEFAULT_KEYRING_SERVICE: &str = "vaultsync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Base URL of the vault server.
    pub api_url: String,
    /// Local cache database. Defaults to the platform data directory.
    pub cache_path: Option<PathBuf>,
    /// OS keyring service holding the session, address key and device key.
    pub keyring_service: String,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub sync: SyncConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            cache_path: None,
            keyring_service: DEFAULT_KEYRING_SERVICE.to_string(),
            log_filter: "info".to_string(),
            sync: SyncConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml_dep::from_str(content)?;
        Ok(config)
    }

    /// Checks run after command-line overrides are applied.
    pub fn validate(&self) -> Result<()> {
        if self.api_url.is_empty() {
            bail!("api_url is not set; pass --api-url or set it in the config file");
        }
        if !(self.api_url.starts_with("https://") || self.api_url.starts_with("http://")) {
            bail!("api_url must be an http(s) URL: {}", self.api_url);
        }
        if self.keyring_service.is_empty() {
            bail!("keyring_service must not be empty");
        }
        self.sync.validate()?;
        Ok(())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(vaultsync_core::platform::get_default_cache_path)
    }
}
