//! Sync engine configuration.

use crate::{Result, VaultSyncError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What to do when a pushed mutation still conflicts after one rebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Drop the local change, keep the remote revision, emit a conflict event.
    #[default]
    RemoteWins,
    /// Keep the local change queued but excluded from pushes until resolved.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: u32,
    pub sync_interval_min_secs: u64,
    pub sync_interval_max_secs: u64,
    pub max_concurrent_shares: usize,
    pub request_timeout_secs: u64,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub batch_size: usize,
    pub event_capacity: usize,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            sync_interval_min_secs: 55,
            sync_interval_max_secs: 60,
            max_concurrent_shares: 4,
            request_timeout_secs: 30,
            max_retry_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            batch_size: 100,
            event_capacity: 256,
            conflict_policy: ConflictPolicy::RemoteWins,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VaultSyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml_dep::from_str(content).map_err(|e| VaultSyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(VaultSyncError::Config("page_size must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(VaultSyncError::Config("batch_size must be positive".to_string()));
        }
        if self.max_concurrent_shares == 0 {
            return Err(VaultSyncError::Config(
                "max_concurrent_shares must be positive".to_string(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(VaultSyncError::Config(
                "max_retry_attempts must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(VaultSyncError::Config("event_capacity must be positive".to_string()));
        }
        if self.sync_interval_min_secs > self.sync_interval_max_secs {
            return Err(VaultSyncError::Config(format!(
                "sync interval range is inverted: {}..{}",
                self.sync_interval_min_secs, self.sync_interval_max_secs
            )));
        }
        Ok(())
    }

    /// A random interval within the configured range, picked per tick.
    pub fn next_interval(&self) -> Duration {
        let secs = rand::thread_rng()
            .gen_range(self.sync_interval_min_secs..=self.sync_interval_max_secs);
        Duration::from_secs(secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
