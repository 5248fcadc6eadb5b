//! Cached remote storage totals and local-vs-cloud sync coverage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Snapshot of remote account usage, refreshed in the background
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RemoteQuotaCache {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,

    /// Files under the local incoming folder
    pub local_files: u64,
    pub local_size: u64,

    /// Files in the remote destination folder
    pub cloud_files: u64,
    pub cloud_size: u64,

    /// Derived coverage, 0-100
    pub sync_percent: u8,

    pub last_updated: Option<DateTime<Utc>>,
}

impl RemoteQuotaCache {
    /// Read the cache; `None` until the first successful refresh
    pub fn load(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(cache) => Some(cache),
            Err(e) => {
                log::debug!("Quota cache {} unreadable: {}", path.display(), e);
                None
            }
        }
    }

    /// Replace the cache file in one step
    pub fn store(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        crate::write_atomic(path, &content)
    }

    /// Files present locally but not yet on the remote
    pub fn pending_files(&self) -> u64 {
        self.local_files.saturating_sub(self.cloud_files)
    }

    pub fn is_fully_synced(&self) -> bool {
        self.sync_percent >= 100 && self.local_files > 0
    }
}

/// Percentage of local files present on the remote, capped at 100
pub fn compute_sync_percent(local_files: u64, cloud_files: u64) -> u8 {
    if local_files == 0 {
        return 0;
    }

    let percent = u128::from(cloud_files) * 100 / u128::from(local_files);
    percent.min(100) as u8
}
