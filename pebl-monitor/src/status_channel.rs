//! File-based status channel shared with the transfer script and sync client
//!
//! External writers rewrite these files in place without locking; reads here are
//! total and always produce a usable snapshot.

use anyhow::{Context, Result};
use pebl_common::{PeblConfig, Phase, ProgressRecord, RemoteQuotaCache, SyncStatusRecord};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StatusChannel {
    status_file: PathBuf,
    progress_file: PathBuf,
    sync_status_file: PathBuf,
    quota_cache_file: PathBuf,
    transfer_lock: PathBuf,
    sync_lock: PathBuf,
}

impl StatusChannel {
    pub fn new(config: &PeblConfig) -> Self {
        Self {
            status_file: config.status_file.clone(),
            progress_file: config.progress_file.clone(),
            sync_status_file: config.sync_status_file.clone(),
            quota_cache_file: config.quota_cache_file.clone(),
            transfer_lock: config.transfer_lock.clone(),
            sync_lock: config.sync_lock.clone(),
        }
    }

    /// Current phase; a missing or unreadable file reads as idle
    ///
    /// `None` when the file holds no complete token, which callers treat as no reading
    /// at all rather than a move to idle.
    pub fn read_phase(&self) -> Option<Phase> {
        match read_lossy(&self.status_file) {
            Some(content) => Phase::parse(&content),
            None => Some(Phase::Idle),
        }
    }

    pub fn read_progress(&self) -> ProgressRecord {
        read_lossy(&self.progress_file)
            .map(|content| ProgressRecord::parse(&content))
            .unwrap_or_default()
    }

    pub fn read_sync_status(&self) -> SyncStatusRecord {
        SyncStatusRecord::load(&self.sync_status_file)
    }

    pub fn read_quota(&self) -> Option<RemoteQuotaCache> {
        RemoteQuotaCache::load(&self.quota_cache_file)
    }

    pub fn transfer_locked(&self) -> bool {
        self.transfer_lock.exists()
    }

    #[cfg(test)]
    pub fn sync_locked(&self) -> bool {
        self.sync_lock.exists()
    }

    /// Publish a cancelled transfer: phase, zeroed progress, and no transfer lock
    pub fn force_cancelled(&self) -> Result<()> {
        pebl_common::write_atomic(&self.status_file, Phase::Cancelled.as_str().as_bytes())
            .context("Failed to write cancelled phase")?;
        pebl_common::write_atomic(
            &self.progress_file,
            ProgressRecord::cancelled().to_json().as_bytes(),
        )
        .context("Failed to write cancelled progress")?;
        remove_if_present(&self.transfer_lock)
    }

    /// Remove phase, progress, and transfer lock so the next poll reads idle
    ///
    /// Attempts every file and reports the first failure.
    pub fn clear_transfer_state(&self) -> Result<()> {
        let mut first_error = None;
        for path in [&self.status_file, &self.progress_file, &self.transfer_lock] {
            if let Err(e) = remove_if_present(path) {
                log::warn!("{:#}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn remove_sync_lock(&self) -> Result<()> {
        remove_if_present(&self.sync_lock)
    }
}

/// Read as UTF-8, replacing bytes split by a concurrent partial write
fn read_lossy(path: &Path) -> Option<String> {
    match std::fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            log::debug!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
pub(crate) fn test_config(dir: &Path) -> PeblConfig {
    PeblConfig {
        status_file: dir.join("usb-transfer-status"),
        progress_file: dir.join("usb-transfer-progress.json"),
        sync_status_file: dir.join("gdrive-sync-status.json"),
        sync_config_file: dir.join("sync-config.json"),
        decision_file: dir.join("usb-transfer-decision"),
        device_ref_file: dir.join("usb-device-reference"),
        quota_cache_file: dir.join("gdrive-info.json"),
        notifications_file: dir.join("notifications.json"),
        transfer_lock: dir.join("usb-transfer.lock"),
        sync_lock: dir.join("gdrive-sync.lock"),
        removable_media_root: dir.join("media"),
        incoming_dir: dir.join("incoming"),
        backlight_root: dir.join("backlight"),
        ..PeblConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_read_as_idle() {
        let dir = tempfile::tempdir().unwrap();
        let channel = StatusChannel::new(&test_config(dir.path()));

        assert_eq!(channel.read_phase(), Some(Phase::Idle));
        assert_eq!(channel.read_progress(), ProgressRecord::default());
        assert!(!channel.read_sync_status().active);
        assert!(channel.read_quota().is_none());
        assert!(!channel.transfer_locked());
    }

    #[test]
    fn test_reads_phase_with_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(&config.status_file, "TRANSFERRING\n").unwrap();

        assert_eq!(StatusChannel::new(&config).read_phase(), Some(Phase::Transferring));
    }

    #[test]
    fn test_blank_or_torn_phase_is_no_reading() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let channel = StatusChannel::new(&config);

        std::fs::write(&config.status_file, "").unwrap();
        assert_eq!(channel.read_phase(), None);

        std::fs::write(&config.status_file, "PENDING_DEC").unwrap();
        assert_eq!(channel.read_phase(), None);

        std::fs::remove_file(&config.status_file).unwrap();
        assert_eq!(channel.read_phase(), Some(Phase::Idle));
    }

    #[test]
    fn test_invalid_utf8_progress_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut bytes = br#"{"percent": 12, "message": "caf"#.to_vec();
        bytes.push(0xC3);
        std::fs::write(&config.progress_file, bytes).unwrap();

        let progress = StatusChannel::new(&config).read_progress();
        assert_eq!(progress.percent, 12);
    }

    #[test]
    fn test_force_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(&config.status_file, "TRANSFERRING").unwrap();
        std::fs::write(&config.progress_file, r#"{"percent": 50, "files_done": 5}"#).unwrap();
        std::fs::write(&config.transfer_lock, "").unwrap();

        let channel = StatusChannel::new(&config);
        channel.force_cancelled().unwrap();

        assert_eq!(channel.read_phase(), Some(Phase::Cancelled));
        let progress = channel.read_progress();
        assert_eq!(progress.percent, 0);
        assert_eq!(progress.files_done, 0);
        assert!(!channel.transfer_locked());
    }

    #[test]
    fn test_clear_transfer_state_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(&config.status_file, "COMPLETE").unwrap();
        std::fs::write(&config.transfer_lock, "").unwrap();

        let channel = StatusChannel::new(&config);
        channel.clear_transfer_state().unwrap();
        channel.clear_transfer_state().unwrap();

        for path in config.transfer_state_files() {
            assert!(!path.exists(), "{} left behind", path.display());
        }
        assert_eq!(channel.read_phase(), Some(Phase::Idle));
    }
}
