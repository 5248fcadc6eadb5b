// Session status written by the cloud sync client

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current cloud sync session, owned by the sync client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncStatusRecord {
    pub active: bool,
    pub percent: u8,
    pub speed: String,
    pub files_synced: u64,
    pub files_remaining: u64,
    /// Destination folder on the remote
    pub folder: String,
    /// Last successful sync, as the client formats it
    pub last_sync: String,
}

impl SyncStatusRecord {
    /// Read the record; missing or malformed files read as an inactive session
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::debug!("Sync status {} unreadable: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Files in the current session, counting those still queued
    pub fn session_total(&self) -> u64 {
        self.files_synced + self.files_remaining
    }

    pub fn percent_fraction(&self) -> f64 {
        f64::from(self.percent.min(100)) / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let record = SyncStatusRecord::load(&dir.path().join("absent.json"));
        assert!(!record.active);
        assert_eq!(record, SyncStatusRecord::default());
    }

    #[test]
    fn test_load_partial_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(
            &path,
            r#"{"active": true, "percent": 40, "files_synced": 8, "files_remaining": 12, "speed": "1.2 MB/s"}"#,
        )
        .unwrap();

        let record = SyncStatusRecord::load(&path);
        assert!(record.active);
        assert_eq!(record.session_total(), 20);
        assert_eq!(record.folder, "");
        assert!((record.percent_fraction() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_truncated_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"active": true, "perc"#).unwrap();

        assert!(!SyncStatusRecord::load(&path).active);
    }
}
