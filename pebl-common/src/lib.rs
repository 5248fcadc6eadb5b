// Shared types and utilities for the PEBL backup monitor

pub mod config;
pub mod format;
pub mod phase;
pub mod progress;
pub mod quota;
pub mod schedule;
pub mod sync_status;

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::Context;

pub use config::{PeblConfig, TimingConfig};
pub use format::{format_bytes, format_countdown};
pub use phase::Phase;
pub use progress::ProgressRecord;
pub use quota::RemoteQuotaCache;
pub use schedule::{SyncConfig, SyncMode, WindowStatus, in_window};
pub use sync_status::SyncStatusRecord;

/// Result of an operator-triggered operation, suitable for direct display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
}

impl OperationResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Replace `path` with `content` so readers never observe a partial write
///
/// Writes a sibling temporary file, syncs it, then renames it over the target.
pub fn write_atomic(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("Failed to open temporary file {}", tmp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_result_constructors() {
        let ok = OperationResult::success("done");
        assert!(ok.success);
        assert_eq!(ok.message, "done");

        let err = OperationResult::error("nope");
        assert!(!err.success);
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("tmp").exists());
    }
}
