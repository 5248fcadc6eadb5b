// Centralized configuration for the PEBL monitor

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the optional TOML override file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/pebl/monitor.toml";

/// Timer periods and grace intervals, all in milliseconds or seconds as named
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Transfer/sync status projection tick
    pub status_poll_ms: u64,

    /// Physical device removal detection tick
    pub removal_poll_ms: u64,

    /// Remote quota refresh tick
    pub quota_refresh_secs: u64,

    /// Idle-dim check tick
    pub idle_check_secs: u64,

    /// Inactivity before the display is dimmed
    pub idle_dim_secs: u64,

    /// How long the "ejected" confirmation stays visible
    pub eject_grace_secs: u64,

    /// Upper bound for any external command (mount, kill, lsblk)
    pub command_timeout_secs: u64,

    /// Upper bound for cloud client queries during quota refresh
    pub remote_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            status_poll_ms: 500,
            removal_poll_ms: 2000,
            quota_refresh_secs: 300,
            idle_check_secs: 10,
            idle_dim_secs: 300,
            eject_grace_secs: 3,
            command_timeout_secs: 10,
            remote_timeout_secs: 180,
        }
    }
}

impl TimingConfig {
    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    pub fn removal_poll(&self) -> Duration {
        Duration::from_millis(self.removal_poll_ms)
    }

    pub fn quota_refresh(&self) -> Duration {
        Duration::from_secs(self.quota_refresh_secs)
    }

    pub fn idle_check(&self) -> Duration {
        Duration::from_secs(self.idle_check_secs)
    }

    pub fn idle_dim(&self) -> Duration {
        Duration::from_secs(self.idle_dim_secs)
    }

    pub fn eject_grace(&self) -> Duration {
        Duration::from_secs(self.eject_grace_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

/// Monitor configuration with support for a TOML file and environment variable overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeblConfig {
    /// Single-token phase file written by the transfer script
    pub status_file: PathBuf,

    /// Progress record written by the transfer script
    pub progress_file: PathBuf,

    /// Session record written by the cloud sync client
    pub sync_status_file: PathBuf,

    /// Operator-chosen sync schedule, read by the sync client
    pub sync_config_file: PathBuf,

    /// Answer to the duplicate-resolution prompt
    pub decision_file: PathBuf,

    /// Answer to the device-naming prompt
    pub device_ref_file: PathBuf,

    /// Cached remote storage totals
    pub quota_cache_file: PathBuf,

    /// JSON-lines activity log written by the transfer script
    pub notifications_file: PathBuf,

    /// Presence marker: USB transfer pipeline busy
    pub transfer_lock: PathBuf,

    /// Presence marker: cloud sync session running
    pub sync_lock: PathBuf,

    /// Directory under which removable media are auto-mounted
    pub removable_media_root: PathBuf,

    /// Fixed auxiliary mount point used by the transfer script
    pub usb_source_mount: PathBuf,

    /// Mount point of the appliance's primary storage volume
    pub storage_mount: PathBuf,

    /// Device tried first when mounting primary storage
    pub storage_device: PathBuf,

    /// Devices tried, in order, when the primary one fails
    pub storage_device_alternates: Vec<PathBuf>,

    /// Kernel name of the fixed storage disk, excluded from removable scans
    pub fixed_disk: String,

    /// Filesystem types treated as removable USB media
    pub removable_fstypes: Vec<String>,

    /// Folder on primary storage that the sync client uploads
    pub incoming_dir: PathBuf,

    /// Cloud client remote name (without the trailing colon)
    pub remote_name: String,

    /// Destination folder on the remote
    pub remote_folder: String,

    /// Process patterns for the transfer script and its copy sub-process
    pub transfer_process_patterns: Vec<String>,

    /// Process patterns for the cloud sync client
    pub sync_process_patterns: Vec<String>,

    /// Address the dashboard listens on
    pub dashboard_addr: String,

    /// Root of the sysfs backlight class
    pub backlight_root: PathBuf,

    pub timing: TimingConfig,
}

impl Default for PeblConfig {
    fn default() -> Self {
        Self {
            status_file: PathBuf::from("/tmp/usb-transfer-status"),
            progress_file: PathBuf::from("/tmp/usb-transfer-progress.json"),
            sync_status_file: PathBuf::from("/tmp/gdrive-sync-status.json"),
            sync_config_file: PathBuf::from("/opt/usb-transfer/sync-config.json"),
            decision_file: PathBuf::from("/tmp/usb-transfer-decision"),
            device_ref_file: PathBuf::from("/tmp/usb-device-reference"),
            quota_cache_file: PathBuf::from("/tmp/gdrive-info.json"),
            notifications_file: PathBuf::from("/var/log/usb-transfer/notifications.json"),
            transfer_lock: PathBuf::from("/tmp/usb-transfer.lock"),
            sync_lock: PathBuf::from("/tmp/gdrive-sync.lock"),
            removable_media_root: PathBuf::from("/media/pebl"),
            usb_source_mount: PathBuf::from("/media/usb-source"),
            storage_mount: PathBuf::from("/media/external-hdd"),
            storage_device: PathBuf::from("/dev/sda1"),
            storage_device_alternates: vec![PathBuf::from("/dev/sda1"), PathBuf::from("/dev/sdb1")],
            fixed_disk: "sda".to_string(),
            removable_fstypes: vec!["vfat".to_string(), "ntfs".to_string(), "exfat".to_string()],
            incoming_dir: PathBuf::from("/media/external-hdd/incoming"),
            remote_name: "gdrive".to_string(),
            remote_folder: "RaPi-PEBL-Sync".to_string(),
            transfer_process_patterns: vec!["on-usb-insert.sh".to_string(), "rsync".to_string()],
            sync_process_patterns: vec!["backup-to-gdrive".to_string(), "rclone sync".to_string()],
            dashboard_addr: "0.0.0.0:8080".to_string(),
            backlight_root: PathBuf::from("/sys/class/backlight"),
            timing: TimingConfig::default(),
        }
    }
}

impl PeblConfig {
    /// Create a new configuration from defaults, the TOML file, and the environment
    ///
    /// The TOML file is `$PEBL_CONFIG` if set, otherwise [`DEFAULT_CONFIG_FILE`].
    /// A missing file is not an error; a malformed one is logged and ignored.
    ///
    /// Supported environment variables:
    /// - PEBL_STATUS_FILE, PEBL_PROGRESS_FILE, PEBL_SYNC_STATUS_FILE
    /// - PEBL_SYNC_CONFIG_FILE: Override the persisted sync schedule path
    /// - PEBL_QUOTA_CACHE_FILE, PEBL_NOTIFICATIONS_FILE
    /// - PEBL_STORAGE_MOUNT: Override the primary storage mount point
    /// - PEBL_DASHBOARD_ADDR: Override the dashboard listen address
    /// - PEBL_IDLE_DIM_SECS: Override the idle-dim threshold
    pub fn new() -> Self {
        let path = std::env::var("PEBL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = match Self::load_from_file(&path) {
            Ok(Some(config)) => {
                log::info!("Loaded configuration from {}", path.display());
                config
            }
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring configuration file {}: {:#}", path.display(), e);
                Self::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load a configuration file, returning `None` when it does not exist
    pub fn load_from_file(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)?;
        let config: PeblConfig = toml::from_str(&content)?;
        Ok(Some(config))
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let paths: [(&str, &mut PathBuf); 7] = [
            ("PEBL_STATUS_FILE", &mut self.status_file),
            ("PEBL_PROGRESS_FILE", &mut self.progress_file),
            ("PEBL_SYNC_STATUS_FILE", &mut self.sync_status_file),
            ("PEBL_SYNC_CONFIG_FILE", &mut self.sync_config_file),
            ("PEBL_QUOTA_CACHE_FILE", &mut self.quota_cache_file),
            ("PEBL_NOTIFICATIONS_FILE", &mut self.notifications_file),
            ("PEBL_STORAGE_MOUNT", &mut self.storage_mount),
        ];

        for (key, slot) in paths {
            if let Some(value) = lookup(key) {
                *slot = PathBuf::from(value);
            }
        }

        if let Some(addr) = lookup("PEBL_DASHBOARD_ADDR") {
            self.dashboard_addr = addr;
        }

        if let Some(secs) = lookup("PEBL_IDLE_DIM_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => self.timing.idle_dim_secs = secs,
                Err(_) => log::warn!("Ignoring invalid PEBL_IDLE_DIM_SECS value '{secs}'"),
            }
        }
    }

    /// Remote path in `remote:folder` form
    pub fn remote_destination(&self) -> String {
        format!("{}:{}", self.remote_name, self.remote_folder)
    }

    /// Files cleared whenever the transfer pipeline returns to idle
    pub fn transfer_state_files(&self) -> [&Path; 3] {
        [&self.status_file, &self.progress_file, &self.transfer_lock]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = PeblConfig::default();
        assert_eq!(config.status_file, PathBuf::from("/tmp/usb-transfer-status"));
        assert_eq!(config.timing.status_poll_ms, 500);
        assert_eq!(config.timing.idle_dim_secs, 300);
        assert_eq!(config.remote_destination(), "gdrive:RaPi-PEBL-Sync");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        std::fs::write(
            &path,
            "remote_folder = \"Field-Site\"\n\n[timing]\nidle_dim_secs = 60\n",
        )
        .unwrap();

        let config = PeblConfig::load_from_file(&path).unwrap().unwrap();
        assert_eq!(config.remote_folder, "Field-Site");
        assert_eq!(config.timing.idle_dim_secs, 60);
        assert_eq!(config.timing.status_poll_ms, 500);
        assert_eq!(config.fixed_disk, "sda");
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = PeblConfig::load_from_file(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PEBL_STATUS_FILE", "/run/pebl/status"),
            ("PEBL_DASHBOARD_ADDR", "127.0.0.1:9090"),
            ("PEBL_IDLE_DIM_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = PeblConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.status_file, PathBuf::from("/run/pebl/status"));
        assert_eq!(config.dashboard_addr, "127.0.0.1:9090");
        assert_eq!(config.timing.idle_dim_secs, 300);
    }
}
