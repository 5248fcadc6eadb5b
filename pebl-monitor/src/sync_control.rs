// Sync schedule enforcement and the sync panel projection

use crate::os_ops::{OsOps, ProcessSignal};
use crate::status_channel::StatusChannel;
use crate::transfer::ProgressDisplay;
use chrono::NaiveDateTime;
use pebl_common::{
    OperationResult, PeblConfig, RemoteQuotaCache, SyncConfig, SyncMode, SyncStatusRecord,
    format_bytes,
};
use serde::Serialize;
use std::path::PathBuf;

/// Render-ready projection of the cloud sync panel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncView {
    pub mode: SyncMode,
    pub mode_label: String,
    pub schedule: String,
    pub in_window: bool,
    pub destination: String,
    pub account: String,
    pub storage: String,
    pub status: String,
    pub fully_synced: bool,
    pub progress: ProgressDisplay,
    pub stats: String,
}

/// Owns the persisted sync schedule
#[derive(Debug)]
pub struct SyncController {
    config_path: PathBuf,
    schedule: SyncConfig,
    patterns: Vec<String>,
    remote_name: String,
    remote_folder: String,
}

impl SyncController {
    pub fn new(config: &PeblConfig) -> Self {
        let schedule = SyncConfig::load(&config.sync_config_file);
        log::info!(
            "Sync schedule: {} ({}-{})",
            schedule.mode.as_str(),
            schedule.start_hour,
            schedule.end_hour
        );

        Self {
            config_path: config.sync_config_file.clone(),
            schedule,
            patterns: config.sync_process_patterns.clone(),
            remote_name: config.remote_name.clone(),
            remote_folder: config.remote_folder.clone(),
        }
    }

    #[cfg(test)]
    pub fn schedule(&self) -> SyncConfig {
        self.schedule
    }

    /// Persist a new schedule and revoke a running session it no longer allows
    pub fn apply(
        &mut self,
        schedule: SyncConfig,
        now: NaiveDateTime,
        ops: &dyn OsOps,
        channel: &StatusChannel,
    ) -> OperationResult {
        let schedule = match schedule.mode {
            SyncMode::Nightly => SyncConfig::nightly(),
            _ => schedule,
        };

        if let Err(e) = schedule.save(&self.config_path) {
            log::warn!("Failed to save sync schedule: {:#}", e);
            return OperationResult::error(format!("Failed to save sync schedule: {e:#}"));
        }
        self.schedule = schedule;
        log::info!(
            "Sync schedule set to {} ({}-{})",
            schedule.mode.as_str(),
            schedule.start_hour,
            schedule.end_hour
        );

        let window = schedule.status_at(now);
        if window.active {
            return OperationResult::success(format!("Sync mode set to {}", schedule.mode.label()));
        }

        let errors = self.revoke_session(ops, channel);
        if errors.is_empty() {
            OperationResult::success(format!(
                "Sync mode set to {}; sync paused until the window opens",
                schedule.mode.label()
            ))
        } else {
            OperationResult::error(format!(
                "Sync mode set to {}, but stopping sync failed: {}",
                schedule.mode.label(),
                errors.join(", ")
            ))
        }
    }

    /// Terminate the sync client and remove its lock marker
    pub fn revoke_session(&self, ops: &dyn OsOps, channel: &StatusChannel) -> Vec<String> {
        let mut errors = Vec::new();
        for pattern in &self.patterns {
            match ops.signal_processes(pattern, ProcessSignal::Terminate) {
                Ok(true) => log::info!("Stopped sync process '{pattern}'"),
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Failed to stop '{pattern}': {:#}", e);
                    errors.push(format!("{pattern}: {e:#}"));
                }
            }
        }
        if let Err(e) = channel.remove_sync_lock() {
            log::warn!("{:#}", e);
            errors.push(format!("{e:#}"));
        }
        errors
    }

    pub fn render(
        &self,
        now: NaiveDateTime,
        sync: &SyncStatusRecord,
        quota: Option<&RemoteQuotaCache>,
        transfer_busy: bool,
    ) -> SyncView {
        let window = self.schedule.status_at(now);
        let folder = if sync.folder.is_empty() {
            self.remote_folder.as_str()
        } else {
            sync.folder.as_str()
        };
        let destination = format!("{}:{}", self.remote_name, folder);

        let (account, storage) = match quota {
            Some(q) => (
                "Google Drive: Connected".to_string(),
                format!(
                    "Storage: {} / {} ({} free)",
                    format_bytes(q.used_bytes),
                    format_bytes(q.total_bytes),
                    format_bytes(q.free_bytes)
                ),
            ),
            None => ("Google Drive: Connecting...".to_string(), String::new()),
        };

        let mut view = SyncView {
            mode: self.schedule.mode,
            mode_label: self.schedule.mode.label().to_string(),
            schedule: window.description,
            in_window: window.active,
            destination: format!("Destination: {destination}"),
            account,
            storage,
            status: String::new(),
            fully_synced: false,
            progress: ProgressDisplay::Fraction {
                fraction: 0.0,
                text: "--".to_string(),
            },
            stats: String::new(),
        };

        if transfer_busy {
            view.status = "Waiting for USB backup to complete...".to_string();
            view.progress = fraction(0.0, "Pending");
            view.stats = "New files will sync after backup".to_string();
        } else if sync.active {
            let percent = sync.percent.min(100);
            view.status = format!(
                "Syncing: {} of {} files",
                sync.files_synced,
                sync.session_total()
            );
            view.progress = fraction(sync.percent_fraction(), &format!("{percent}%"));
            view.stats = format!("Uploading: {}", sync.speed);
        } else {
            match quota {
                Some(q) if q.is_fully_synced() => {
                    view.status = format!(
                        "All files synced with Google Drive ({}/{})",
                        q.cloud_files, q.local_files
                    );
                    view.fully_synced = true;
                    view.progress = fraction(1.0, "100%");
                    view.stats = format!("Saved in {destination}");
                }
                Some(q) if q.local_files > q.cloud_files => {
                    view.status = format!("{} files waiting to sync", q.pending_files());
                    view.progress = fraction(
                        f64::from(q.sync_percent.min(100)) / 100.0,
                        &format!("{}% ({}/{})", q.sync_percent, q.cloud_files, q.local_files),
                    );
                    let last = if sync.last_sync.is_empty() {
                        "Never"
                    } else {
                        sync.last_sync.as_str()
                    };
                    view.stats = format!("Last sync: {last}");
                }
                Some(_) => view.status = "Ready to sync".to_string(),
                None => view.status = "Checking sync status...".to_string(),
            }
        }

        view
    }
}

fn fraction(fraction: f64, text: &str) -> ProgressDisplay {
    ProgressDisplay::Fraction {
        fraction,
        text: text.to_string(),
    }
}
