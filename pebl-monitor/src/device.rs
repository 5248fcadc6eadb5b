//! Mount, eject, and removal detection for primary storage and removable media
//!
//! Every operation here is safe to repeat and never returns an error: OS failures are
//! collected into reports the operator can read.

use crate::os_ops::{BlockDevice, OsOps, ProcessSignal};
use crate::status_channel::StatusChannel;
use pebl_common::PeblConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Result of mounting a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MountOutcome {
    Mounted { device: String },
    AlreadyMounted,
    NotFound,
    Error { reason: String },
}

/// Removable devices mounted by a scan, and the ones that could not be
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemovableScan {
    pub mounted: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemountReport {
    pub storage: MountOutcome,
    pub removables: RemovableScan,
}

impl RemountReport {
    pub fn summary(&self) -> String {
        let mut mounted = Vec::new();
        let mut errors = Vec::new();

        match &self.storage {
            MountOutcome::Mounted { device } => mounted.push(format!("External HDD ({device})")),
            MountOutcome::AlreadyMounted => {}
            MountOutcome::NotFound => errors.push("External HDD not found".to_string()),
            MountOutcome::Error { reason } => errors.push(format!("External HDD: {reason}")),
        }
        mounted.extend(self.removables.mounted.iter().cloned());
        errors.extend(self.removables.errors.iter().cloned());

        match (mounted.is_empty(), errors.is_empty()) {
            (true, true) => "All devices already mounted".to_string(),
            (false, true) => format!("Mounted: {}", mounted.join(", ")),
            (true, false) => format!("Errors: {}", errors.join(", ")),
            (false, false) => format!(
                "Mounted: {}; Errors: {}",
                mounted.join(", "),
                errors.join(", ")
            ),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.storage,
            MountOutcome::Mounted { .. } | MountOutcome::AlreadyMounted
        ) && self.removables.errors.is_empty()
    }
}

/// Mount points released by eject or dismount, and failures along the way
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseReport {
    pub unmounted: Vec<String>,
    pub errors: Vec<String>,
}

impl ReleaseReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn merge(&mut self, other: ReleaseReport) {
        self.unmounted.extend(other.unmounted);
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone)]
pub struct DeviceLifecycleCoordinator {
    removable_media_root: PathBuf,
    usb_source_mount: PathBuf,
    storage_mount: PathBuf,
    storage_devices: Vec<PathBuf>,
    fixed_disk: String,
    removable_fstypes: Vec<String>,
    sync_patterns: Vec<String>,
}

impl DeviceLifecycleCoordinator {
    pub fn new(config: &PeblConfig) -> Self {
        let mut storage_devices = vec![config.storage_device.clone()];
        for device in &config.storage_device_alternates {
            if !storage_devices.contains(device) {
                storage_devices.push(device.clone());
            }
        }

        Self {
            removable_media_root: config.removable_media_root.clone(),
            usb_source_mount: config.usb_source_mount.clone(),
            storage_mount: config.storage_mount.clone(),
            storage_devices,
            fixed_disk: config.fixed_disk.clone(),
            removable_fstypes: config.removable_fstypes.clone(),
            sync_patterns: config.sync_process_patterns.clone(),
        }
    }

    /// Mount `target` unless it already is, trying `devices` in order
    pub fn mount_if_needed(&self, ops: &dyn OsOps, target: &Path, devices: &[PathBuf]) -> MountOutcome {
        match ops.is_mounted(target) {
            Ok(true) => return MountOutcome::AlreadyMounted,
            Ok(false) => {}
            Err(e) => {
                log::warn!("Could not check {}: {:#}", target.display(), e);
                return MountOutcome::Error {
                    reason: format!("{e:#}"),
                };
            }
        }

        for device in devices {
            match ops.mount(device, target) {
                Ok(()) => {
                    log::info!("Mounted {} on {}", device.display(), target.display());
                    return MountOutcome::Mounted {
                        device: device.display().to_string(),
                    };
                }
                Err(e) => log::debug!("Mounting {} failed: {:#}", device.display(), e),
            }
        }

        log::warn!("No device could be mounted on {}", target.display());
        MountOutcome::NotFound
    }

    pub fn mount_storage(&self, ops: &dyn OsOps) -> MountOutcome {
        self.mount_if_needed(ops, &self.storage_mount, &self.storage_devices)
    }

    /// Disks backing primary storage: the configured fixed disk plus whichever disk
    /// currently holds the storage mount
    fn storage_disks<'a>(&'a self, devices: &'a [BlockDevice]) -> Vec<&'a str> {
        let mut disks = vec![self.fixed_disk.as_str()];
        for device in devices {
            if device.mountpoint.as_deref().map(Path::new) == Some(self.storage_mount.as_path())
                && !disks.contains(&device.disk.as_str())
            {
                disks.push(&device.disk);
            }
        }
        disks
    }

    fn is_removable_candidate(&self, device: &BlockDevice, storage_disks: &[&str]) -> bool {
        !storage_disks.contains(&device.disk.as_str())
            && device
                .fstype
                .as_deref()
                .is_some_and(|fs| self.removable_fstypes.iter().any(|t| t == fs))
    }

    /// Mount every unmounted removable filesystem through the user-space helper
    pub fn scan_and_mount_removables(&self, ops: &dyn OsOps) -> RemovableScan {
        let mut scan = RemovableScan::default();

        let devices = match ops.block_devices() {
            Ok(devices) => devices,
            Err(e) => {
                log::warn!("Block device scan failed: {:#}", e);
                scan.errors.push(format!("Device scan failed: {e:#}"));
                return scan;
            }
        };

        let storage_disks = self.storage_disks(&devices);
        for device in devices
            .iter()
            .filter(|d| self.is_removable_candidate(d, &storage_disks) && !d.is_mounted())
        {
            let path = PathBuf::from(device.device_path());
            match ops.mount_removable(&path) {
                Ok(()) => {
                    log::info!("Mounted removable {}", path.display());
                    scan.mounted.push(format!("USB ({})", device.name));
                }
                Err(e) => {
                    log::warn!("Mounting {} failed: {:#}", path.display(), e);
                    scan.errors.push(format!("USB ({})", device.name));
                }
            }
        }

        scan
    }

    pub fn remount(&self, ops: &dyn OsOps) -> RemountReport {
        RemountReport {
            storage: self.mount_storage(ops),
            removables: self.scan_and_mount_removables(ops),
        }
    }

    /// Whether a USB disk other than the ones backing primary storage is attached
    pub fn removable_connected(&self, ops: &dyn OsOps) -> anyhow::Result<bool> {
        let devices = ops.block_devices()?;
        let storage_disks = self.storage_disks(&devices);
        Ok(devices.iter().any(|d| {
            d.transport.as_deref() == Some("usb") && !storage_disks.contains(&d.disk.as_str())
        }))
    }

    /// Unmount all removable media and clear the transfer state files
    ///
    /// The caller schedules the delayed return to idle.
    pub fn eject(&self, ops: &dyn OsOps, channel: &StatusChannel) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        let mut targets = self.removable_mount_points();
        targets.push(self.usb_source_mount.clone());
        for target in &targets {
            release(ops, target, &mut report);
        }

        if let Err(e) = channel.clear_transfer_state() {
            report.errors.push(format!("{e:#}"));
        }

        report
    }

    /// Stop sync, flush, and release every device including primary storage
    pub fn dismount_all(&self, ops: &dyn OsOps, channel: &StatusChannel) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        for pattern in &self.sync_patterns {
            if let Err(e) = ops.signal_processes(pattern, ProcessSignal::Terminate) {
                report.errors.push(format!("Stopping {pattern}: {e:#}"));
            }
        }
        if let Err(e) = channel.remove_sync_lock() {
            report.errors.push(format!("{e:#}"));
        }
        if let Err(e) = ops.sync_filesystems() {
            report.errors.push(format!("Flushing buffers: {e:#}"));
        }

        report.merge(self.eject(ops, channel));
        release(ops, &self.storage_mount, &mut report);

        report
    }

    fn removable_mount_points(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.removable_media_root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut points: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        points.sort();
        points
    }
}

/// Unmount `target` if mounted, recording the outcome
fn release(ops: &dyn OsOps, target: &Path, report: &mut ReleaseReport) {
    match ops.is_mounted(target) {
        Ok(false) => return,
        Ok(true) => {}
        Err(e) => log::debug!("Could not check {}: {:#}", target.display(), e),
    }

    match ops.unmount(target) {
        Ok(()) => {
            log::info!("Unmounted {}", target.display());
            report.unmounted.push(target.display().to_string());
        }
        Err(e) => {
            log::warn!("Unmounting {} failed: {:#}", target.display(), e);
            report.errors.push(format!("{}: {e:#}", target.display()));
        }
    }
}
