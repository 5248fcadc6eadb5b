//! Background refresh of the remote quota cache
//!
//! The cloud client can take minutes to answer, so refreshes run on the blocking
//! pool and publish by atomically replacing the cache file. At most one refresh is
//! in flight; a failed refresh leaves the previous cache in place.

use crate::os_ops::run_command;
use anyhow::{Context, Result, bail};
use chrono::Utc;
use pebl_common::PeblConfig;
use pebl_common::quota::{RemoteQuotaCache, compute_sync_percent};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
struct RefreshSettings {
    remote_name: String,
    remote_destination: String,
    incoming_dir: PathBuf,
    cache_file: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct QuotaRefresher {
    settings: Arc<RefreshSettings>,
    in_flight: Arc<AtomicBool>,
}

impl QuotaRefresher {
    pub fn new(config: &PeblConfig) -> Self {
        Self {
            settings: Arc::new(RefreshSettings {
                remote_name: config.remote_name.clone(),
                remote_destination: config.remote_destination(),
                incoming_dir: config.incoming_dir.clone(),
                cache_file: config.quota_cache_file.clone(),
                timeout: config.timing.remote_timeout(),
            }),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a refresh unless one is already running; returns whether one started
    pub fn trigger(&self) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Quota refresh already in progress");
            return false;
        }

        let settings = Arc::clone(&self.settings);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::task::spawn_blocking(move || {
            match refresh_once(&settings) {
                Ok(cache) => log::info!(
                    "Quota cache refreshed: {}/{} files on remote ({}%)",
                    cache.cloud_files,
                    cache.local_files,
                    cache.sync_percent
                ),
                Err(e) => log::warn!("Quota refresh failed, keeping previous cache: {:#}", e),
            }
            in_flight.store(false, Ordering::Release);
        });
        true
    }
}

#[derive(Debug, Deserialize)]
struct AboutOutput {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    used: u64,
    #[serde(default)]
    free: u64,
}

#[derive(Debug, Default, Deserialize)]
struct SizeOutput {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    bytes: u64,
}

fn refresh_once(settings: &RefreshSettings) -> Result<RemoteQuotaCache> {
    let remote = format!("{}:", settings.remote_name);
    let about = run_command("rclone", &["about", &remote, "--json"], settings.timeout)?;
    if !about.status.success() {
        bail!("rclone about failed: {}", about.stderr.trim());
    }
    let about: AboutOutput =
        serde_json::from_str(&about.stdout).context("Failed to parse rclone about output")?;

    let (local_files, local_size) = scan_local(&settings.incoming_dir);

    let cloud = match run_command(
        "rclone",
        &["size", &settings.remote_destination, "--json"],
        settings.timeout,
    ) {
        Ok(output) if output.status.success() => parse_size(&output.stdout),
        Ok(output) => {
            log::debug!("rclone size failed: {}", output.stderr.trim());
            SizeOutput::default()
        }
        Err(e) => {
            log::debug!("rclone size failed: {:#}", e);
            SizeOutput::default()
        }
    };

    let cache = RemoteQuotaCache {
        total_bytes: about.total,
        used_bytes: about.used,
        free_bytes: about.free,
        local_files,
        local_size,
        cloud_files: cloud.count,
        cloud_size: cloud.bytes,
        sync_percent: compute_sync_percent(local_files, cloud.count),
        last_updated: Some(Utc::now()),
    };
    cache.store(&settings.cache_file)?;
    Ok(cache)
}

fn parse_size(json: &str) -> SizeOutput {
    serde_json::from_str(json).unwrap_or_else(|e| {
        log::debug!("Unparseable rclone size output: {}", e);
        SizeOutput::default()
    })
}

/// Count and total size of regular files under `dir`
fn scan_local(dir: &Path) -> (u64, u64) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .fold((0, 0), |(count, size), entry| {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (count + 1, size + len)
        })
}
