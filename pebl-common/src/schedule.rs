// Cloud sync schedule configuration and window evaluation

use anyhow::Context;
use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;

/// Start hour of the fixed nightly window
pub const NIGHT_START_HOUR: u8 = 22;
/// End hour of the fixed nightly window
pub const NIGHT_END_HOUR: u8 = 6;

/// When the sync client is allowed to upload
///
/// Tokens match what the external sync client reads from the config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Always allowed
    #[default]
    #[serde(rename = "24hr", alias = "continuous")]
    Continuous,
    /// Fixed 22:00 - 06:00 window
    #[serde(rename = "night", alias = "nightly")]
    Nightly,
    /// Operator-chosen window
    #[serde(rename = "scheduled", alias = "custom")]
    Custom,
}

impl SyncMode {
    pub fn as_str(&self) -> &str {
        match self {
            SyncMode::Continuous => "24hr",
            SyncMode::Nightly => "night",
            SyncMode::Custom => "scheduled",
        }
    }

    /// Panel heading for the mode
    pub fn label(&self) -> &str {
        match self {
            SyncMode::Continuous => "24HR MODE - Always Syncing",
            SyncMode::Nightly => "Night Mode",
            SyncMode::Custom => "Custom Schedule",
        }
    }
}

/// Persisted sync schedule; the only state the monitor itself owns across restarts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: SyncMode,

    /// Window start hour (0-23), used by windowed modes
    #[serde(default = "default_start_hour")]
    pub start_hour: u8,

    /// Window end hour (0-23), exclusive
    #[serde(default = "default_end_hour")]
    pub end_hour: u8,
}

fn default_start_hour() -> u8 {
    NIGHT_START_HOUR
}

fn default_end_hour() -> u8 {
    NIGHT_END_HOUR
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Continuous,
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
        }
    }
}

impl SyncConfig {
    pub fn continuous() -> Self {
        Self {
            mode: SyncMode::Continuous,
            ..Self::default()
        }
    }

    pub fn nightly() -> Self {
        Self {
            mode: SyncMode::Nightly,
            start_hour: NIGHT_START_HOUR,
            end_hour: NIGHT_END_HOUR,
        }
    }

    pub fn custom(start_hour: u8, end_hour: u8) -> Self {
        Self {
            mode: SyncMode::Custom,
            start_hour,
            end_hour,
        }
    }

    /// Validate this schedule configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.start_hour > 23 {
            return Err(format!(
                "Invalid start_hour {}. Must be 0-23",
                self.start_hour
            ));
        }

        if self.end_hour > 23 {
            return Err(format!("Invalid end_hour {}. Must be 0-23", self.end_hour));
        }

        Ok(())
    }

    /// Effective window; nightly mode ignores the stored hours
    pub fn window(&self) -> (u8, u8) {
        match self.mode {
            SyncMode::Nightly => (NIGHT_START_HOUR, NIGHT_END_HOUR),
            _ => (self.start_hour, self.end_hour),
        }
    }

    /// Evaluate this schedule at `now`
    pub fn status_at(&self, now: NaiveDateTime) -> WindowStatus {
        let (start, end) = self.window();
        in_window(now, self.mode, start, end)
    }

    /// Load the schedule, falling back to defaults when missing or unreadable
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|content| Ok(serde_json::from_str::<SyncConfig>(&content)?))
        {
            Ok(config) if config.validate().is_ok() => config,
            Ok(config) => {
                log::warn!(
                    "Sync config {} out of range ({:?}), using defaults",
                    path.display(),
                    config
                );
                Self::default()
            }
            Err(e) => {
                log::warn!("Failed to read sync config {}: {:#}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Persist the schedule atomically under an exclusive lock
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.validate().map_err(|e| anyhow::anyhow!(e))?;

        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize sync config")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open {}", lock_path.display()))?;
        fs2::FileExt::lock_exclusive(&lock).context("Failed to lock sync config for writing")?;

        let result = crate::write_atomic(path, content.as_bytes());
        fs2::FileExt::unlock(&lock).ok();
        result
    }
}

/// Outcome of evaluating a sync window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub active: bool,
    /// Human-readable description of the current or next transition
    pub description: String,
}

/// Whether `now` falls inside the sync window for `mode`
///
/// Continuous mode is always active. Windowed modes use `[start_hour, end_hour)`; when
/// `start_hour > end_hour` the window wraps past midnight. Equal hours form an empty
/// window. Out of window, the description counts down to the next start.
pub fn in_window(now: NaiveDateTime, mode: SyncMode, start_hour: u8, end_hour: u8) -> WindowStatus {
    if mode == SyncMode::Continuous {
        return WindowStatus {
            active: true,
            description: "Continuous sync enabled".to_string(),
        };
    }

    let hour = now.hour();
    let (start, end) = (u32::from(start_hour), u32::from(end_hour));

    let active = if start <= end {
        start <= hour && hour < end
    } else {
        hour >= start || hour < end
    };

    if active {
        return WindowStatus {
            active,
            description: format!("Sync active ({start}:00 - {end}:00)"),
        };
    }

    let start_time = NaiveTime::from_hms_opt(start.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let mut next_start = now.date().and_time(start_time);
    if next_start <= now {
        next_start += Duration::days(1);
    }
    let remaining = (next_start - now).num_seconds();

    WindowStatus {
        active,
        description: format!(
            "Next sync at {start}:00 (in {})",
            crate::format::format_countdown(remaining)
        ),
    }
}
