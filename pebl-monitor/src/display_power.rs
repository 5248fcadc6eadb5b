// Idle dimming of the appliance display

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DEFAULT_MAX_BRIGHTNESS: u32 = 255;

/// Display brightness control
pub trait Backlight {
    fn set_brightness(&self, level: u32) -> Result<()>;

    /// Level used when awake
    fn wake_level(&self) -> u32;

    /// Level used when dimmed
    fn dim_level(&self) -> u32;
}

/// Backlight exposed through sysfs; a no-op when the device has none
#[derive(Debug, Clone)]
pub struct SysfsBacklight {
    brightness_path: Option<PathBuf>,
    max_brightness: u32,
}

impl SysfsBacklight {
    /// Use the first device under `root`, e.g. `/sys/class/backlight`
    pub fn detect(root: &Path) -> Self {
        let device = std::fs::read_dir(root).ok().and_then(|entries| {
            let mut devices: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect();
            devices.sort();
            devices.into_iter().next()
        });

        let Some(device) = device else {
            log::info!("No backlight device under {}, dimming disabled", root.display());
            return Self {
                brightness_path: None,
                max_brightness: DEFAULT_MAX_BRIGHTNESS,
            };
        };

        let max_brightness = std::fs::read_to_string(device.join("max_brightness"))
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_BRIGHTNESS);

        log::info!(
            "Using backlight {} (max brightness {})",
            device.display(),
            max_brightness
        );
        Self {
            brightness_path: Some(device.join("brightness")),
            max_brightness,
        }
    }
}

impl Backlight for SysfsBacklight {
    fn set_brightness(&self, level: u32) -> Result<()> {
        let Some(path) = &self.brightness_path else {
            return Ok(());
        };
        std::fs::write(path, level.to_string())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn wake_level(&self) -> u32 {
        self.max_brightness
    }

    fn dim_level(&self) -> u32 {
        (self.max_brightness / 10).max(1)
    }
}

/// Dims after a period without activity and wakes on the next one
///
/// Independent of the transfer pipeline. Each dim and wake is issued once per
/// transition; repeated checks while dimmed do nothing.
pub struct DisplayPowerManager {
    backlight: Box<dyn Backlight>,
    idle_threshold: Duration,
    last_activity: Instant,
    dimmed: bool,
}

impl DisplayPowerManager {
    pub fn new(backlight: Box<dyn Backlight>, idle_threshold: Duration, now: Instant) -> Self {
        Self {
            backlight,
            idle_threshold,
            last_activity: now,
            dimmed: false,
        }
    }

    pub fn is_dimmed(&self) -> bool {
        self.dimmed
    }

    /// Reset the idle clock, waking the display if dimmed
    ///
    /// Returns whether the display was woken.
    pub fn record_activity(&mut self, now: Instant) -> bool {
        self.last_activity = now;
        if !self.dimmed {
            return false;
        }

        self.dimmed = false;
        self.apply(self.backlight.wake_level());
        log::debug!("Display woken");
        true
    }

    /// Dim once the idle threshold has passed; returns whether this call dimmed
    pub fn check_idle(&mut self, now: Instant) -> bool {
        if self.dimmed || now.duration_since(self.last_activity) < self.idle_threshold {
            return false;
        }
        log::debug!("Display idle for {:?}, dimming", self.idle_threshold);
        self.dim_now()
    }

    /// Dim immediately; returns whether this call dimmed
    pub fn dim_now(&mut self) -> bool {
        if self.dimmed {
            return false;
        }
        self.dimmed = true;
        self.apply(self.backlight.dim_level());
        true
    }

    fn apply(&self, level: u32) {
        if let Err(e) = self.backlight.set_brightness(level) {
            log::warn!("{:#}", e);
        }
    }
}
