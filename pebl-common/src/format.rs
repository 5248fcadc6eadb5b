//! Formatting utilities for displaying sizes and countdowns

/// Format bytes as human-readable size using binary units (KiB, MiB, GiB)
///
/// # Examples
/// ```
/// use pebl_common::format_bytes;
/// assert_eq!(format_bytes(1024), "1.00 KiB");
/// assert_eq!(format_bytes(1536), "1.50 KiB");
/// assert_eq!(format_bytes(1048576), "1.00 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format a countdown as whole hours and minutes, e.g. `"3h 12m"`
///
/// Seconds are truncated; negative input is treated as zero.
///
/// # Examples
/// ```
/// use pebl_common::format_countdown;
/// assert_eq!(format_countdown(59), "0h 0m");
/// assert_eq!(format_countdown(3 * 3600 + 12 * 60 + 30), "3h 12m");
/// ```
pub fn format_countdown(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    format!("{hours}h {mins}m")
}
