// Activity log written by the transfer script, one JSON object per line

use serde::{Deserialize, Serialize};
use std::path::Path;

/// How many entries the dashboard shows
pub const RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub time: String,
}

fn default_title() -> String {
    "Unknown".to_string()
}

impl Notification {
    /// Time without fractional seconds or offset
    pub fn short_time(&self) -> &str {
        self.time.get(..19).unwrap_or(&self.time)
    }
}

/// The last `limit` well-formed entries, oldest first
pub fn read_recent(path: &Path, limit: usize) -> Vec<Notification> {
    let content = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => return Vec::new(),
    };

    let mut entries: Vec<Notification> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();

    let skip = entries.len().saturating_sub(limit);
    entries.drain(..skip);
    entries
}
