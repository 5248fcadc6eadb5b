//! Progress records written by the USB transfer script
//!
//! The script rewrites its progress file in place without any locking, so a poll can
//! observe a truncated document. It also has a known bug where the nested
//! `file_types` mapping is emitted with unbalanced braces. [`ProgressRecord::parse`]
//! never fails; it degrades through three steps:
//!
//! 1. strict JSON parse, reading each field leniently
//! 2. repair the `file_types` mapping, then strict parse again
//! 3. per-field pattern extraction over the raw text
//!
//! Anything not recovered keeps its default (`0`, empty string, status `transferring`).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Status reported when the progress file cannot tell us anything better
pub const FALLBACK_STATUS: &str = "transferring";

static FILE_TYPES_REPAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""file_types"\s*:\s*\{+[^}]*\}+"#).unwrap());

static NUMBER_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(\w+)"\s*:\s*(-?\d+(?:\.\d+)?)"#).unwrap());

static STRING_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(\w+)"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

/// Snapshot of transfer progress, rebuilt from scratch on every read
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ProgressRecord {
    /// Completion, 0-100
    pub percent: u8,
    pub message: String,
    pub current_file: String,
    pub files_done: u64,
    pub files_total: u64,
    /// File-extension category to count
    pub file_types: BTreeMap<String, u64>,
    pub speed: String,
    pub eta: String,
    /// Files already present on primary storage
    pub existing_files: u64,
    /// Script-side sub-status, e.g. "transferring" or "cancelled"
    pub status: String,
}

impl ProgressRecord {
    /// Parse progress file content; total over any input
    pub fn parse(content: &str) -> Self {
        if content.trim().is_empty() {
            return Self::default();
        }

        if let Ok(value) = serde_json::from_str::<Value>(content) {
            return Self::from_value(&value);
        }

        let repaired = FILE_TYPES_REPAIR.replace_all(content, r#""file_types": {}"#);
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            log::debug!("Progress record recovered after repairing file_types");
            return Self::from_value(&value);
        }

        log::debug!("Progress record malformed, extracting fields individually");
        Self::extract_fields(content)
    }

    /// Zeroed record written when the operator cancels a transfer
    pub fn cancelled() -> Self {
        Self {
            message: "Transfer cancelled by user".to_string(),
            status: "cancelled".to_string(),
            ..Self::default()
        }
    }

    /// Serialize in the shape the transfer script writes
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Speed text, or `None` when the script has not measured one yet
    pub fn speed_text(&self) -> Option<&str> {
        match self.speed.trim() {
            "" | "--" => None,
            speed => Some(speed),
        }
    }

    /// Up to `limit` file-type counts as `"jpg: 12 | mp4: 3"`
    pub fn file_types_summary(&self, limit: usize) -> String {
        self.file_types
            .iter()
            .take(limit)
            .map(|(kind, count)| format!("{kind}: {count}"))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    fn from_value(value: &Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };

        let file_types = map
            .get("file_types")
            .and_then(Value::as_object)
            .map(|types| {
                types
                    .iter()
                    .filter_map(|(kind, count)| lenient_u64(count).map(|c| (kind.clone(), c)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            percent: map.get("percent").and_then(lenient_u64).map(clamp_percent).unwrap_or(0),
            message: lenient_string(map.get("message")),
            current_file: lenient_string(map.get("current_file")),
            files_done: map.get("files_done").and_then(lenient_u64).unwrap_or(0),
            files_total: map.get("files_total").and_then(lenient_u64).unwrap_or(0),
            file_types,
            speed: lenient_string(map.get("speed")),
            eta: lenient_string(map.get("eta")),
            existing_files: map.get("existing_files").and_then(lenient_u64).unwrap_or(0),
            status: lenient_string(map.get("status")),
        }
    }

    fn extract_fields(content: &str) -> Self {
        let mut numbers: BTreeMap<&str, u64> = BTreeMap::new();
        for caps in NUMBER_FIELD.captures_iter(content) {
            let (Some(key), Some(raw)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            if let Ok(number) = raw.as_str().parse::<f64>() {
                numbers
                    .entry(key.as_str())
                    .or_insert_with(|| number.max(0.0).round() as u64);
            }
        }

        let mut strings: BTreeMap<&str, String> = BTreeMap::new();
        for caps in STRING_FIELD.captures_iter(content) {
            let (Some(key), Some(raw)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            strings
                .entry(key.as_str())
                .or_insert_with(|| unescape(raw.as_str()));
        }

        Self {
            percent: numbers.get("percent").copied().map(clamp_percent).unwrap_or(0),
            message: strings.remove("message").unwrap_or_default(),
            current_file: strings.remove("current_file").unwrap_or_default(),
            files_done: numbers.get("files_done").copied().unwrap_or(0),
            files_total: numbers.get("files_total").copied().unwrap_or(0),
            file_types: BTreeMap::new(),
            speed: strings.remove("speed").unwrap_or_default(),
            eta: strings.remove("eta").unwrap_or_default(),
            existing_files: numbers.get("existing_files").copied().unwrap_or(0),
            status: strings
                .remove("status")
                .unwrap_or_else(|| FALLBACK_STATUS.to_string()),
        }
    }
}

fn clamp_percent(value: u64) -> u8 {
    value.min(100) as u8
}

/// Accept integers, floats, and numeric strings
fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0).round() as u64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.max(0.0).round() as u64),
        _ => None,
    }
}

fn lenient_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Decode JSON string escapes in a captured fragment, keeping the raw text on failure
fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{raw}\"")).unwrap_or_else(|_| raw.to_string())
}
