//! Metric key normalization and value coercion shared by both wire formats.
//!
//! Nodes may report metrics under compact codes (`t`, `p`, `ia`, ...) to fit
//! within a single notification. Everything that reaches session state goes
//! through [`normalize_metric_key`] first, so internal maps are always keyed by
//! the long canonical names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Policy for metric keys that are not in [`KNOWN_METRICS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    /// Drop any metric key outside the known set.
    Strict,
    /// Pass unknown (but well-formed) keys through verbatim.
    #[default]
    Permissive,
}

/// Canonical metric keys understood without a device-supplied profile.
pub const KNOWN_METRICS: &[&str] = &[
    "temperature",
    "pressure",
    "humidity",
    "generic",
    "iaq",
    "iaq_accuracy",
    "co2_equivalent",
    "breath_voc",
];

/// Top-level wire keys that never describe an ad-hoc metric.
const RESERVED_KEYS: &[&str] = &[
    "sensor",
    "type",
    "s",
    "id",
    "name",
    "addr",
    "i2c",
    "ack",
    "status",
    "message",
    "msg",
    "metrics",
    "m",
    "values",
    "data",
    "profiles",
    "profile",
    "profil",
    "metricprofiles",
    "metric_profiles",
    "ranges",
    "range",
    "csv",
    "flash_csv",
    "flashcsv",
    "csv_chunk",
    "csv_block",
    "config",
    "settings",
    "cfg",
    "frequency",
    "freq",
    "interval",
    "period",
    "store_flash",
    "storeflash",
    "save",
    "flash",
    "fs",
    "filesystem",
    "onewire",
    "analog",
    "digital",
    "button",
    "button_pin",
    "neopixel",
    "neopixel_pin",
    "neo",
    "ts",
    "timestamp",
    "action",
    "seq",
    "temp",
    "press",
    "value",
];

/// Returns true when `key` (already normalized) must not become a metric.
pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key) || key.starts_with("flash_") || key.starts_with("fs_")
}

/// Lower-case and trim a raw key; `None` if empty or containing characters
/// outside `[a-z0-9_.-]`.
pub fn normalize_key(raw: &str) -> Option<String> {
    let key = raw.trim().to_ascii_lowercase();
    if key.is_empty() {
        return None;
    }
    let valid = key
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Some(key)
    } else {
        None
    }
}

/// Primary channel reported under the compact `g` code for a given sensor.
fn primary_channel(sensor_hint: Option<&str>) -> &'static str {
    match sensor_hint.map(|s| s.trim().to_ascii_lowercase()) {
        Some(s) if s.starts_with("bme68") => "iaq",
        Some(s) if s == "onewire" || s.starts_with("ds18b20") => "temperature",
        _ => "generic",
    }
}

/// Expand compact codes into canonical metric names.
pub fn expand_alias(key: &str, sensor_hint: Option<&str>) -> String {
    match key {
        "g" => primary_channel(sensor_hint).to_string(),
        "t" => "temperature".to_string(),
        "p" => "pressure".to_string(),
        "h" => "humidity".to_string(),
        "ia" => "iaq_accuracy".to_string(),
        "co2" => "co2_equivalent".to_string(),
        "voc" => "breath_voc".to_string(),
        other => other.to_string(),
    }
}

/// Full metric-key pipeline: validate, expand aliases, apply the policy.
pub fn normalize_metric_key(
    raw: &str,
    sensor_hint: Option<&str>,
    policy: KeyPolicy,
) -> Option<String> {
    let key = expand_alias(&normalize_key(raw)?, sensor_hint);
    match policy {
        KeyPolicy::Strict if !KNOWN_METRICS.contains(&key.as_str()) => None,
        _ => Some(key),
    }
}

/// Parse a textual number, accepting only finite results.
pub fn number_from_str(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Coerce a JSON value to a finite number (numbers and numeric strings).
pub fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => number_from_str(s),
        _ => None,
    }
}

/// Coerce text to a boolean; unknown spellings yield `None`.
pub fn bool_from_str(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn bool_from_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Some(true),
            Some(v) if v == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => bool_from_str(s),
        _ => None,
    }
}

/// Render a scalar JSON value as text (`null`, arrays and objects yield `None`).
pub fn text_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Trim and cap a free-form text field at `max_chars` characters.
pub fn clip_text(raw: &str, max_chars: usize) -> String {
    raw.trim().chars().take(max_chars).collect()
}

/// Pin numbers: integers select a pin, `auto` / empty / negative mean automatic.
pub fn pin_from_str(raw: &str) -> Option<Option<i32>> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() || trimmed == "auto" {
        return Some(None);
    }
    let parsed = trimmed.parse::<i32>().ok()?;
    Some(if parsed < 0 { None } else { Some(parsed) })
}

pub fn pin_from_value(value: &Value) -> Option<Option<i32>> {
    match value {
        Value::Null => Some(None),
        Value::Number(n) => {
            let v = n.as_i64()?;
            if v < 0 {
                Some(None)
            } else {
                i32::try_from(v).ok().map(Some)
            }
        }
        Value::String(s) => pin_from_str(s),
        _ => None,
    }
}
