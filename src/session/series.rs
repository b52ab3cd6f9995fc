//! Metric series, display profiles and sample timestamps.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::protocol::keys::clip_text;
use crate::protocol::ProfileUpdate;

/// Ring capacity for live metric series.
pub const LIVE_CAPACITY: usize = 120;
/// Ring capacity for series fed by the history stream.
pub const HISTORY_CAPACITY: usize = 800;

const MAX_LABEL_CHARS: usize = 50;
const MAX_UNIT_CHARS: usize = 12;

/// Display profile used for gauge scaling. `min < max` always holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub label: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,
}

impl Profile {
    fn new(label: &str, unit: &str, min: f64, max: f64) -> Self {
        Self {
            label: label.to_string(),
            unit: unit.to_string(),
            min,
            max,
        }
    }

    /// Built-in profile for a metric key; unknown keys get a generic 0..100
    /// profile labelled with the key itself.
    pub fn base_for(key: &str) -> Self {
        match key {
            "temperature" => Self::new("Temperature", "°C", -10.0, 50.0),
            "pressure" => Self::new("Pressure", "hPa", 900.0, 1100.0),
            "humidity" => Self::new("Humidity", "%", 0.0, 100.0),
            "generic" => Self::new("Value", "", 0.0, 100.0),
            "iaq" => Self::new("Air quality (IAQ)", "", 0.0, 500.0),
            "iaq_accuracy" => Self::new("IAQ accuracy", "", 0.0, 3.0),
            "co2_equivalent" => Self::new("CO2 equivalent", "ppm", 400.0, 5000.0),
            "breath_voc" => Self::new("Breath VOC", "ppm", 0.0, 50.0),
            other => Self::new(other, "", 0.0, 100.0),
        }
    }

    /// Apply a partial update. Returns the new profile, or an error message
    /// when the resulting range would be empty or inverted.
    pub fn updated(&self, update: &ProfileUpdate, key: &str) -> Result<Profile, String> {
        let mut next = self.clone();
        if let Some(label) = &update.label {
            let label = clip_text(label, MAX_LABEL_CHARS);
            if !label.is_empty() {
                next.label = label;
            }
        }
        if let Some(unit) = &update.unit {
            next.unit = clip_text(unit, MAX_UNIT_CHARS);
        }
        if let Some(min) = update.min {
            next.min = min;
        }
        if let Some(max) = update.max {
            next.max = max;
        }
        if next.min >= next.max {
            return Err(format!(
                "invalid range for {} (min {} >= max {})",
                key, next.min, next.max
            ));
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// Bounded FIFO of samples for one metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSeries {
    pub key: String,
    pub profile: Profile,
    pub latest: Option<f64>,
    #[serde(skip)]
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl MetricSeries {
    pub fn new(key: &str, profile: Profile, capacity: usize) -> Self {
        Self {
            key: key.to_string(),
            profile,
            latest: None,
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.min(HISTORY_CAPACITY)),
        }
    }

    /// Record a sample, evicting the oldest ones past capacity.
    pub fn push(&mut self, sample: Sample) {
        self.latest = Some(sample.value);
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Parse node timestamps: `YYYY-MM-DD HH:MM:SS`, the firmware log format
/// `DD/MM/YY HH:MM:SS`, ISO-8601 / RFC 3339, or epoch seconds / milliseconds.
/// Naive times are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%d/%m/%y %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    let epoch = raw.parse::<i64>().ok()?;
    // Anything past ~1973 in milliseconds is larger than any plausible seconds value.
    if epoch.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}

/// Format used in exports and history output.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
