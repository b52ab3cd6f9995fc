//! Strongly-typed records produced by the payload parser.
//!
//! The wire protocol is permissive (aliases, optional fields, two encodings);
//! these types are what the rest of the engine sees after normalization.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bulk-transfer sub-protocol a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentMode {
    /// `csv_chunk`: fragments stored by sequence and concatenated on completion.
    Indexed,
    /// `csv_block`: newline-delimited records drained at a fixed rate.
    Lines,
}

/// One piece of a bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub mode: FragmentMode,
    pub seq: u32,
    pub transfer_id: Option<String>,
    /// Declared total payload size in bytes (indexed mode only).
    pub total: Option<u64>,
    pub last: bool,
    pub data: String,
}

/// Role a configurable GPIO plays on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinRole {
    I2cSda,
    I2cScl,
    OneWire,
    Analog,
    Digital,
    Button,
    Neopixel,
}

impl PinRole {
    /// Wire group carrying this role (`i2c` for both bus pins).
    pub fn group(self) -> &'static str {
        match self {
            PinRole::I2cSda | PinRole::I2cScl => "i2c",
            PinRole::OneWire => "onewire",
            PinRole::Analog => "analog",
            PinRole::Digital => "digital",
            PinRole::Button => "button",
            PinRole::Neopixel => "neopixel",
        }
    }

    /// Field name inside the wire group.
    pub fn field(self) -> &'static str {
        match self {
            PinRole::I2cSda => "sda",
            PinRole::I2cScl => "scl",
            _ => "pin",
        }
    }
}

/// Partial device configuration reported by (or sent to) a node.
///
/// Pin entries map to `None` when the node selects the pin automatically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDelta {
    pub name: Option<String>,
    pub sensor: Option<String>,
    pub frequency_ms: Option<u32>,
    pub store_flash: Option<bool>,
    pub pins: BTreeMap<PinRole, Option<i32>>,
}

impl ConfigDelta {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.sensor.is_none()
            && self.frequency_ms.is_none()
            && self.store_flash.is_none()
            && self.pins.is_empty()
    }

    /// Overlay `other` on top of `self`; absent fields keep their value.
    pub fn merge(&mut self, other: &ConfigDelta) {
        if let Some(name) = &other.name {
            self.name = Some(name.clone());
        }
        if let Some(sensor) = &other.sensor {
            self.sensor = Some(sensor.clone());
        }
        if other.frequency_ms.is_some() {
            self.frequency_ms = other.frequency_ms;
        }
        if other.store_flash.is_some() {
            self.store_flash = other.store_flash;
        }
        for (role, pin) in &other.pins {
            self.pins.insert(*role, *pin);
        }
    }
}

/// Flash / filesystem usage reported by a node. Every field is optional and
/// merged field by field, since nodes report partial snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashStatus {
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub free: Option<u64>,
    pub percent_used: Option<u64>,
    pub log_bytes: Option<u64>,
    pub est_samples: Option<u64>,
    pub est_seconds: Option<u64>,
}

impl FlashStatus {
    pub fn is_empty(&self) -> bool {
        *self == FlashStatus::default()
    }

    pub fn merge(&mut self, other: &FlashStatus) {
        macro_rules! take {
            ($($field:ident),*) => {
                $( if other.$field.is_some() { self.$field = other.$field; } )*
            };
        }
        take!(total, used, free, percent_used, log_bytes, est_samples, est_seconds);
    }

    /// Set a field by its wire alias. Returns false for unknown aliases.
    pub fn set_by_alias(&mut self, alias: &str, value: u64) -> bool {
        let slot = match alias {
            "total" | "size" | "capacity" => &mut self.total,
            "used" | "use" => &mut self.used,
            "free" => &mut self.free,
            "percent_used" | "percent" | "usage" => &mut self.percent_used,
            "log_bytes" | "log" => &mut self.log_bytes,
            "est_samples" | "samples" => &mut self.est_samples,
            "est_seconds" | "seconds" => &mut self.est_seconds,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// Partial display profile update for one metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    pub label: Option<String>,
    pub unit: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Everything one logical message may carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    pub sensor: Option<String>,
    pub address: Option<String>,
    pub name: Option<String>,
    pub ack: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    /// Complete bulk payload delivered inline (`csv`).
    pub csv: Option<String>,
    pub fragment: Option<Fragment>,
    pub config: Option<ConfigDelta>,
    pub flash: Option<FlashStatus>,
    pub timestamp: Option<String>,
    /// Wire order, which is display order.
    pub metrics: IndexMap<String, f64>,
    pub profiles: IndexMap<String, ProfileUpdate>,
    /// True when `profiles` came from a full profile container, which defines
    /// the node's complete active metric set.
    pub profile_set: bool,
}

impl ParsedMessage {
    /// Structural messages rebuild configuration-facing views; pure metric
    /// ticks must not.
    pub fn is_structural(&self) -> bool {
        self.name.is_some()
            || self.ack.is_some()
            || self.sensor.is_some()
            || self.address.is_some()
            || self.csv.is_some()
            || self.fragment.is_some()
            || self.config.is_some()
            || self.flash.is_some()
            || self.profile_set
    }

    pub fn is_empty(&self) -> bool {
        !self.is_structural()
            && self.status.is_none()
            && self.message.is_none()
            && self.timestamp.is_none()
            && self.metrics.is_empty()
            && self.profiles.is_empty()
    }
}
