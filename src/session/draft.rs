//! User-editable configuration mirror.
//!
//! The draft follows device-reported configuration until the user edits it
//! (`touched`). From then on node reports no longer overwrite it, until the
//! draft is pushed successfully or cleared.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::protocol::keys::clip_text;
use crate::protocol::{ConfigDelta, PinRole};

/// Longest device name the firmware stores.
pub const MAX_NAME_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Ok,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftStatus {
    pub kind: StatusKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A single user edit.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftEdit {
    Name(String),
    Sensor(String),
    Pin(PinRole, Option<i32>),
    FrequencyMs(u32),
    StoreFlash(bool),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigDraft {
    pub name: Option<String>,
    pub sensor: Option<String>,
    pub pins: BTreeMap<PinRole, Option<i32>>,
    pub frequency_ms: Option<u32>,
    pub store_flash: Option<bool>,
    pub status: Option<DraftStatus>,
    pub touched: bool,
}

impl ConfigDraft {
    /// Copy device-reported values in, unless the user has local edits.
    pub fn mirror(&mut self, live: &ConfigDelta) -> bool {
        if self.touched {
            return false;
        }
        if let Some(name) = &live.name {
            self.name = Some(name.clone());
        }
        if let Some(sensor) = &live.sensor {
            self.sensor = Some(sensor.clone());
        }
        if live.frequency_ms.is_some() {
            self.frequency_ms = live.frequency_ms;
        }
        if live.store_flash.is_some() {
            self.store_flash = live.store_flash;
        }
        for (role, pin) in &live.pins {
            self.pins.insert(*role, *pin);
        }
        true
    }

    pub fn apply(&mut self, edit: DraftEdit) {
        match edit {
            DraftEdit::Name(name) => self.name = Some(name),
            DraftEdit::Sensor(sensor) => self.sensor = Some(sensor),
            DraftEdit::Pin(role, pin) => {
                self.pins.insert(role, pin);
            }
            DraftEdit::FrequencyMs(ms) => self.frequency_ms = Some(ms),
            DraftEdit::StoreFlash(flag) => self.store_flash = Some(flag),
        }
        self.touched = true;
    }

    /// Discard local edits and re-mirror `live`.
    pub fn reset_to(&mut self, live: &ConfigDelta) {
        let status = self.status.take();
        *self = ConfigDraft {
            status,
            ..Default::default()
        };
        self.mirror(live);
    }

    pub fn set_status(&mut self, kind: StatusKind, message: impl Into<String>) {
        self.status = Some(DraftStatus {
            kind,
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Build the configuration push. Pins are grouped the way nodes expect
    /// (`i2c{sda,scl}`, `<group>{pin}`); auto pins are sent as `-1`. Returns
    /// `None` when nothing valid remains.
    pub fn build_payload(&self) -> Option<Map<String, Value>> {
        let mut payload = Map::new();
        if let Some(name) = &self.name {
            let name = clip_text(name, MAX_NAME_CHARS);
            if !name.is_empty() {
                payload.insert("name".into(), Value::String(name));
            }
        }
        if let Some(sensor) = self.sensor.as_deref().map(str::trim) {
            if !sensor.is_empty() {
                payload.insert("sensor".into(), Value::String(sensor.to_ascii_lowercase()));
            }
        }
        if let Some(ms) = self.frequency_ms.filter(|ms| *ms > 0) {
            payload.insert("frequency".into(), Value::from(ms));
        }
        if let Some(flag) = self.store_flash {
            payload.insert("store_flash".into(), Value::Bool(flag));
        }
        for (role, pin) in &self.pins {
            let group = payload
                .entry(role.group())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(fields) = group {
                fields.insert(role.field().into(), Value::from(pin.unwrap_or(-1)));
            }
        }
        if payload.is_empty() {
            None
        } else {
            Some(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn touched_draft_ignores_device_reports() {
        let mut draft = ConfigDraft::default();
        let live = ConfigDelta {
            name: Some("greenhouse".into()),
            ..Default::default()
        };
        assert!(draft.mirror(&live));
        draft.apply(DraftEdit::Name("shed".into()));
        assert!(!draft.mirror(&live));
        assert_eq!(draft.name.as_deref(), Some("shed"));
        draft.reset_to(&live);
        assert!(!draft.touched);
        assert_eq!(draft.name.as_deref(), Some("greenhouse"));
    }

    #[test]
    fn payload_groups_pins_and_clips_name() {
        let mut draft = ConfigDraft::default();
        draft.apply(DraftEdit::Name("x".repeat(40)));
        draft.apply(DraftEdit::Pin(PinRole::I2cSda, Some(21)));
        draft.apply(DraftEdit::Pin(PinRole::I2cScl, Some(22)));
        draft.apply(DraftEdit::Pin(PinRole::OneWire, None));
        draft.apply(DraftEdit::FrequencyMs(5000));
        let payload = Value::Object(draft.build_payload().unwrap());
        assert_eq!(payload["name"].as_str().unwrap().len(), MAX_NAME_CHARS);
        assert_eq!(payload["i2c"], json!({"sda": 21, "scl": 22}));
        assert_eq!(payload["onewire"], json!({"pin": -1}));
        assert_eq!(payload["frequency"], 5000);
    }

    #[test]
    fn empty_draft_has_nothing_to_send() {
        let mut draft = ConfigDraft::default();
        draft.apply(DraftEdit::Name("   ".into()));
        assert!(draft.build_payload().is_none());
    }
}
