//! Outbound requests written to a node's configuration characteristic.
//!
//! Every request is a single JSON object. Action requests carry an `action`
//! field; configuration pushes are plain field objects.

use serde_json::{json, Map, Value};

/// A request the controller can send to a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ConfigGet,
    FlashStatus,
    FlashExport,
    FlashStream,
    FlashStreamStop,
    CsvAck { id: Option<String>, seq: u32 },
    TimeSync { epoch_ms: i64, tz_offset_min: i32 },
    PushConfig(Map<String, Value>),
    StoreFlash(bool),
}

/// Coarse classification used to route write outcomes back to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ConfigGet,
    FlashStatus,
    FlashExport,
    FlashStream,
    FlashStreamStop,
    CsvAck,
    TimeSync,
    PushConfig,
    StoreFlash,
}

impl ActionKind {
    /// Wire name, also used as the ack tag a node answers with.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::ConfigGet => "config_get",
            ActionKind::FlashStatus => "flash_status",
            ActionKind::FlashExport => "flash_export",
            ActionKind::FlashStream => "flash_stream",
            ActionKind::FlashStreamStop => "flash_stream_stop",
            ActionKind::CsvAck => "csv_ack",
            ActionKind::TimeSync => "time_sync",
            ActionKind::PushConfig => "config",
            ActionKind::StoreFlash => "store_flash",
        }
    }

    /// Protocol-driven writes are not reported on the draft status.
    pub fn is_user_initiated(self) -> bool {
        !matches!(self, ActionKind::CsvAck)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::ConfigGet => ActionKind::ConfigGet,
            Action::FlashStatus => ActionKind::FlashStatus,
            Action::FlashExport => ActionKind::FlashExport,
            Action::FlashStream => ActionKind::FlashStream,
            Action::FlashStreamStop => ActionKind::FlashStreamStop,
            Action::CsvAck { .. } => ActionKind::CsvAck,
            Action::TimeSync { .. } => ActionKind::TimeSync,
            Action::PushConfig(_) => ActionKind::PushConfig,
            Action::StoreFlash(_) => ActionKind::StoreFlash,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Action::ConfigGet
            | Action::FlashStatus
            | Action::FlashStream
            | Action::FlashStreamStop => json!({ "action": self.kind().as_str() }),
            Action::FlashExport => json!({ "action": "flash_export", "format": "csv" }),
            Action::CsvAck { id, seq } => {
                // Nodes number transfers; keep the id numeric when it is one.
                let id = match id {
                    Some(raw) => raw
                        .parse::<u64>()
                        .map(Value::from)
                        .unwrap_or_else(|_| Value::String(raw.clone())),
                    None => Value::Null,
                };
                json!({ "action": "csv_ack", "id": id, "seq": seq })
            }
            Action::TimeSync {
                epoch_ms,
                tz_offset_min,
            } => json!({
                "action": "time_sync",
                "epoch_ms": epoch_ms,
                "tz_offset_min": tz_offset_min,
            }),
            Action::PushConfig(fields) => Value::Object(fields.clone()),
            Action::StoreFlash(flag) => json!({ "store_flash": flag }),
        }
    }

    /// Bytes handed to the transport.
    pub fn encode(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_request_names_format() {
        let v = Action::FlashExport.to_json();
        assert_eq!(v["action"], "flash_export");
        assert_eq!(v["format"], "csv");
    }

    #[test]
    fn csv_ack_keeps_numeric_ids_numeric() {
        let v = Action::CsvAck {
            id: Some("12".into()),
            seq: 4,
        }
        .to_json();
        assert_eq!(v, json!({"action":"csv_ack","id":12,"seq":4}));
        let v = Action::CsvAck {
            id: Some("x1".into()),
            seq: 0,
        }
        .to_json();
        assert_eq!(v["id"], "x1");
    }

    #[test]
    fn store_flash_toggle_is_not_an_action() {
        let bytes = Action::StoreFlash(true).encode();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"store_flash":true}"#);
    }
}
