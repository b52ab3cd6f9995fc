//! Tolerant payload parser for node messages.
//!
//! Two encodings are accepted:
//!
//! * JSON objects, e.g. `{"m":{"t":21.4,"h":40},"ts":"2024-01-01 10:00:00"}`
//! * legacy `key=value` / `key:value` pairs separated by `;`, `,` or newlines,
//!   e.g. `sensor=bmp280;t=21.4;profile.t.max=60`
//!
//! A malformed JSON object is never an error: the text is re-read with the
//! line parser, which always yields a (possibly empty) [`ParsedMessage`].

use log::trace;
use serde_json::{Map, Value};

use super::keys::{
    bool_from_str, bool_from_value, expand_alias, is_reserved, normalize_key,
    normalize_metric_key, number_from_str, number_from_value, pin_from_str, pin_from_value,
    text_from_value, KeyPolicy,
};
use super::message::{
    ConfigDelta, FlashStatus, Fragment, FragmentMode, ParsedMessage, PinRole, ProfileUpdate,
};
use crate::logutil::escape_log;

const SENSOR_KEYS: &[&str] = &["sensor", "type", "s"];
const ADDRESS_KEYS: &[&str] = &["addr", "i2c"];
const MESSAGE_KEYS: &[&str] = &["message", "msg"];
const METRIC_CONTAINERS: &[&str] = &["metrics", "m", "values", "data"];
const PROFILE_CONTAINERS: &[&str] = &["profiles", "profile", "metricProfiles", "metric_profiles"];
const RANGE_CONTAINERS: &[&str] = &["ranges", "range"];
const CSV_KEYS: &[&str] = &["csv", "flash_csv", "flashCsv"];
const CONFIG_CONTAINERS: &[&str] = &["config", "settings", "cfg"];
const FLASH_CONTAINERS: &[&str] = &["flash", "fs", "filesystem"];
const TIMESTAMP_KEYS: &[&str] = &["ts", "timestamp"];
const FREQUENCY_KEYS: &[&str] = &["frequency", "freq", "interval", "period"];
const STORE_FLASH_KEYS: &[&str] = &["store_flash", "storeFlash", "save", "flash"];
const BUTTON_KEYS: &[&str] = &["button", "button_pin"];
const NEOPIXEL_KEYS: &[&str] = &["neopixel", "neopixel_pin", "neo"];

/// Pure parser; the only state is the configured key policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadParser {
    policy: KeyPolicy,
}

impl PayloadParser {
    pub fn new(policy: KeyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    /// Parse one decoded message. `sensor_hint` is the sensor last reported by
    /// the node and only affects the `g` alias when the message names none.
    pub fn parse(&self, text: &str, sensor_hint: Option<&str>) -> ParsedMessage {
        let text = text.trim();
        if text.is_empty() {
            return ParsedMessage::default();
        }
        if text.starts_with('{') {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(obj)) => return self.parse_object(&obj, sensor_hint),
                Ok(_) => {}
                Err(e) => trace!(
                    "json parse failed ({}), falling back to line parser: {}",
                    e,
                    escape_log(text)
                ),
            }
        }
        self.parse_lines(text, sensor_hint)
    }

    fn parse_object(&self, obj: &Map<String, Value>, sensor_hint: Option<&str>) -> ParsedMessage {
        let mut out = ParsedMessage {
            sensor: first_text(obj, SENSOR_KEYS).map(|s| s.to_ascii_lowercase()),
            name: obj.get("name").and_then(text_from_value),
            ack: obj.get("ack").and_then(text_from_value).map(|s| s.to_ascii_lowercase()),
            status: obj
                .get("status")
                .and_then(text_from_value)
                .map(|s| s.to_ascii_lowercase()),
            message: first_text(obj, MESSAGE_KEYS),
            csv: CSV_KEYS
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(str::to_string),
            timestamp: first_text(obj, TIMESTAMP_KEYS),
            ..Default::default()
        };
        // `i2c` is an address when scalar and a pin group when an object.
        out.address = ADDRESS_KEYS
            .iter()
            .filter_map(|k| obj.get(*k))
            .find(|v| !v.is_object())
            .and_then(text_from_value);

        let sensor = out.sensor.clone();
        let hint = sensor.as_deref().or(sensor_hint);
        self.collect_json_metrics(obj, hint, &mut out);
        self.collect_json_profiles(obj, hint, &mut out);

        if let Some(v) = obj.get("csv_chunk") {
            out.fragment = fragment_from_value(v, FragmentMode::Indexed);
        }
        if out.fragment.is_none() {
            if let Some(v) = obj.get("csv_block") {
                out.fragment = fragment_from_value(v, FragmentMode::Lines);
            }
        }

        let mut flash = FlashStatus::default();
        let mut config = ConfigDelta::default();
        if let Some(Value::Object(cfg)) = CONFIG_CONTAINERS.iter().find_map(|k| obj.get(*k)) {
            config.name = cfg.get("name").and_then(text_from_value);
            config.sensor = first_text(cfg, SENSOR_KEYS).map(|s| s.to_ascii_lowercase());
            collect_config_fields(cfg, &mut config, &mut flash);
        }
        collect_config_fields(obj, &mut config, &mut flash);
        for (raw, value) in obj {
            let lower = raw.to_ascii_lowercase();
            let field = lower
                .strip_prefix("flash_")
                .or_else(|| lower.strip_prefix("fs_"));
            if let (Some(field), Some(n)) = (field, number_from_value(value)) {
                if n >= 0.0 {
                    flash.set_by_alias(field, n.round() as u64);
                }
            }
        }
        if !config.is_empty() {
            out.config = Some(config);
        }
        if !flash.is_empty() {
            out.flash = Some(flash);
        }
        out
    }

    fn collect_json_metrics(
        &self,
        obj: &Map<String, Value>,
        hint: Option<&str>,
        out: &mut ParsedMessage,
    ) {
        let container = METRIC_CONTAINERS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_object));
        if let Some(source) = container {
            for (raw, value) in source {
                let (Some(key), Some(num)) = (
                    normalize_metric_key(raw, hint, self.policy),
                    number_from_value(value),
                ) else {
                    continue;
                };
                out.metrics.insert(key, num);
            }
            return;
        }

        for (raw, value) in obj {
            let direct = match raw.as_str() {
                "temperature" | "temp" => Some("temperature".to_string()),
                "pressure" | "press" => Some("pressure".to_string()),
                "humidity" => Some("humidity".to_string()),
                "value" => Some(expand_alias("g", hint)),
                _ => None,
            };
            if let Some(canonical) = direct {
                if let Some(num) = number_from_value(value) {
                    out.metrics.insert(canonical, num);
                }
                continue;
            }
            if self.policy != KeyPolicy::Permissive {
                continue;
            }
            let Some(key) = normalize_key(raw) else { continue };
            if is_reserved(&key) || value.is_boolean() {
                continue;
            }
            let Some(num) = number_from_value(value) else { continue };
            out.metrics.entry(expand_alias(&key, hint)).or_insert(num);
        }
    }

    fn collect_json_profiles(
        &self,
        obj: &Map<String, Value>,
        hint: Option<&str>,
        out: &mut ParsedMessage,
    ) {
        if let Some(source) = PROFILE_CONTAINERS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_object))
        {
            for (raw, value) in source {
                let (Some(key), Some(fields)) =
                    (normalize_metric_key(raw, hint, self.policy), value.as_object())
                else {
                    continue;
                };
                let update = out.profiles.entry(key).or_default();
                if let Some(label) = fields.get("label").and_then(text_from_value) {
                    update.label = Some(label);
                }
                if let Some(unit) = fields.get("unit").and_then(text_from_value) {
                    update.unit = Some(unit);
                }
                if let Some(min) = fields.get("min").and_then(number_from_value) {
                    update.min = Some(min);
                }
                if let Some(max) = fields.get("max").and_then(number_from_value) {
                    update.max = Some(max);
                }
            }
            out.profile_set = !out.profiles.is_empty();
        }

        if let Some(source) = RANGE_CONTAINERS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_object))
        {
            for (raw, value) in source {
                let Some(key) = normalize_metric_key(raw, hint, self.policy) else {
                    continue;
                };
                let (min, max) = match value {
                    Value::Array(items) if items.len() >= 2 => {
                        (number_from_value(&items[0]), number_from_value(&items[1]))
                    }
                    Value::Object(fields) => (
                        fields.get("min").and_then(number_from_value),
                        fields.get("max").and_then(number_from_value),
                    ),
                    _ => continue,
                };
                let update = out.profiles.entry(key).or_default();
                if min.is_some() {
                    update.min = min;
                }
                if max.is_some() {
                    update.max = max;
                }
            }
        }
    }

    fn parse_lines(&self, text: &str, sensor_hint: Option<&str>) -> ParsedMessage {
        let mut out = ParsedMessage::default();
        let mut config = ConfigDelta::default();
        let mut flash = FlashStatus::default();

        let pairs: Vec<(String, String)> = text
            .split(|c| c == ';' || c == ',' || c == '\n')
            .filter_map(split_pair)
            .collect();

        // The sensor decides how `g` expands, so resolve it before metrics.
        let hint = pairs
            .iter()
            .find(|(k, _)| matches!(k.as_str(), "sensor" | "type" | "id" | "s"))
            .map(|(_, v)| v.to_ascii_lowercase());
        let hint = hint.as_deref().or(sensor_hint);

        for (key, value) in pairs {
            match key.as_str() {
                "sensor" | "type" | "id" | "s" => out.sensor = Some(value.to_ascii_lowercase()),
                "name" => out.name = Some(value),
                "addr" | "i2c" => out.address = Some(value.to_ascii_lowercase()),
                "ack" => out.ack = Some(value.to_ascii_lowercase()),
                "status" => out.status = Some(value.to_ascii_lowercase()),
                "message" | "msg" => out.message = Some(value),
                "csv" | "flash_csv" | "flashcsv" => out.csv = Some(value),
                "ts" | "timestamp" => out.timestamp = Some(value),
                "frequency" | "freq" | "interval" | "period" => {
                    if let Some(ms) = number_from_str(&value).and_then(frequency_ms) {
                        config.frequency_ms = Some(ms);
                    }
                }
                "store_flash" | "storeflash" | "save" | "flash" => {
                    if let Some(flag) = bool_from_str(&value) {
                        config.store_flash = Some(flag);
                    }
                }
                _ => {
                    if let Some(role) = pin_role_for_line_key(&key) {
                        if let Some(pin) = pin_from_str(&value) {
                            config.pins.insert(role, pin);
                        }
                    } else if let Some(field) = flash_field_for_line_key(&key) {
                        if let Some(n) = number_from_str(&value).filter(|n| *n >= 0.0) {
                            flash.set_by_alias(field, n.round() as u64);
                        }
                    } else if let Some((metric, field)) = profile_target(&key) {
                        self.apply_line_profile(&mut out, metric, field, &value, hint);
                    } else {
                        self.apply_line_metric(&mut out, &key, &value, hint);
                    }
                }
            }
        }

        if !config.is_empty() {
            out.config = Some(config);
        }
        if !flash.is_empty() {
            out.flash = Some(flash);
        }
        out
    }

    fn apply_line_profile(
        &self,
        out: &mut ParsedMessage,
        metric: &str,
        field: &str,
        value: &str,
        hint: Option<&str>,
    ) {
        let Some(key) = normalize_metric_key(metric, hint, self.policy) else {
            return;
        };
        let update = out.profiles.entry(key).or_default();
        match field {
            "label" => update.label = Some(value.to_string()),
            "unit" => update.unit = Some(value.to_string()),
            "min" => update.min = number_from_str(value).or(update.min),
            "max" => update.max = number_from_str(value).or(update.max),
            _ => {}
        }
    }

    fn apply_line_metric(&self, out: &mut ParsedMessage, key: &str, value: &str, hint: Option<&str>) {
        let bare = ["metric.", "metrics.", "value.", "values.", "data.", "m."]
            .iter()
            .find_map(|prefix| key.strip_prefix(prefix))
            .unwrap_or(key);
        let canonical = match bare {
            "temp" => Some("temperature".to_string()),
            "press" => Some("pressure".to_string()),
            "value" => Some(expand_alias("g", hint)),
            other if is_reserved(other) => None,
            other => normalize_metric_key(other, hint, self.policy),
        };
        if let (Some(canonical), Some(num)) = (canonical, number_from_str(value)) {
            out.metrics.insert(canonical, num);
        }
    }
}

fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(text_from_value)
        .filter(|s| !s.trim().is_empty())
}

/// Split a `key=value` / `key:value` candidate. Keys may be quoted and must
/// match `[a-z0-9_.-]+` (case-insensitive); values may be quoted.
fn split_pair(part: &str) -> Option<(String, String)> {
    let part = part.trim();
    let sep = part.find(|c| c == '=' || c == ':')?;
    let key = part[..sep].trim().trim_matches('"');
    let value = part[sep + 1..].trim().trim_matches('"').trim();
    if value.is_empty() || value.contains('"') {
        return None;
    }
    let key = normalize_key(key)?;
    Some((key, value.to_string()))
}

fn frequency_ms(raw: f64) -> Option<u32> {
    if raw > 0.0 && raw <= u32::MAX as f64 {
        Some(raw.round() as u32)
    } else {
        None
    }
}

fn pin_role_for_line_key(key: &str) -> Option<PinRole> {
    let role = match key {
        "i2c.sda" | "sda" => PinRole::I2cSda,
        "i2c.scl" | "scl" => PinRole::I2cScl,
        "onewire" | "onewire.pin" => PinRole::OneWire,
        "analog" | "analog.pin" => PinRole::Analog,
        "digital" | "digital.pin" => PinRole::Digital,
        "button" | "button.pin" | "button_pin" => PinRole::Button,
        "neopixel" | "neopixel.pin" | "neopixel_pin" | "neo" | "neo.pin" => PinRole::Neopixel,
        _ => return None,
    };
    Some(role)
}

fn flash_field_for_line_key(key: &str) -> Option<&str> {
    ["flash.", "fs.", "filesystem.", "flash_", "fs_"]
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix))
        .filter(|field| FlashStatus::default().set_by_alias(field, 0))
}

/// `profile.<metric>.<field>` (also `profil`, `range`, `ranges` prefixes).
fn profile_target(key: &str) -> Option<(&str, &str)> {
    let (prefix, rest) = key.split_once('.')?;
    if !matches!(prefix, "profile" | "profil" | "range" | "ranges") {
        return None;
    }
    let (metric, field) = rest.rsplit_once('.')?;
    if metric.is_empty() || !matches!(field, "label" | "unit" | "min" | "max") {
        return None;
    }
    Some((metric, field))
}

fn fragment_from_value(value: &Value, mode: FragmentMode) -> Option<Fragment> {
    let obj = value.as_object()?;
    let seq = obj.get("seq").and_then(number_from_value)?;
    if seq < 0.0 || seq > u32::MAX as f64 || seq.fract() != 0.0 {
        return None;
    }
    let total = match mode {
        FragmentMode::Indexed => obj
            .get("total")
            .and_then(number_from_value)
            .filter(|t| *t >= 0.0)
            .map(|t| t as u64),
        FragmentMode::Lines => None,
    };
    Some(Fragment {
        mode,
        seq: seq as u32,
        transfer_id: obj.get("id").and_then(text_from_value),
        total,
        last: obj.get("last").and_then(bool_from_value).unwrap_or(false),
        data: obj
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Frequency, store-flash, pin groups and nested flash objects; shared by
/// the config container and the flattened top level.
fn collect_config_fields(obj: &Map<String, Value>, config: &mut ConfigDelta, flash: &mut FlashStatus) {
    if let Some(ms) = FREQUENCY_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(number_from_value))
        .and_then(frequency_ms)
    {
        config.frequency_ms = Some(ms);
    }
    // `flash` doubles as the store flag (scalar) and the status object.
    if let Some(flag) = STORE_FLASH_KEYS
        .iter()
        .filter_map(|k| obj.get(*k))
        .filter(|v| !v.is_object())
        .find_map(bool_from_value)
    {
        config.store_flash = Some(flag);
    }

    if let Some(Value::Object(i2c)) = obj.get("i2c") {
        for role in [PinRole::I2cSda, PinRole::I2cScl] {
            if let Some(pin) = i2c.get(role.field()).and_then(pin_from_value) {
                config.pins.insert(role, pin);
            }
        }
    }
    for (role, keys) in [
        (PinRole::OneWire, &["onewire"][..]),
        (PinRole::Analog, &["analog"][..]),
        (PinRole::Digital, &["digital"][..]),
        (PinRole::Button, BUTTON_KEYS),
        (PinRole::Neopixel, NEOPIXEL_KEYS),
    ] {
        let pin = keys.iter().filter_map(|k| obj.get(*k)).find_map(|v| match v {
            Value::Object(group) => group.get("pin").and_then(pin_from_value),
            other => pin_from_value(other),
        });
        if let Some(pin) = pin {
            config.pins.insert(role, pin);
        }
    }

    if let Some(Value::Object(fs)) = FLASH_CONTAINERS.iter().find_map(|k| obj.get(*k).filter(|v| v.is_object())) {
        for (raw, value) in fs {
            if let Some(n) = number_from_value(value).filter(|n| *n >= 0.0) {
                flash.set_by_alias(&raw.to_ascii_lowercase(), n.round() as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ParsedMessage {
        PayloadParser::new(KeyPolicy::Permissive).parse(text, None)
    }

    #[test]
    fn metrics_container_keys_are_normalized() {
        let msg = parse(r#"{"m":{"t":21.5,"H":40,"co2":612},"ts":"2024-01-01 10:00:00"}"#);
        assert_eq!(msg.metrics.get("temperature"), Some(&21.5));
        assert_eq!(msg.metrics.get("humidity"), Some(&40.0));
        assert_eq!(msg.metrics.get("co2_equivalent"), Some(&612.0));
        assert_eq!(msg.timestamp.as_deref(), Some("2024-01-01 10:00:00"));
        assert!(!msg.is_structural());
    }

    #[test]
    fn flat_well_known_fields_and_ad_hoc_metrics() {
        let msg = parse(r#"{"sensor":"BMP280","addr":"0x76","temp":20,"press":1001.2,"lux":12}"#);
        assert_eq!(msg.sensor.as_deref(), Some("bmp280"));
        assert_eq!(msg.address.as_deref(), Some("0x76"));
        assert_eq!(msg.metrics.get("temperature"), Some(&20.0));
        assert_eq!(msg.metrics.get("pressure"), Some(&1001.2));
        assert_eq!(msg.metrics.get("lux"), Some(&12.0));
        assert!(!msg.metrics.contains_key("temp"));
    }

    #[test]
    fn strict_policy_drops_ad_hoc_metrics() {
        let parser = PayloadParser::new(KeyPolicy::Strict);
        let msg = parser.parse(r#"{"temp":20,"lux":12}"#, None);
        assert_eq!(msg.metrics.len(), 1);
        let msg = parser.parse(r#"{"metrics":{"lux":1,"t":2}}"#, None);
        assert_eq!(msg.metrics.keys().collect::<Vec<_>>(), vec!["temperature"]);
    }

    #[test]
    fn generic_alias_uses_sensor_hint() {
        let parser = PayloadParser::default();
        let msg = parser.parse(r#"{"m":{"g":88}}"#, Some("bme680"));
        assert_eq!(msg.metrics.get("iaq"), Some(&88.0));
        let msg = parser.parse(r#"{"sensor":"analog","m":{"g":3}}"#, Some("bme680"));
        assert_eq!(msg.metrics.get("generic"), Some(&3.0));
    }

    #[test]
    fn malformed_json_falls_back_to_lines() {
        let msg = parse(r#"{"m":{"t":21"#);
        assert!(msg.metrics.is_empty());
        let msg = parse("{t=21.5;h=40");
        assert_eq!(msg.metrics.get("humidity"), Some(&40.0));
    }

    #[test]
    fn line_format_decision_table() {
        let msg = parse(
            "sensor=BME680;name=\"Kitchen\";i2c=0x77;ack=config;status=OK;msg=done;\
             freq=2000;save=yes;i2c.sda=8;neo=auto;flash.used=10;fs_free=90;\
             profile.t.max=60;profile.t.unit=C;g=12;bogus=abc",
        );
        assert_eq!(msg.sensor.as_deref(), Some("bme680"));
        assert_eq!(msg.name.as_deref(), Some("Kitchen"));
        assert_eq!(msg.address.as_deref(), Some("0x77"));
        assert_eq!(msg.ack.as_deref(), Some("config"));
        assert_eq!(msg.status.as_deref(), Some("ok"));
        assert_eq!(msg.message.as_deref(), Some("done"));
        let cfg = msg.config.expect("config delta");
        assert_eq!(cfg.frequency_ms, Some(2000));
        assert_eq!(cfg.store_flash, Some(true));
        assert_eq!(cfg.pins.get(&PinRole::I2cSda), Some(&Some(8)));
        assert_eq!(cfg.pins.get(&PinRole::Neopixel), Some(&None));
        let flash = msg.flash.expect("flash delta");
        assert_eq!(flash.used, Some(10));
        assert_eq!(flash.free, Some(90));
        let profile = msg.profiles.get("temperature").expect("profile");
        assert_eq!(profile.max, Some(60.0));
        assert_eq!(profile.unit.as_deref(), Some("C"));
        assert!(!msg.profile_set);
        assert_eq!(msg.metrics.get("iaq"), Some(&12.0));
        assert!(!msg.metrics.contains_key("bogus"));
    }

    #[test]
    fn unknown_boolean_does_not_set_store_flag() {
        let msg = parse("store_flash=perhaps;t=1");
        assert!(msg.config.is_none());
    }

    #[test]
    fn config_container_and_nested_flash() {
        let msg = parse(
            r#"{"config":{"name":"n1","sensor":"i2c","frequency":1000,"store_flash":true,
                "i2c":{"sda":8,"scl":9},"onewire":{"pin":4},"button":-1,
                "flash":{"total":1000,"used":250,"percent_used":25,"est_samples":40}}}"#,
        );
        let cfg = msg.config.expect("config");
        assert_eq!(cfg.name.as_deref(), Some("n1"));
        assert_eq!(cfg.sensor.as_deref(), Some("i2c"));
        assert_eq!(cfg.frequency_ms, Some(1000));
        assert_eq!(cfg.store_flash, Some(true));
        assert_eq!(cfg.pins.get(&PinRole::I2cScl), Some(&Some(9)));
        assert_eq!(cfg.pins.get(&PinRole::OneWire), Some(&Some(4)));
        assert_eq!(cfg.pins.get(&PinRole::Button), Some(&None));
        let flash = msg.flash.expect("flash");
        assert_eq!(flash.total, Some(1000));
        assert_eq!(flash.percent_used, Some(25));
        assert_eq!(flash.est_samples, Some(40));
        assert!(msg.metrics.is_empty());
    }

    #[test]
    fn profiles_and_ranges() {
        let msg = parse(
            r#"{"profiles":{"t":{"label":"Air","unit":"C","min":-20,"max":60}},
                "ranges":{"humidity":[10,90],"pressure":{"min":950}}}"#,
        );
        assert!(msg.profile_set);
        assert!(msg.is_structural());
        let t = &msg.profiles["temperature"];
        assert_eq!(t.label.as_deref(), Some("Air"));
        assert_eq!((t.min, t.max), (Some(-20.0), Some(60.0)));
        assert_eq!(msg.profiles["humidity"].max, Some(90.0));
        assert_eq!(msg.profiles["pressure"].min, Some(950.0));
    }

    #[test]
    fn fragments_are_typed() {
        let msg = parse(r#"{"csv_chunk":{"seq":3,"id":7,"total":120,"last":true,"data":"a,b"}}"#);
        let frag = msg.fragment.expect("fragment");
        assert_eq!(frag.mode, FragmentMode::Indexed);
        assert_eq!(frag.seq, 3);
        assert_eq!(frag.transfer_id.as_deref(), Some("7"));
        assert_eq!(frag.total, Some(120));
        assert!(frag.last);
        assert_eq!(frag.data, "a,b");

        let msg = parse(r#"{"csv_block":{"id":"x","seq":0,"last":false,"data":"l1\nl2"}}"#);
        let frag = msg.fragment.expect("block");
        assert_eq!(frag.mode, FragmentMode::Lines);
        assert_eq!(frag.data, "l1\nl2");

        let msg = parse(r#"{"csv_chunk":{"data":"no seq"}}"#);
        assert!(msg.fragment.is_none());
    }

    #[test]
    fn ack_and_inline_csv() {
        let msg = parse(r#"{"ack":"flash_export","status":"ERROR","msg":"busy"}"#);
        assert_eq!(msg.ack.as_deref(), Some("flash_export"));
        assert_eq!(msg.status.as_deref(), Some("error"));
        assert_eq!(msg.message.as_deref(), Some("busy"));

        let msg = parse(r#"{"flashCsv":"date_time,value1,value2\n"}"#);
        assert!(msg.csv.is_some());
    }

    #[test]
    fn non_finite_and_non_numeric_values_are_absent() {
        let msg = parse(r#"{"m":{"t":"warm","h":null,"p":"1013"}}"#);
        assert_eq!(msg.metrics.len(), 1);
        assert_eq!(msg.metrics.get("pressure"), Some(&1013.0));
    }

    #[test]
    fn empty_and_garbage_inputs_yield_empty_records() {
        assert!(parse("").is_empty());
        assert!(parse("}{").is_empty());
        assert!(parse("[1,2,3]").is_empty());
        assert!(parse("hello world").is_empty());
    }
}
