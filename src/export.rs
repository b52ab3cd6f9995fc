//! Bulk export CSV.
//!
//! Exports always use the node log layout: a `date_time,value1,value2` header
//! and `timestamp,value,` rows. The trailing empty column is kept so files
//! stay readable by tools written against the firmware's own log.

use crate::session::series::{format_timestamp, Sample};

pub const EXPORT_HEADER: &str = "date_time,value1,value2";

/// Normalise a reassembled node payload. Header lines, blank lines and rows
/// without a value are dropped.
pub fn normalize_export(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + EXPORT_HEADER.len() + 1);
    out.push_str(EXPORT_HEADER);
    out.push('\n');
    for line in payload.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let (Some(ts), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let lower = ts.to_ascii_lowercase();
        if ts.is_empty() || value.is_empty() || lower == "date_time" || lower == "timestamp" {
            continue;
        }
        out.push_str(ts);
        out.push(',');
        out.push_str(value);
        out.push_str(",\n");
    }
    out
}

/// Render drained history samples in the export layout.
pub fn history_to_csv<'a>(samples: impl IntoIterator<Item = &'a Sample>) -> String {
    let mut out = String::from(EXPORT_HEADER);
    out.push('\n');
    for sample in samples {
        out.push_str(&format!("{},{},\n", format_timestamp(&sample.at), sample.value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn node_log_is_rewritten_with_trailing_column() {
        let payload = "date_time,value1,value2\n01/01/24 00:00:00,21.50,1013.20\n\n01/01/24 00:00:05,21.60,\nbroken\n";
        assert_eq!(
            normalize_export(payload),
            "date_time,value1,value2\n01/01/24 00:00:00,21.50,\n01/01/24 00:00:05,21.60,\n"
        );
    }

    #[test]
    fn empty_payload_still_has_header() {
        assert_eq!(normalize_export(""), "date_time,value1,value2\n");
    }

    #[test]
    fn history_samples_render_in_order() {
        let samples = vec![
            Sample {
                at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                value: 12.5,
            },
            Sample {
                at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(),
                value: 13.0,
            },
        ];
        assert_eq!(
            history_to_csv(&samples),
            "date_time,value1,value2\n2024-01-01 00:00:00,12.5,\n2024-01-01 00:00:01,13,\n"
        );
    }
}
