//! Log helpers for notification payloads.
//!
//! Node payloads contain newlines (CSV blocks) and occasionally binary noise;
//! both are escaped so every log record stays on one line.

/// Maximum characters of a payload shown in a log line.
const MAX_PREVIEW: usize = 160;

/// Escape control characters and cap the length of `s` for single-line logs.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Hex preview of raw bytes, used when a notification is not valid UTF-8.
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let mut out: String = data
        .iter()
        .take(max)
        .map(|b| format!("{:02x}", b))
        .collect();
    if data.len() > max {
        out.push('…');
    }
    out
}

/// Preview a raw notification: escaped text when it decodes, hex otherwise.
pub fn notification_preview(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => escape_log(text),
        Err(_) => format!("hex:{}", hex_preview(raw, MAX_PREVIEW / 2)),
    }
}
