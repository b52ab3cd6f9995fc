//! Splits one transport notification into logical text messages.
//!
//! Nodes may pack several JSON objects into one notification, or emit legacy
//! newline-separated `key=value` text. The framer is stateless: a JSON object
//! truncated at a notification boundary is not stitched back together here
//! (bulk payloads are fragmented explicitly and rebuilt by the reassembler).

/// Decode raw notification bytes into text: lossy UTF-8, NUL bytes removed,
/// surrounding whitespace trimmed.
pub fn decode_notification(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.replace('\u{0}', "").trim().to_string()
}

/// Stateless splitter for decoded notification text.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageFramer;

impl MessageFramer {
    pub fn new() -> Self {
        Self
    }

    /// Produce the logical messages contained in `text`.
    pub fn split(&self, text: &str) -> Vec<String> {
        let trimmed = trim_transport_noise(text.trim());
        if trimmed.starts_with('{') && trimmed.contains('}') {
            let objects = split_balanced_objects(trimmed);
            if !objects.is_empty() {
                return objects;
            }
        }
        split_lines(text)
    }
}

/// Drop anything before the first `{` and after the last `}` when text does not
/// already start with a brace but carries one.
fn trim_transport_noise(text: &str) -> &str {
    if text.starts_with('{') {
        return text;
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        (Some(start), _) => &text[start..],
        _ => text,
    }
}

/// Emit every top-level balanced `{...}` span. Braces inside JSON strings do
/// not count towards nesting.
fn split_balanced_objects(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        out.push(text[s..=idx].to_string());
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenated_objects_are_split() {
        let msgs = MessageFramer::new().split(r#"{"a":1}{"b":2}"#);
        assert_eq!(msgs, vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]);
        for m in &msgs {
            assert!(serde_json::from_str::<serde_json::Value>(m).is_ok());
        }
    }

    #[test]
    fn leading_and_trailing_noise_is_discarded() {
        let msgs = MessageFramer::new().split("\u{1}xx{\"t\":21.5}yy");
        assert_eq!(msgs, vec!["{\"t\":21.5}".to_string()]);
    }

    #[test]
    fn braces_inside_strings_do_not_split() {
        let msgs = MessageFramer::new().split(r#"{"msg":"a}b{c"}{"x":1}"#);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], r#"{"msg":"a}b{c"}"#);
    }

    #[test]
    fn nested_objects_stay_whole() {
        let msgs = MessageFramer::new().split(r#"{"m":{"t":1,"h":2}}"#);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn legacy_lines_fall_back_to_line_split() {
        let msgs = MessageFramer::new().split("t=21.5\n\n  h=40 \n");
        assert_eq!(msgs, vec!["t=21.5".to_string(), "h=40".to_string()]);
    }

    #[test]
    fn truncated_object_falls_back_to_text() {
        let msgs = MessageFramer::new().split(r#"{"csv_chunk":{"seq":1"#);
        assert_eq!(msgs, vec![r#"{"csv_chunk":{"seq":1"#.to_string()]);
    }

    #[test]
    fn decode_strips_nul_and_whitespace() {
        assert_eq!(decode_notification(b" t=1\0\0 "), "t=1");
    }
}
