//! Confirmation marker extraction.
//!
//! Handlers ask for confirmation by embedding a JSON object in their answer:
//!
//! ```json
//! {"type": "confirmation_request", "question": "Book the 3pm slot?", "options": ["confirm", "cancel"]}
//! ```
//!
//! The object may stand alone, sit inside a fenced code block, be wrapped in a
//! `<confirmation>` tag, or be surrounded by prose. Anything that does not parse
//! is ignored.

use std::ops::Range;

use serde_json::Value;

pub const MARKER_TYPE: &str = "confirmation_request";

/// Key inside a marker's `context` naming the handler that performs the follow-up.
pub const FOLLOW_UP_HANDLER_KEY: &str = "follow_up_handler";

pub fn default_options() -> Vec<String> {
    vec!["confirm".to_string(), "cancel".to_string()]
}

/// A parsed confirmation request and where it sat in the answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationMarker {
    pub question: String,
    pub options: Vec<String>,
    pub context: Value,
    span: Range<usize>,
}

impl ConfirmationMarker {
    pub fn follow_up_handler(&self) -> Option<&str> {
        self.context
            .get(FOLLOW_UP_HANDLER_KEY)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// The answer with the marker (and any fence or tag around it) removed.
    pub fn strip_from(&self, text: &str) -> String {
        let mut start = self.span.start;
        let mut end = self.span.end;

        let before = text[..start].trim_end();
        let after = text[end..].trim_start();
        for (open, close) in [
            ("```json", "```"),
            ("```", "```"),
            ("<confirmation>", "</confirmation>"),
            ("<confirmation_request>", "</confirmation_request>"),
        ] {
            if before.ends_with(open) && after.starts_with(close) {
                start = before.len() - open.len();
                end = text.len() - after.len() + close.len();
                break;
            }
        }

        let head = text[..start].trim_end();
        let tail = text[end..].trim_start();
        match (head.is_empty(), tail.is_empty()) {
            (true, true) => String::new(),
            (false, true) => head.to_string(),
            (true, false) => tail.to_string(),
            (false, false) => format!("{head}\n{tail}"),
        }
    }
}

/// Every balanced JSON object in `text` with its byte range, outermost first.
///
/// One pass pairs braces; only the outermost span at each position that parses
/// is kept, so nested candidates inside an accepted object are skipped.
pub fn json_objects(text: &str) -> Vec<(Range<usize>, Value)> {
    let mut found = Vec::new();
    let mut covered = 0;
    for span in balanced_spans(text.as_bytes()) {
        if span.start < covered {
            continue;
        }
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&text[span.clone()]) {
            covered = span.end;
            found.push((span, value));
        }
    }
    found
}

/// Byte ranges of every matched `{ .. }` pair, ordered by start.
///
/// Quotes only count once inside a brace, so prose around an object cannot
/// flip the string state. Unmatched braces are dropped.
fn balanced_spans(bytes: &[u8]) -> Vec<Range<usize>> {
    let mut open: Vec<usize> = Vec::new();
    let mut spans = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' if !open.is_empty() => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                if let Some(start) = open.pop() {
                    spans.push(start..i + 1);
                }
            }
            _ => {}
        }
    }
    spans.sort_by_key(|r| r.start);
    spans
}

/// First well-formed confirmation marker in `text`, if any.
pub fn find_marker(text: &str) -> Option<ConfirmationMarker> {
    json_objects(text).into_iter().find_map(|(span, value)| {
        if value.get("type").and_then(Value::as_str) != Some(MARKER_TYPE) {
            return None;
        }
        let question = value
            .get("question")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())?
            .to_string();
        let options: Vec<String> = value
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(ConfirmationMarker {
            question,
            options: if options.is_empty() {
                default_options()
            } else {
                options
            },
            context: value.get("context").cloned().unwrap_or(Value::Null),
            span,
        })
    })
}
