// Bracket tool-call recovery
//
// Some upstream responses embed tool calls as plain text:
//   [Called get_time with args: {tz: UTC,}]
// After the full content is assembled, these spans are located by
// string-aware bracket matching, their argument JSON is repaired, and each
// becomes a structured tool-use block. The matched spans are removed from
// the text.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

const CALL_MARKER: &str = "[Called";
const ARGS_MARKER: &str = "with args:";

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub cleaned_content: String,
    pub tool_calls: Vec<RecoveredToolCall>,
}

/// Scan `content` for bracket-format tool calls. Returns the text with the
/// matched spans removed (whitespace runs collapsed) and the recovered
/// calls, deduplicated by (name, arguments) with the first occurrence
/// winning.
pub fn recover_tool_calls(content: &str) -> RecoveryResult {
    if !content.contains(CALL_MARKER) {
        return RecoveryResult {
            cleaned_content: content.to_string(),
            tool_calls: Vec::new(),
        };
    }

    let mut tool_calls: Vec<RecoveredToolCall> = Vec::new();
    let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
    let mut removals: Vec<(usize, usize)> = Vec::new();

    let mut search_from = 0;
    while let Some(rel) = content[search_from..].find(CALL_MARKER) {
        let start = search_from + rel;

        // The candidate segment runs to the next marker (or EOF); a span
        // never crosses into the following call
        let segment_end = content[start + CALL_MARKER.len()..]
            .find(CALL_MARKER)
            .map(|p| start + CALL_MARKER.len() + p)
            .unwrap_or(content.len());
        let segment = &content[start..segment_end];

        let Some(close) = find_matching_bracket(segment) else {
            debug!("Unterminated bracket tool call, leaving text intact");
            search_from = start + CALL_MARKER.len();
            continue;
        };
        let span = &segment[..=close];

        match parse_bracket_call(span) {
            Some(call) => {
                let key = (
                    call.name.clone(),
                    serde_json::to_string(&call.input).unwrap_or_default(),
                );
                if seen.insert(key) {
                    tool_calls.push(call);
                } else {
                    debug!("Dropping duplicate bracket tool call");
                }
                removals.push((start, start + span.len()));
            }
            None => {
                warn!(
                    "Failed to recover bracket tool call: {}",
                    &span[..span.len().min(120)]
                );
                // Irreparable args: still strip the artifact from the text
                removals.push((start, start + span.len()));
            }
        }

        search_from = start + span.len();
    }

    let mut cleaned = String::with_capacity(content.len());
    let mut cursor = 0;
    for (from, to) in removals {
        cleaned.push_str(&content[cursor..from]);
        cursor = to;
    }
    cleaned.push_str(&content[cursor..]);

    RecoveryResult {
        cleaned_content: collapse_whitespace(&cleaned),
        tool_calls,
    }
}

/// Position of the `]` paired with the `[` at position 0, counting nested
/// brackets outside quoted strings.
fn find_matching_bracket(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'[') {
        return None;
    }

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in bytes.iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == b'\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == b'"' {
            in_string = !in_string;
            continue;
        }
        if !in_string {
            if ch == b'[' {
                depth += 1;
            } else if ch == b']' {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
    }

    None
}

/// Parse one complete `[Called <name> with args: {…}]` span.
fn parse_bracket_call(span: &str) -> Option<RecoveredToolCall> {
    let inner = span.strip_prefix(CALL_MARKER)?.strip_suffix(']')?;
    let args_pos = inner.find(ARGS_MARKER)?;

    let name = inner[..args_pos].trim().to_string();
    if name.is_empty() {
        return None;
    }

    let raw_args = inner[args_pos + ARGS_MARKER.len()..].trim();
    let input = parse_with_repairs(raw_args)?;

    Some(RecoveredToolCall {
        id: format!("call_{}", &Uuid::new_v4().simple().to_string()[..8]),
        name,
        input,
    })
}

/// Try strict JSON first, then apply the repair passes.
fn parse_with_repairs(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return Some(Value::Object(Default::default()));
    }
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }

    let repaired = quote_bareword_values(&quote_unquoted_keys(&strip_trailing_commas(raw)));
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Args irreparable after repair passes: {} ({})", repaired, e);
            None
        }
    }
}

/// Drop commas that sit directly before a closing `}` or `]`.
fn strip_trailing_commas(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in bytes.iter().enumerate() {
        if escape_next {
            escape_next = false;
            out.push(ch);
            continue;
        }
        if ch == b'\\' && in_string {
            escape_next = true;
            out.push(ch);
            continue;
        }
        if ch == b'"' {
            in_string = !in_string;
            out.push(ch);
            continue;
        }
        if ch == b',' && !in_string {
            let next = bytes[i + 1..].iter().find(|b| !b.is_ascii_whitespace());
            if matches!(next, Some(b'}') | Some(b']')) {
                continue;
            }
        }
        out.push(ch);
    }

    // Only ASCII commas were removed, so the bytes stay valid UTF-8
    String::from_utf8(out).unwrap_or_else(|_| text.to_string())
}

fn is_bareword_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_' || ch == b'-' || ch == b'.'
}

/// Quote object keys written without quotes: `{foo: 1}` -> `{"foo": 1}`.
fn quote_unquoted_keys(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len() + 8);
    let mut in_string = false;
    let mut escape_next = false;
    let mut i = 0;

    while i < bytes.len() {
        let ch = bytes[i];
        if escape_next {
            escape_next = false;
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == b'\\' && in_string {
            escape_next = true;
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == b'"' {
            in_string = !in_string;
            out.push(ch);
            i += 1;
            continue;
        }

        if !in_string && (ch == b'{' || ch == b',') {
            out.push(ch);
            i += 1;
            // Peek: whitespace, identifier, whitespace, ':' means this is a
            // bare key
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            let word_start = j;
            while j < bytes.len() && is_bareword_char(bytes[j]) {
                j += 1;
            }
            let word_end = j;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if word_end > word_start && j < bytes.len() && bytes[j] == b':' {
                out.extend_from_slice(&bytes[i..word_start]);
                out.push(b'"');
                out.extend_from_slice(&bytes[word_start..word_end]);
                out.push(b'"');
                out.extend_from_slice(&bytes[word_end..j]);
                i = j;
            }
            continue;
        }

        out.push(ch);
        i += 1;
    }

    String::from_utf8(out).unwrap_or_else(|_| text.to_string())
}

/// Quote bareword values: `{"tz": UTC}` -> `{"tz": "UTC"}`. Numbers and the
/// JSON literals stay untouched.
fn quote_bareword_values(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len() + 8);
    let mut in_string = false;
    let mut escape_next = false;
    let mut i = 0;

    while i < bytes.len() {
        let ch = bytes[i];
        if escape_next {
            escape_next = false;
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == b'\\' && in_string {
            escape_next = true;
            out.push(ch);
            i += 1;
            continue;
        }
        if ch == b'"' {
            in_string = !in_string;
            out.push(ch);
            i += 1;
            continue;
        }

        if !in_string && ch == b':' {
            out.push(b':');
            i += 1;
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            let word_start = j;
            while j < bytes.len() && is_bareword_char(bytes[j]) {
                j += 1;
            }
            let word = &text[word_start..j];
            if !word.is_empty() && !is_json_literal(word) {
                out.extend_from_slice(&bytes[i..word_start]);
                out.push(b'"');
                out.extend_from_slice(word.as_bytes());
                out.push(b'"');
                i = j;
            }
            continue;
        }

        out.push(ch);
        i += 1;
    }

    String::from_utf8(out).unwrap_or_else(|_| text.to_string())
}

fn is_json_literal(word: &str) -> bool {
    matches!(word, "true" | "false" | "null") || word.parse::<f64>().is_ok()
}

/// Collapse runs of spaces and tabs left behind by span removal.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_space = false;
    for ch in text.chars() {
        if ch == ' ' || ch == '\t' {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            prev_space = false;
            out.push(ch);
        }
    }
    out.trim().to_string()
}
