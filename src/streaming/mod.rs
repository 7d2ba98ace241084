// Streaming translation pipeline
//
// The upstream answers with AWS EventStream bytes wrapping JSON payloads.
// The parser is frame-oblivious: it scans the cumulative buffer for known
// payload signatures, extracts each by brace-counted span, and a state
// machine turns the typed events into Claude SSE frames.

use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bracket_tools;
use crate::error::ApiError;
use crate::models::claude::{ContentBlock, MessagesResponse, Usage as ClaudeUsage};

// ==================================================================================================
// Typed parser events
// ==================================================================================================

/// One decoded upstream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum KiroEvent {
    /// Assistant text delta
    Content(String),
    /// First payload of a tool call: name + toolUseId (+ any initial input)
    ToolStart {
        id: String,
        name: String,
        input: String,
    },
    /// Streamed fragment of the tool-call arguments JSON
    ToolInput(String),
    /// Tool call finished
    ToolStop,
    /// Metering payload
    Usage {
        input_tokens: i32,
        output_tokens: i32,
    },
}

// ==================================================================================================
// Signature scan + brace counting
// ==================================================================================================

/// Payload signatures recognized in the byte soup, in match priority order.
const EVENT_SIGNATURES: &[&str] = &[
    "{\"content\":",
    "{\"name\":",
    "{\"input\":",
    "{\"stop\":",
    "{\"followupPrompt\":",
    "{\"usage\":",
];

/// Extracts JSON payloads out of the EventStream byte soup.
///
/// The EventStream framing itself is never parsed; headers decode to byte
/// garbage from a JSON perspective and are skipped by the signature scan.
#[derive(Debug, Default, Clone)]
pub struct PayloadScanner {
    buffer: String,
}

impl PayloadScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every payload whose closing brace arrived.
    /// Incomplete spans stay buffered for the next read.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        loop {
            let Some(start) = self.earliest_signature() else {
                // Nothing recognizable: drop the garbage tail but keep a
                // window large enough that a signature split across chunk
                // boundaries can still complete
                let mut cut = self.buffer.len().saturating_sub(32);
                while !self.buffer.is_char_boundary(cut) {
                    cut -= 1;
                }
                self.buffer = self.buffer[cut..].to_string();
                break;
            };

            let Some(end) = find_matching_brace(&self.buffer, start) else {
                // Span incomplete: retain from the opening brace onward
                self.buffer = self.buffer[start..].to_string();
                break;
            };

            let span = &self.buffer[start..=end];
            match serde_json::from_str::<Value>(span) {
                Ok(value) => payloads.push(value),
                Err(e) => {
                    warn!("Failed to parse payload: {} - {}", e, &span[..span.len().min(100)]);
                }
            }
            self.buffer = self.buffer[end + 1..].to_string();
        }

        payloads
    }

    fn earliest_signature(&self) -> Option<usize> {
        EVENT_SIGNATURES
            .iter()
            .filter_map(|sig| self.buffer.find(sig))
            .min()
    }
}

/// Position of the closing brace for the object starting at `start`,
/// accounting for nested braces, quoted strings, and escapes. Returns None
/// while the span is still incomplete.
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in bytes.iter().enumerate().skip(start) {
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
            if ch == b'{' {
                depth += 1;
            } else if ch == b'}' {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
    }

    None
}

// ==================================================================================================
// Payload classification
// ==================================================================================================

/// Classifies payloads into typed events, tracking the open tool call so the
/// upstream habit of repeating `name`/`toolUseId` in every input chunk does
/// not fabricate extra tool starts.
#[derive(Debug, Default, Clone)]
pub struct EventParser {
    scanner: PayloadScanner,
    current_tool_id: Option<String>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<KiroEvent> {
        let payloads = self.scanner.feed(chunk);
        let mut events = Vec::new();
        for payload in payloads {
            self.classify(&payload, &mut events);
        }
        events
    }

    fn classify(&mut self, payload: &Value, events: &mut Vec<KiroEvent>) {
        // Followup prompts are never surfaced; their objects also carry a
        // "content" key, so this check runs first
        if payload.get("followupPrompt").is_some() {
            return;
        }

        if let Some(content) = payload.get("content").and_then(|v| v.as_str()) {
            events.push(KiroEvent::Content(content.to_string()));
            return;
        }

        if let Some(name) = payload.get("name").and_then(|v| v.as_str()) {
            let id = payload
                .get("toolUseId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let input = input_fragment(payload.get("input"));

            let is_continuation = self
                .current_tool_id
                .as_deref()
                .is_some_and(|open| !open.is_empty() && open == id);

            if is_continuation {
                if !input.is_empty() {
                    events.push(KiroEvent::ToolInput(input));
                }
            } else {
                self.current_tool_id = Some(id.clone());
                events.push(KiroEvent::ToolStart {
                    id,
                    name: name.to_string(),
                    input,
                });
            }

            if payload.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
                self.current_tool_id = None;
                events.push(KiroEvent::ToolStop);
            }
            return;
        }

        if let Some(input) = payload.get("input") {
            events.push(KiroEvent::ToolInput(input_fragment(Some(input))));
            if payload.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
                self.current_tool_id = None;
                events.push(KiroEvent::ToolStop);
            }
            return;
        }

        if payload.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
            self.current_tool_id = None;
            events.push(KiroEvent::ToolStop);
            return;
        }

        if let Some(usage) = payload.get("usage") {
            if let Some(obj) = usage.as_object() {
                events.push(KiroEvent::Usage {
                    input_tokens: obj
                        .get("inputTokens")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0) as i32,
                    output_tokens: obj
                        .get("outputTokens")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0) as i32,
                });
            }
        }
    }
}

fn input_fragment(input: Option<&Value>) -> String {
    match input {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ==================================================================================================
// Claude SSE emission
// ==================================================================================================

/// Formats one Claude SSE frame: `event: <type>\ndata: <json>\n\n`.
pub fn sse_frame(event_type: &str, data: &Value) -> String {
    format!(
        "event: {}\ndata: {}\n\n",
        event_type,
        serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string())
    )
}

/// Generates a message id in the Claude format.
pub fn generate_message_id() -> String {
    format!("msg_{}", &Uuid::new_v4().simple().to_string()[..24])
}

#[derive(Default)]
struct SseState {
    text_block_index: Option<i32>,
    open_tool_index: Option<i32>,
    next_index: i32,
    saw_tool: bool,
    output_tokens: Option<i32>,
    text_chars: usize,
}

impl SseState {
    /// Frames for one parser event, opening and closing blocks as needed.
    fn frames_for(&mut self, event: KiroEvent) -> Vec<String> {
        let mut frames = Vec::new();
        match event {
            KiroEvent::Content(text) => {
                let index = match self.text_block_index {
                    Some(index) => index,
                    None => {
                        let index = self.next_index;
                        self.next_index += 1;
                        self.text_block_index = Some(index);
                        frames.push(sse_frame(
                            "content_block_start",
                            &json!({
                                "type": "content_block_start",
                                "index": index,
                                "content_block": {"type": "text", "text": ""}
                            }),
                        ));
                        index
                    }
                };
                self.text_chars += text.len();
                frames.push(sse_frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
            }
            KiroEvent::ToolStart { id, name, input } => {
                // A tool left open without a stop payload closes here
                if let Some(index) = self.open_tool_index.take() {
                    frames.push(sse_frame(
                        "content_block_stop",
                        &json!({"type": "content_block_stop", "index": index}),
                    ));
                }
                let index = self.next_index;
                self.next_index += 1;
                self.open_tool_index = Some(index);
                self.saw_tool = true;
                frames.push(sse_frame(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
                    }),
                ));
                if !input.is_empty() {
                    frames.push(sse_frame(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "input_json_delta", "partial_json": input}
                        }),
                    ));
                }
            }
            KiroEvent::ToolInput(input) => {
                if let Some(index) = self.open_tool_index {
                    if !input.is_empty() {
                        frames.push(sse_frame(
                            "content_block_delta",
                            &json!({
                                "type": "content_block_delta",
                                "index": index,
                                "delta": {"type": "input_json_delta", "partial_json": input}
                            }),
                        ));
                    }
                } else {
                    warn!("Tool input fragment with no open tool block");
                }
            }
            KiroEvent::ToolStop => {
                if let Some(index) = self.open_tool_index.take() {
                    frames.push(sse_frame(
                        "content_block_stop",
                        &json!({"type": "content_block_stop", "index": index}),
                    ));
                }
            }
            KiroEvent::Usage { output_tokens, .. } => {
                self.output_tokens = Some(output_tokens);
            }
        }
        frames
    }

    /// Terminating frames: close open blocks, then message_delta + message_stop.
    fn final_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if let Some(index) = self.open_tool_index.take() {
            frames.push(sse_frame(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }
        if let Some(index) = self.text_block_index.take() {
            frames.push(sse_frame(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }

        let stop_reason = if self.saw_tool { "tool_use" } else { "end_turn" };
        let output_tokens = self
            .output_tokens
            .unwrap_or((self.text_chars / 4) as i32);
        frames.push(sse_frame(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": output_tokens}
            }),
        ));
        frames.push(sse_frame(
            "message_stop",
            &json!({"type": "message_stop"}),
        ));
        frames
    }
}

/// The opening `message_start` frame.
pub fn message_start_frame(message_id: &str, model: &str, input_tokens: i32) -> String {
    sse_frame(
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": input_tokens, "output_tokens": 0}
            }
        }),
    )
}

/// Translate the upstream byte stream into Claude SSE frames.
///
/// The returned stream yields pre-formatted SSE strings; the first item is
/// `message_start` and, on a clean upstream EOF, the last two are
/// `message_delta` and `message_stop`. Errors surface as `Err` items; the
/// handler maps them onto a single wire-shaped error frame.
pub fn stream_kiro_to_claude(
    response: reqwest::Response,
    model: &str,
    input_tokens: i32,
) -> BoxStream<'static, Result<String, ApiError>> {
    let message_id = generate_message_id();
    let start = futures::stream::iter(vec![Ok(message_start_frame(
        &message_id,
        model,
        input_tokens,
    ))]);

    let parser = Arc::new(Mutex::new(EventParser::new()));
    let state = Arc::new(Mutex::new(SseState::default()));

    let parser_for_body = parser.clone();
    let state_for_body = state.clone();
    let body = response
        .bytes_stream()
        .map(move |chunk_result| {
            let parser = parser_for_body.clone();
            let state = state_for_body.clone();
            match chunk_result {
                Ok(chunk) => {
                    let events = parser.lock().unwrap().feed(&chunk);
                    let mut state = state.lock().unwrap();
                    let frames: Vec<Result<String, ApiError>> = events
                        .into_iter()
                        .flat_map(|e| state.frames_for(e))
                        .map(Ok)
                        .collect();
                    futures::stream::iter(frames)
                }
                Err(e) => futures::stream::iter(vec![Err(ApiError::NetworkError(format!(
                    "upstream stream error: {}",
                    e
                )))]),
            }
        })
        .flatten();

    let state_for_end = state.clone();
    let end = futures::stream::unfold(Some(state_for_end), |state_opt| async move {
        let state = state_opt?;
        let frames = state.lock().unwrap().final_frames();
        Some((futures::stream::iter(frames.into_iter().map(Ok)), None))
    })
    .flatten();

    start.chain(body).chain(end).boxed()
}

// ==================================================================================================
// Unary collection
// ==================================================================================================

/// Buffer the whole upstream stream and assemble a single Messages response.
/// Bracket-format tool calls embedded in the text are recovered here.
pub async fn collect_claude_response(
    response: reqwest::Response,
    model: &str,
    input_tokens: i32,
) -> Result<MessagesResponse, ApiError> {
    let mut byte_stream = response.bytes_stream();
    let mut parser = EventParser::new();

    let mut full_content = String::new();
    let mut tools: Vec<(String, String, String)> = Vec::new(); // (id, name, input)
    let mut open_tool: Option<(String, String, String)> = None;
    let mut output_tokens: Option<i32> = None;

    while let Some(chunk) = byte_stream.next().await {
        let chunk =
            chunk.map_err(|e| ApiError::NetworkError(format!("upstream stream error: {}", e)))?;
        for event in parser.feed(&chunk) {
            match event {
                KiroEvent::Content(text) => full_content.push_str(&text),
                KiroEvent::ToolStart { id, name, input } => {
                    if let Some(tool) = open_tool.take() {
                        tools.push(tool);
                    }
                    open_tool = Some((id, name, input));
                }
                KiroEvent::ToolInput(input) => {
                    if let Some((_, _, args)) = open_tool.as_mut() {
                        args.push_str(&input);
                    }
                }
                KiroEvent::ToolStop => {
                    if let Some(tool) = open_tool.take() {
                        tools.push(tool);
                    }
                }
                KiroEvent::Usage {
                    output_tokens: out, ..
                } => output_tokens = Some(out),
            }
        }
    }
    if let Some(tool) = open_tool.take() {
        tools.push(tool);
    }

    // Recover bracket-format tool calls baked into the text
    let recovery = bracket_tools::recover_tool_calls(&full_content);
    let text = recovery.cleaned_content;

    let mut content: Vec<ContentBlock> = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::Text { text: text.clone() });
    }

    let mut seen = std::collections::HashSet::new();
    for (id, name, input) in tools {
        let input_value: Value = if input.is_empty() {
            json!({})
        } else {
            serde_json::from_str(&input).unwrap_or_else(|e| {
                warn!("Tool '{}' arguments failed to parse: {}", name, e);
                json!({})
            })
        };
        let key = format!("{}-{}", name, input_value);
        if seen.insert(key) {
            content.push(ContentBlock::ToolUse {
                id: if id.is_empty() {
                    format!("call_{}", &Uuid::new_v4().simple().to_string()[..8])
                } else {
                    id
                },
                name,
                input: input_value,
            });
        }
    }
    for call in recovery.tool_calls {
        let key = format!("{}-{}", call.name, call.input);
        if seen.insert(key) {
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.name,
                input: call.input,
            });
        }
    }

    let has_tools = content
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));

    debug!(
        "Collected unary response: {} text chars, {} block(s)",
        text.len(),
        content.len()
    );

    let mut response = MessagesResponse::new(
        generate_message_id(),
        model.to_string(),
        content,
        ClaudeUsage {
            input_tokens,
            output_tokens: output_tokens.unwrap_or((text.len() / 4) as i32),
            cache_read_input_tokens: Some(0),
        },
    );
    response.stop_reason = Some(if has_tools { "tool_use" } else { "end_turn" }.to_string());
    Ok(response)
}

/// Drive a fallible SSE stream to completion, emitting a single wire-shaped
/// error frame and stopping on the first failure.
pub fn sse_with_error_frames(
    stream: BoxStream<'static, Result<String, ApiError>>,
) -> impl Stream<Item = Result<bytes::Bytes, std::io::Error>> {
    stream.scan(false, |errored, item| {
        if *errored {
            return futures::future::ready(None);
        }
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                *errored = true;
                e.to_sse_frame()
            }
        };
        futures::future::ready(Some(Ok(bytes::Bytes::from(frame))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== PayloadScanner ====================

    #[test]
    fn test_scanner_basic_content() {
        let mut scanner = PayloadScanner::new();
        let payloads = scanner.feed(b"{\"content\": \"Hello, world!\"}");
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["content"], "Hello, world!");
    }

    #[test]
    fn test_scanner_skips_eventstream_garbage() {
        let mut scanner = PayloadScanner::new();
        let payloads = scanner
            .feed(b":event-type\x07content\x0d\x00\x00{\"content\": \"Hi\"}\x00\x00binary");
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["content"], "Hi");
    }

    #[test]
    fn test_scanner_multiple_payloads_one_chunk() {
        let mut scanner = PayloadScanner::new();
        let payloads = scanner.feed(b"{\"content\": \"A\"}{\"content\": \"B\"}");
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["content"], "A");
        assert_eq!(payloads[1]["content"], "B");
    }

    #[test]
    fn test_scanner_partial_payload_across_chunks() {
        let mut scanner = PayloadScanner::new();
        assert!(scanner.feed(b"{\"content\": \"Hel").is_empty());
        let payloads = scanner.feed(b"lo\"}");
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["content"], "Hello");
    }

    #[test]
    fn test_scanner_split_inside_string_escape() {
        // Split right after a backslash inside the string
        let mut scanner = PayloadScanner::new();
        assert!(scanner.feed(b"{\"content\": \"quote: \\").is_empty());
        let payloads = scanner.feed(b"\" end\"}");
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["content"], "quote: \" end");
    }

    #[test]
    fn test_scanner_nested_braces_in_string() {
        let mut scanner = PayloadScanner::new();
        let payloads = scanner.feed(b"{\"content\": \"{\\\"nested\\\": true}\"}");
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["content"], "{\"nested\": true}");
    }

    #[test]
    fn test_scanner_split_point_equivalence() {
        // Feeding any split of the stream yields the same events as one pass
        let stream: &[u8] = b"junk{\"content\": \"alpha\"}mid{\"name\": \"t\", \"toolUseId\": \"x\"}{\"stop\": true}tail";
        let mut one_pass = PayloadScanner::new();
        let expected = one_pass.feed(stream);

        for split in 0..stream.len() {
            let mut scanner = PayloadScanner::new();
            let mut got = scanner.feed(&stream[..split]);
            got.extend(scanner.feed(&stream[split..]));
            assert_eq!(got, expected, "split at {}", split);
        }
    }

    #[test]
    fn test_find_matching_brace_incomplete() {
        assert_eq!(find_matching_brace("{\"a\": {\"b\": 1}", 0), None);
        assert_eq!(find_matching_brace("{\"a\": 1}", 0), Some(7));
        assert_eq!(find_matching_brace("x", 0), None);
    }

    // ==================== EventParser ====================

    #[test]
    fn test_parser_content_event() {
        let mut parser = EventParser::new();
        let events = parser.feed(b"{\"content\": \"Hi\"}");
        assert_eq!(events, vec![KiroEvent::Content("Hi".to_string())]);
    }

    #[test]
    fn test_parser_followup_prompt_skipped() {
        let mut parser = EventParser::new();
        let events =
            parser.feed(b"{\"followupPrompt\": {\"content\": \"more?\"}, \"content\": \"x\"}");
        assert!(events.is_empty());
    }

    #[test]
    fn test_parser_tool_sequence() {
        let mut parser = EventParser::new();
        let mut events = parser.feed(b"{\"name\": \"get_weather\", \"toolUseId\": \"tu_1\", \"input\": \"\"}");
        events.extend(parser.feed(b"{\"input\": \"{\\\"city\\\": \\\"NYC\\\"\"}"));
        events.extend(parser.feed(b"{\"input\": \"}\"}"));
        events.extend(parser.feed(b"{\"stop\": true}"));

        assert_eq!(
            events,
            vec![
                KiroEvent::ToolStart {
                    id: "tu_1".to_string(),
                    name: "get_weather".to_string(),
                    input: String::new(),
                },
                KiroEvent::ToolInput("{\"city\": \"NYC\"".to_string()),
                KiroEvent::ToolInput("}".to_string()),
                KiroEvent::ToolStop,
            ]
        );
    }

    #[test]
    fn test_parser_repeated_name_is_continuation() {
        let mut parser = EventParser::new();
        let mut events =
            parser.feed(b"{\"name\": \"bash\", \"toolUseId\": \"tu_9\", \"input\": \"{\\\"cm\"}");
        events.extend(
            parser.feed(b"{\"name\": \"bash\", \"toolUseId\": \"tu_9\", \"input\": \"d\\\": 1}\"}"),
        );
        events.extend(parser.feed(b"{\"stop\": true}"));

        let starts = events
            .iter()
            .filter(|e| matches!(e, KiroEvent::ToolStart { .. }))
            .count();
        assert_eq!(starts, 1, "continuation chunks must not open new tools");
    }

    #[test]
    fn test_parser_usage_event() {
        let mut parser = EventParser::new();
        let events = parser.feed(b"{\"usage\": {\"inputTokens\": 10, \"outputTokens\": 7}}");
        assert_eq!(
            events,
            vec![KiroEvent::Usage {
                input_tokens: 10,
                output_tokens: 7
            }]
        );
    }

    // ==================== SSE state machine ====================

    fn drain(state: &mut SseState, events: Vec<KiroEvent>) -> Vec<String> {
        events.into_iter().flat_map(|e| state.frames_for(e)).collect()
    }

    #[test]
    fn test_text_opens_block_zero_then_deltas() {
        let mut state = SseState::default();
        let frames = drain(
            &mut state,
            vec![
                KiroEvent::Content("Hel".to_string()),
                KiroEvent::Content("lo".to_string()),
            ],
        );
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains("content_block_start"));
        assert!(frames[0].contains("\"index\":0"));
        assert!(frames[1].contains("text_delta"));
        assert!(frames[2].contains("\"text\":\"lo\""));
    }

    #[test]
    fn test_tool_streaming_frames() {
        // End-to-end scenario: tool start, two input deltas, stop
        let mut state = SseState::default();
        let frames = drain(
            &mut state,
            vec![
                KiroEvent::ToolStart {
                    id: "tu_1".to_string(),
                    name: "get_weather".to_string(),
                    input: String::new(),
                },
                KiroEvent::ToolInput("{\"city\": \"NYC\"".to_string()),
                KiroEvent::ToolInput("}".to_string()),
                KiroEvent::ToolStop,
            ],
        );

        assert_eq!(frames.len(), 4);
        assert!(frames[0].contains("content_block_start"));
        assert!(frames[0].contains("\"tool_use\""));
        assert!(frames[0].contains("\"id\":\"tu_1\""));
        assert!(frames[0].contains("\"name\":\"get_weather\""));
        assert!(frames[0].contains("\"index\":0"));
        assert!(frames[1].contains("input_json_delta"));
        assert!(frames[2].contains("input_json_delta"));
        assert!(frames[3].contains("content_block_stop"));
        assert!(frames[3].contains("\"index\":0"));
    }

    #[test]
    fn test_tool_gets_next_index_after_text() {
        let mut state = SseState::default();
        let frames = drain(
            &mut state,
            vec![
                KiroEvent::Content("thinking".to_string()),
                KiroEvent::ToolStart {
                    id: "tu_2".to_string(),
                    name: "bash".to_string(),
                    input: String::new(),
                },
            ],
        );
        // text start, text delta, tool start
        assert!(frames[2].contains("\"index\":1"));
    }

    #[test]
    fn test_final_frames_close_and_stop() {
        let mut state = SseState::default();
        drain(&mut state, vec![KiroEvent::Content("hi".to_string())]);
        let frames = state.final_frames();
        assert!(frames[0].contains("content_block_stop"));
        assert!(frames[1].contains("message_delta"));
        assert!(frames[1].contains("end_turn"));
        assert!(frames[2].contains("message_stop"));
    }

    #[test]
    fn test_final_frames_tool_use_stop_reason() {
        let mut state = SseState::default();
        drain(
            &mut state,
            vec![
                KiroEvent::ToolStart {
                    id: "t".to_string(),
                    name: "n".to_string(),
                    input: String::new(),
                },
                KiroEvent::ToolStop,
            ],
        );
        let frames = state.final_frames();
        assert!(frames.iter().any(|f| f.contains("tool_use")));
    }

    #[test]
    fn test_usage_event_feeds_message_delta() {
        let mut state = SseState::default();
        drain(
            &mut state,
            vec![
                KiroEvent::Content("x".to_string()),
                KiroEvent::Usage {
                    input_tokens: 5,
                    output_tokens: 42,
                },
            ],
        );
        let frames = state.final_frames();
        assert!(frames.iter().any(|f| f.contains("\"output_tokens\":42")));
    }

    #[test]
    fn test_message_start_frame_shape() {
        let frame = message_start_frame("msg_x", "claude-haiku-4-5", 12);
        assert!(frame.starts_with("event: message_start\n"));
        assert!(frame.contains("\"input_tokens\":12"));
        assert!(frame.contains("\"id\":\"msg_x\""));
    }

    // ==================== Error frame plumbing ====================

    #[tokio::test]
    async fn test_sse_with_error_frames_stops_after_error() {
        let inner = futures::stream::iter(vec![
            Ok("event: ping\ndata: {}\n\n".to_string()),
            Err(ApiError::UpstreamError {
                status: 500,
                message: "boom".to_string(),
            }),
            Ok("never sent".to_string()),
        ])
        .boxed();

        let collected: Vec<_> = sse_with_error_frames(inner).collect().await;
        assert_eq!(collected.len(), 2);
        let error_frame = String::from_utf8(collected[1].as_ref().unwrap().to_vec()).unwrap();
        assert!(error_frame.starts_with("event: error\n"));
        assert!(error_frame.contains("server_error"));
    }
}
