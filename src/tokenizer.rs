// Token counting module
// Approximate input-token counting for Claude models
//
// The exact Claude tokenizer is not public; this uses character-based
// estimation with a correction factor. Callers must treat results as an
// upper-bound estimate, not an exact count.

use serde_json::Value;

use crate::models::claude::{Message, Tool};

/// Claude tokenizes roughly 15% denser than the ~4-chars-per-token baseline
const CLAUDE_CORRECTION_FACTOR: f64 = 1.15;

/// Fixed overhead the Messages API charges when any tools are attached
pub const CLAUDE_TOOL_OVERHEAD: i32 = 346;

/// Approximate token count for a piece of text.
pub fn count_text_tokens(text: &str) -> i32 {
    if text.is_empty() {
        return 0;
    }
    (text.len() / 4 + 1) as i32
}

/// Approximate input tokens for a full Messages request.
pub fn count_request_tokens(
    messages: &[Message],
    system: Option<&Value>,
    tools: Option<&Vec<Tool>>,
) -> i32 {
    if messages.is_empty() && system.is_none() && tools.is_none() {
        return 0;
    }

    let mut total = 0;

    if let Some(sys) = system {
        total += 4;
        match sys {
            Value::String(s) => total += count_text_tokens(s),
            Value::Array(arr) => {
                for item in arr {
                    if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                        total += count_text_tokens(text);
                    }
                }
            }
            _ => {}
        }
    }

    for message in messages {
        // Role and delimiters
        total += 4;
        total += count_text_tokens(&message.role);
        total += count_content_tokens(&message.content);
    }

    if let Some(tools) = tools {
        for tool in tools {
            total += 4;
            total += count_text_tokens(&tool.name);
            if let Some(ref desc) = tool.description {
                total += count_text_tokens(desc);
            }
            let schema = serde_json::to_string(&tool.input_schema).unwrap_or_default();
            total += count_text_tokens(&schema);
        }
    }

    total += 3;

    (total as f64 * CLAUDE_CORRECTION_FACTOR) as i32
}

fn count_content_tokens(content: &Value) -> i32 {
    let mut total = 0;
    match content {
        Value::String(s) => total += count_text_tokens(s),
        Value::Array(arr) => {
            for item in arr {
                let Some(obj) = item.as_object() else { continue };
                match obj.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = obj.get("text").and_then(|t| t.as_str()) {
                            total += count_text_tokens(text);
                        }
                    }
                    Some("image") => {
                        // Images land around 85-170 tokens depending on size
                        total += 100;
                    }
                    Some("tool_use") => {
                        total += 4;
                        if let Some(name) = obj.get("name").and_then(|n| n.as_str()) {
                            total += count_text_tokens(name);
                        }
                        if let Some(input) = obj.get("input") {
                            let input_str = serde_json::to_string(input).unwrap_or_default();
                            total += count_text_tokens(&input_str);
                        }
                    }
                    Some("tool_result") => {
                        total += 4;
                        if let Some(id) = obj.get("tool_use_id").and_then(|v| v.as_str()) {
                            total += count_text_tokens(id);
                        }
                        match obj.get("content") {
                            Some(Value::String(s)) => total += count_text_tokens(s),
                            Some(Value::Array(parts)) => {
                                for part in parts {
                                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                        total += count_text_tokens(text);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_count_text_tokens_empty() {
        assert_eq!(count_text_tokens(""), 0);
    }

    #[test]
    fn test_count_text_tokens_scales_with_length() {
        let short = count_text_tokens("Hello");
        let long = count_text_tokens(
            "This is a considerably longer sentence that should produce more tokens.",
        );
        assert!(long > short);
    }

    #[test]
    fn test_count_request_tokens_empty() {
        assert_eq!(count_request_tokens(&[], None, None), 0);
    }

    #[test]
    fn test_count_request_tokens_simple() {
        let messages = vec![Message {
            role: "user".to_string(),
            content: json!("Hello, how are you?"),
        }];
        let tokens = count_request_tokens(&messages, None, None);
        assert!(tokens > 0);
        assert!(tokens < 100);
    }

    #[test]
    fn test_count_request_tokens_with_system_and_tools() {
        let messages = vec![Message {
            role: "user".to_string(),
            content: json!("What's the weather?"),
        }];
        let system = json!("You are a helpful assistant.");
        let tools = vec![Tool {
            name: "get_weather".to_string(),
            description: Some("Get the current weather".to_string()),
            input_schema: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        }];

        let bare = count_request_tokens(&messages, None, None);
        let loaded = count_request_tokens(&messages, Some(&system), Some(&tools));
        assert!(loaded > bare);
    }

    #[test]
    fn test_count_request_tokens_image_floor() {
        let messages = vec![Message {
            role: "user".to_string(),
            content: json!([
                {"type": "text", "text": "What's in this image?"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "abc"}}
            ]),
        }];
        let tokens = count_request_tokens(&messages, None, None);
        assert!(tokens >= 100);
    }
}
