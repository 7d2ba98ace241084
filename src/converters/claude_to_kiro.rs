// Claude Messages request -> Kiro conversationState envelope
//
// The transformation runs in a fixed order: history isolation, trailing
// prefill-artifact drop, adjacent-role merge, system injection, history
// mapping, current-message reshape, tools, auth decoration, model mapping.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ApiError, Result};
use crate::models::claude::{ContentBlock, ImageSource, MessagesRequest};
use crate::models::kiro::{
    AssistantResponseMessage, ConversationState, HistoryEntry, ImageBytes, InputSchema, KiroImage,
    KiroRequest, ToolResult, ToolResultText, ToolSpec, ToolSpecification, ToolUse,
    UserInputMessage, UserInputMessageContext,
};
use crate::resolver::resolve_model;

// ==================================================================================================
// Normalized form
// ==================================================================================================

#[derive(Debug, Clone, PartialEq)]
enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
struct NormMessage {
    role: Role,
    blocks: Vec<ContentBlock>,
}

/// Normalize a message's `content` value: a bare string becomes one text
/// block, arrays keep their recognized typed blocks, anything else is
/// stringified.
fn normalize_content(content: &Value) -> Vec<ContentBlock> {
    if let Some(text) = content.as_str() {
        return vec![ContentBlock::Text {
            text: text.to_string(),
        }];
    }

    if let Some(items) = content.as_array() {
        return items
            .iter()
            .filter_map(|item| match serde_json::from_value(item.clone()) {
                Ok(block) => Some(block),
                Err(_) => {
                    debug!(
                        "Skipping unrecognized content block: {}",
                        item.get("type").and_then(|t| t.as_str()).unwrap_or("?")
                    );
                    None
                }
            })
            .collect();
    }

    vec![ContentBlock::Text {
        text: content.to_string(),
    }]
}

/// Concatenate the text blocks of a message.
fn blocks_text(blocks: &[ContentBlock]) -> String {
    let mut out = String::new();
    for block in blocks {
        if let ContentBlock::Text { text } = block {
            out.push_str(text);
        }
    }
    out
}

fn has_text(blocks: &[ContentBlock]) -> bool {
    blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::Text { text } if !text.is_empty()))
}

/// Extract the system prompt text: a string, or an array of text blocks
/// joined with newlines.
pub fn extract_system_text(system: Option<&Value>) -> String {
    let Some(system) = system else {
        return String::new();
    };

    if let Some(text) = system.as_str() {
        return text.to_string();
    }

    if let Some(blocks) = system.as_array() {
        let parts: Vec<String> = blocks
            .iter()
            .filter_map(|block| {
                if block.get("type")?.as_str()? == "text" {
                    Some(block.get("text")?.as_str()?.to_string())
                } else {
                    None
                }
            })
            .collect();
        return parts.join("\n");
    }

    system.to_string()
}

// ==================================================================================================
// Block extraction
// ==================================================================================================

/// Images in the Kiro shape. URL sources are skipped, the upstream only
/// accepts inline bytes.
fn extract_images(blocks: &[ContentBlock]) -> Vec<KiroImage> {
    let mut images = Vec::new();
    for block in blocks {
        if let ContentBlock::Image { source } = block {
            match source {
                ImageSource::Base64 { media_type, data } => {
                    if data.is_empty() {
                        warn!("Skipping image with empty data");
                        continue;
                    }
                    let format = media_type
                        .split('/')
                        .next_back()
                        .unwrap_or(media_type)
                        .to_string();
                    images.push(KiroImage {
                        format,
                        source: ImageBytes { bytes: data.clone() },
                    });
                }
                ImageSource::Url { url } => {
                    warn!(
                        "URL-based images are not supported by the Kiro API, skipping: {}",
                        &url[..80.min(url.len())]
                    );
                }
            }
        }
    }
    images
}

/// Tool results in the Kiro shape, deduplicated by toolUseId (first wins).
fn extract_tool_results(blocks: &[ContentBlock]) -> Vec<ToolResult> {
    let mut seen = std::collections::HashSet::new();
    let mut results = Vec::new();
    for block in blocks {
        if let ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } = block
        {
            if !seen.insert(tool_use_id.clone()) {
                debug!("Dropping duplicate tool result for {}", tool_use_id);
                continue;
            }
            let text = tool_result_text(content.as_ref());
            results.push(ToolResult {
                content: vec![ToolResultText {
                    text: if text.is_empty() {
                        "(empty result)".to_string()
                    } else {
                        text
                    },
                }],
                status: "success".to_string(),
                tool_use_id: tool_use_id.clone(),
            });
        }
    }
    results
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        Some(other) => other.to_string(),
    }
}

fn extract_tool_uses(blocks: &[ContentBlock]) -> Vec<ToolUse> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(ToolUse {
                tool_use_id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect()
}

// ==================================================================================================
// JSON Schema sanitization
// ==================================================================================================

/// The upstream rejects schemas carrying an empty `required` array or any
/// `additionalProperties` key; strip both, recursively.
pub fn sanitize_json_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };

    let mut result = serde_json::Map::new();
    for (key, value) in obj {
        if key == "required" {
            if let Some(arr) = value.as_array() {
                if arr.is_empty() {
                    continue;
                }
            }
        }
        if key == "additionalProperties" {
            continue;
        }

        let sanitized = match value {
            Value::Object(_) => sanitize_json_schema(value),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|i| {
                        if i.is_object() {
                            sanitize_json_schema(i)
                        } else {
                            i.clone()
                        }
                    })
                    .collect(),
            ),
            _ => value.clone(),
        };
        result.insert(key.clone(), sanitized);
    }

    Value::Object(result)
}

// ==================================================================================================
// History shaping
// ==================================================================================================

/// Concatenate consecutive same-role messages, separating their text with a
/// newline.
fn merge_adjacent(messages: Vec<NormMessage>) -> Vec<NormMessage> {
    let mut merged: Vec<NormMessage> = Vec::new();
    for msg in messages {
        match merged.last_mut() {
            Some(last) if last.role == msg.role => {
                if has_text(&last.blocks) && has_text(&msg.blocks) {
                    last.blocks.push(ContentBlock::Text {
                        text: "\n".to_string(),
                    });
                }
                last.blocks.extend(msg.blocks);
            }
            _ => merged.push(msg),
        }
    }
    merged
}

fn history_entry(msg: &NormMessage, model_id: &str) -> HistoryEntry {
    match msg.role {
        Role::User => {
            let mut content = blocks_text(&msg.blocks);
            if content.is_empty() {
                content = "(empty)".to_string();
            }

            let mut user = UserInputMessage::new(content, model_id.to_string());

            let images = extract_images(&msg.blocks);
            if !images.is_empty() {
                user.images = Some(images);
            }

            let tool_results = extract_tool_results(&msg.blocks);
            if !tool_results.is_empty() {
                user.user_input_message_context = Some(UserInputMessageContext {
                    tool_results: Some(tool_results),
                    tools: None,
                });
            }

            HistoryEntry::User(user)
        }
        Role::Assistant => {
            let mut content = blocks_text(&msg.blocks);
            if content.is_empty() {
                content = "(empty)".to_string();
            }

            let tool_uses = extract_tool_uses(&msg.blocks);
            HistoryEntry::Assistant(AssistantResponseMessage {
                content,
                tool_uses: if tool_uses.is_empty() {
                    None
                } else {
                    Some(tool_uses)
                },
            })
        }
    }
}

// ==================================================================================================
// Main entry point
// ==================================================================================================

/// Build the Kiro envelope for a Claude Messages request.
///
/// `effective_system` is the request system prompt after any file-backed
/// overlay has been applied by the pipeline.
pub fn build_kiro_request(
    request: &MessagesRequest,
    effective_system: Option<&Value>,
    profile_arn: Option<String>,
) -> Result<KiroRequest> {
    let model_id = resolve_model(&request.model).to_string();

    let mut messages: Vec<NormMessage> = Vec::with_capacity(request.messages.len());
    for msg in &request.messages {
        let role = match msg.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(ApiError::ValidationError(format!(
                    "unsupported role: {}",
                    other
                )))
            }
        };
        messages.push(NormMessage {
            role,
            blocks: normalize_content(&msg.content),
        });
    }

    // History isolation: split off the final message
    let original_final = messages
        .pop()
        .ok_or_else(|| ApiError::ValidationError("messages cannot be empty".to_string()))?;
    let mut history = messages;

    // Trailing-assistant handling. A final assistant whose first block is the
    // bare prefill artifact "{" is dropped outright; any other final
    // assistant moves into history and the current turn becomes "Continue".
    let current_blocks: Option<Vec<ContentBlock>> = match original_final.role {
        Role::Assistant => {
            let is_prefill_artifact = matches!(
                original_final.blocks.first(),
                Some(ContentBlock::Text { text }) if text == "{"
            );
            if is_prefill_artifact {
                debug!("Dropping trailing assistant prefill artifact");
            } else {
                history.push(original_final);
            }
            None
        }
        Role::User => Some(original_final.blocks),
    };

    // Adjacent-role merge
    let mut history = merge_adjacent(history);

    // System injection
    let system_text = extract_system_text(effective_system);
    let mut current_blocks = current_blocks;
    if !system_text.is_empty() {
        match history.first_mut() {
            Some(first) if first.role == Role::User => {
                first.blocks.insert(
                    0,
                    ContentBlock::Text {
                        text: format!("{}\n\n", system_text),
                    },
                );
            }
            Some(_) => {
                history.insert(
                    0,
                    NormMessage {
                        role: Role::User,
                        blocks: vec![ContentBlock::Text { text: system_text }],
                    },
                );
            }
            None => match current_blocks.as_mut() {
                // No history at all: fold the system prompt into the
                // current user turn
                Some(blocks) => blocks.insert(
                    0,
                    ContentBlock::Text {
                        text: format!("{}\n\n", system_text),
                    },
                ),
                None => history.push(NormMessage {
                    role: Role::User,
                    blocks: vec![ContentBlock::Text { text: system_text }],
                }),
            },
        }
    }

    // History entry mapping
    let mut entries: Vec<HistoryEntry> = history
        .iter()
        .map(|m| history_entry(m, &model_id))
        .collect();

    // Current-message reshape
    let mut current = match current_blocks {
        None => UserInputMessage::new("Continue".to_string(), model_id.clone()),
        Some(blocks) => {
            let tool_results = extract_tool_results(&blocks);
            let images = extract_images(&blocks);
            let mut content = blocks_text(&blocks);
            if content.is_empty() {
                content = if tool_results.is_empty() {
                    "Continue".to_string()
                } else {
                    "Tool results provided.".to_string()
                };
            }

            let mut user = UserInputMessage::new(content, model_id.clone());
            if !images.is_empty() {
                user.images = Some(images);
            }
            if !tool_results.is_empty() {
                user.user_input_message_context = Some(UserInputMessageContext {
                    tool_results: Some(tool_results),
                    tools: None,
                });
            }
            user
        }
    };

    // The upstream requires alternating turns ending on assistant before the
    // current user turn
    if matches!(entries.last(), Some(HistoryEntry::User(_))) {
        entries.push(HistoryEntry::Assistant(AssistantResponseMessage {
            content: "Continue".to_string(),
            tool_uses: None,
        }));
    }

    // Tools
    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            let specs: Vec<ToolSpec> = tools
                .iter()
                .map(|tool| ToolSpec {
                    tool_specification: ToolSpecification {
                        name: tool.name.clone(),
                        description: tool
                            .description
                            .clone()
                            .filter(|d| !d.trim().is_empty())
                            .unwrap_or_else(|| format!("Tool: {}", tool.name)),
                        input_schema: InputSchema {
                            json: sanitize_json_schema(&tool.input_schema),
                        },
                    },
                })
                .collect();

            let context = current
                .user_input_message_context
                .get_or_insert_with(UserInputMessageContext::default);
            context.tools = Some(specs);
        }
    }

    Ok(KiroRequest {
        conversation_state: ConversationState::new(entries, current),
        profile_arn,
    })
}
