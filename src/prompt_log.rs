// Outbound prompt logging and the file-backed system prompt overlay

use serde_json::Value;
use std::path::Path;

use crate::config::{Config, PromptLogMode, SystemPromptMode};
use crate::converters::claude_to_kiro::extract_system_text;

/// Mirror target for the effective (post-overlay) system prompt.
pub const FETCH_SYSTEM_PROMPT_PATH: &str = "configs/fetch_system_prompt.txt";

/// Mirror target for the raw file-injected system prompt.
pub const INPUT_SYSTEM_PROMPT_PATH: &str = "configs/input_system_prompt.txt";

/// Outcome of combining the request's system prompt with the configured
/// file-backed one.
#[derive(Debug, Clone)]
pub struct SystemOverlay {
    /// What actually goes upstream (None when neither source has text)
    pub effective: Option<Value>,
    /// The raw content of the configured system-prompt file, pre-combination
    pub file_text: Option<String>,
}

/// Apply the configured file-backed system prompt to the request's own.
pub fn apply_system_overlay(config: &Config, request_system: Option<&Value>) -> SystemOverlay {
    let file_text = config
        .system_prompt_file_path
        .as_ref()
        .and_then(|path| match std::fs::read_to_string(path) {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) => {
                tracing::warn!("System prompt file {} unreadable: {}", path.display(), e);
                None
            }
        })
        .filter(|t| !t.is_empty());

    let request_text = extract_system_text(request_system);

    let effective = match (file_text.as_deref(), &config.system_prompt_mode) {
        (Some(file), SystemPromptMode::Overwrite) => file.to_string(),
        (Some(file), SystemPromptMode::Append) => {
            if request_text.is_empty() {
                file.to_string()
            } else {
                format!("{}\n{}", request_text, file)
            }
        }
        (None, _) => request_text,
    };

    SystemOverlay {
        effective: if effective.is_empty() {
            None
        } else {
            Some(Value::String(effective))
        },
        file_text,
    }
}

/// Persist the effective system prompt for inspection. Failures only warn;
/// the mirrors are observability, not correctness.
pub fn mirror_effective_system(effective: Option<&Value>) {
    let text = extract_system_text(effective);
    write_mirror(Path::new(FETCH_SYSTEM_PROMPT_PATH), &text);
}

/// Persist the raw file-injected system prompt. No-op when no file-backed
/// prompt is configured.
pub fn mirror_input_system_prompt(file_text: Option<&str>) {
    if let Some(text) = file_text {
        write_mirror(Path::new(INPUT_SYSTEM_PROMPT_PATH), text);
    }
}

fn write_mirror(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    if let Err(e) = std::fs::write(path, text) {
        tracing::warn!("Failed to mirror system prompt to {}: {}", path.display(), e);
    }
}

/// Log the outbound prompt per PROMPT_LOG_MODE.
pub fn log_outbound_prompt(config: &Config, model: &str, messages: &[crate::models::claude::Message]) {
    match config.prompt_log_mode {
        PromptLogMode::None => {}
        PromptLogMode::Console => {
            tracing::info!(
                "Outbound prompt: model={}, {} message(s), last={}",
                model,
                messages.len(),
                summarize_last(messages)
            );
        }
        PromptLogMode::File => {
            let line = format!(
                "{} model={} messages={}\n{}\n---\n",
                chrono::Utc::now().to_rfc3339(),
                model,
                messages.len(),
                serde_json::to_string(messages).unwrap_or_default()
            );
            let file = format!(
                "{}-{}.log",
                config.prompt_log_base_name,
                chrono::Utc::now().format("%Y-%m-%d")
            );
            if let Err(e) = append_to(&file, &line) {
                tracing::warn!("Prompt log write failed: {}", e);
            }
        }
    }
}

fn append_to(path: &str, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())
}

fn summarize_last(messages: &[crate::models::claude::Message]) -> String {
    let Some(last) = messages.last() else {
        return String::new();
    };
    let text = match &last.content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut end = text.len().min(120);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
