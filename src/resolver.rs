// Model resolution
// Maps caller-facing Claude model ids to CodeWhisperer internal ids

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Internal id used when the caller's model is unknown.
pub const DEFAULT_MODEL_ID: &str = "CLAUDE_SONNET_4_5_20250929_V1_0";

static MODEL_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
        ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
        ("claude-haiku-4-5-20251001", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
        ("claude-haiku-4-5", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
        ("claude-opus-4-1-20250805", "CLAUDE_OPUS_4_1_20250805_V1_0"),
        ("claude-opus-4-1", "CLAUDE_OPUS_4_1_20250805_V1_0"),
        ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
        ("claude-3-5-sonnet-20241022", "CLAUDE_3_5_SONNET_20241022_V2_0"),
        ("claude-3-5-haiku-20241022", "CLAUDE_3_5_HAIKU_20241022_V1_0"),
    ])
});

/// Resolve a caller model id to the upstream internal id. Unknown ids fall
/// back to the default mapping.
pub fn resolve_model(model: &str) -> &'static str {
    if let Some(id) = MODEL_MAP.get(model) {
        return id;
    }
    // Version-suffixed ids the table does not list explicitly, e.g.
    // "claude-sonnet-4-5-preview", resolve by family prefix.
    for (known, id) in MODEL_MAP.iter() {
        if model.starts_with(known) {
            return id;
        }
    }
    tracing::debug!("Unknown model '{}', using default mapping", model);
    DEFAULT_MODEL_ID
}
