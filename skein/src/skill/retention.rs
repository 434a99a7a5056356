//! Context-retention strategies: how a cached result is represented in the
//! message history before it reaches the LLM.

use serde_json::{Map, Value};

use crate::cache::ResultRecord;

use super::{RetentionMode, RetentionPolicy};

/// Prefix marking a pinned tool result; compression must skip such messages.
pub const PIN_MARKER: &str = "[PIN] ";

/// Content plus metadata ready to append as a tool-response message.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedResult {
    pub content: String,
    pub metadata: Map<String, Value>,
}

/// Applies the skill's retention policy to a cached result.
///
/// Metadata always carries `original_length`, `processed_length`,
/// `retention_mode`, and `pinned`.
pub fn on_before_send_to_context(
    record: &ResultRecord,
    policy: Option<&RetentionPolicy>,
) -> RenderedResult {
    let default = RetentionPolicy::default();
    let policy = policy.unwrap_or(&default);
    let original_length = record.content.chars().count();

    let (content, pinned) = match policy.mode {
        RetentionMode::Full => (record.content.clone(), false),
        RetentionMode::Summary => {
            if original_length > policy.max_length {
                (summarize(&record.content, policy.max_length, &record.reference_id), false)
            } else {
                (record.content.clone(), false)
            }
        }
        RetentionMode::Reference => (
            format!(
                "[result of {}] {} chars, reference_id={}. \
                 Call _get_result_detail(reference_id=\"{}\") to read the content.",
                record.skill_name, original_length, record.reference_id, record.reference_id
            ),
            false,
        ),
        RetentionMode::Pin => (format!("{PIN_MARKER}{}", record.content), true),
    };

    let mut metadata = Map::new();
    metadata.insert("original_length".into(), original_length.into());
    metadata.insert(
        "processed_length".into(),
        content.chars().count().into(),
    );
    metadata.insert(
        "retention_mode".into(),
        Value::String(policy.mode.as_str().to_string()),
    );
    metadata.insert("pinned".into(), Value::Bool(pinned));
    metadata.insert(
        "reference_id".into(),
        Value::String(record.reference_id.clone()),
    );

    RenderedResult { content, metadata }
}

/// Head ~60% + ellipsis + tail ~20% of `max_length`, plus a fetch hint.
fn summarize(content: &str, max_length: usize, reference_id: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    let head_len = max_length * 6 / 10;
    let tail_len = max_length * 2 / 10;
    let head: String = chars.iter().take(head_len).collect();
    let tail: String = chars[chars.len().saturating_sub(tail_len)..].iter().collect();
    format!(
        "{head}\n...\n{tail}\n[For full content, call _get_result_detail({reference_id})]"
    )
}
