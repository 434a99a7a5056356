//! Message model: typed roles, text-or-blocks content, tool-call descriptors.
//!
//! A message's `content` is either a plain string or a non-empty list of
//! content blocks (`text` or `image_url`). Assistant messages may carry
//! tool-call descriptors; tool messages must carry the matching
//! `tool_call_id`. Validation enforces the URL scheme policy from
//! [`UrlPolicy`].

mod content;
mod estimate;

pub use content::{
    append_content, extract_text, normalize, ContentBlock, ImageDetail, ImageUrl, MessageContent,
    UrlPolicy,
};
pub use estimate::TokenEstimator;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(other.to_string()),
        }
    }
}

/// One tool invocation requested by the assistant (`§` wire contract:
/// `{id, type: "function", function: {name, arguments}}` flattened).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDescriptor {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object, verbatim from the provider.
    pub arguments: String,
}

/// Errors raised by message construction and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("content list is empty")]
    EmptyContent,

    #[error("invalid url scheme: {0}")]
    InvalidUrlScheme(String),

    #[error("data url exceeds {limit} bytes")]
    DataUrlTooLarge { limit: usize },

    #[error("invalid image detail: {0}")]
    InvalidDetail(String),

    #[error("tool message requires tool_call_id")]
    MissingToolCallId,
}

/// A single conversation message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// Assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        tool_calls: Vec<ToolCallDescriptor>,
    ) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::text(Role::Assistant, text)
        }
    }

    /// Tool response matching one tool call by id.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::text(Role::Tool, content)
        }
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether `metadata.pinned == true`; pinned messages are inviolate to
    /// every compression strategy.
    pub fn is_pinned(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("pinned"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Character length: the text itself, or the sum over text blocks.
    pub fn length(&self) -> usize {
        match &self.content {
            MessageContent::Text(s) => s.chars().count(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.chars().count(),
                    ContentBlock::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }

    /// Validates content shape and URL policy per the message model rules.
    pub fn validate(&self, policy: &UrlPolicy) -> Result<(), MessageError> {
        if self.role == Role::Tool && self.tool_call_id.is_none() {
            return Err(MessageError::MissingToolCallId);
        }
        content::validate(&self.content, policy)
    }

    /// Extracted plain text; image blocks are ignored.
    pub fn text_content(&self) -> String {
        extract_text(&self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        let t = Message::tool("call_1", "out");
        assert_eq!(t.role, Role::Tool);
        assert_eq!(t.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn tool_message_without_call_id_fails_validation() {
        let mut m = Message::tool("call_1", "out");
        m.tool_call_id = None;
        assert_eq!(
            m.validate(&UrlPolicy::default()),
            Err(MessageError::MissingToolCallId)
        );
    }

    #[test]
    fn length_counts_text_blocks_only() {
        let m = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "abc".into(),
                },
                ContentBlock::ImageUrl {
                    image_url: ImageUrl::new("https://example.com/x.png"),
                },
                ContentBlock::Text {
                    text: "de".into(),
                },
            ]),
            tool_calls: None,
            tool_call_id: None,
            metadata: None,
        };
        assert_eq!(m.length(), 5);
    }

    #[test]
    fn pinned_flag_reads_from_metadata() {
        let mut meta = Map::new();
        meta.insert("pinned".into(), Value::Bool(true));
        let m = Message::user("x").with_metadata(meta);
        assert!(m.is_pinned());
        assert!(!Message::user("y").is_pinned());
    }

    #[test]
    fn message_roundtrips_through_json() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallDescriptor {
                id: "call_x".into(),
                name: "_now".into(),
                arguments: "{}".into(),
            }],
        );
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
