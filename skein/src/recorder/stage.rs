//! Stage records: the atomic observable steps of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use run_event::ProgressEntry;

/// Stage kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Llm,
    Skill,
    Assign,
    ToolCall,
    ToolResponse,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Llm => "llm",
            StageKind::Skill => "skill",
            StageKind::Assign => "assign",
            StageKind::ToolCall => "tool_call",
            StageKind::ToolResponse => "tool_response",
        }
    }
}

/// Stage status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Processing => "processing",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Processing)
    }
}

/// One atomic observable step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub kind: StageKind,
    pub status: StageStatus,
    pub agent_name: String,
    /// Running (then final) answer text.
    pub answer: String,
    /// Running reasoning text.
    pub think: String,
    /// `{name, args, output?}` for skill stages.
    pub skill_info: Option<Value>,
    /// Final answer of the owning block, set on the closing stage.
    pub block_answer: Option<String>,
    pub metadata: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Chars of `answer` already surfaced to delta-mode subscribers.
    #[serde(skip)]
    pub emitted_len: usize,
}

impl Stage {
    pub fn new(id: String, kind: StageKind, agent_name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            status: StageStatus::Processing,
            agent_name,
            answer: String::new(),
            think: String::new(),
            skill_info: None,
            block_answer: None,
            metadata: Map::new(),
            started_at: now,
            updated_at: now,
            emitted_len: 0,
        }
    }

    /// Converts to the envelope shape. When `with_delta`, the increment since
    /// the last conversion is attached and the emitted watermark advances.
    pub fn to_progress_entry(&mut self, with_delta: bool) -> ProgressEntry {
        let delta = if with_delta && self.kind == StageKind::Llm {
            let chars: Vec<char> = self.answer.chars().collect();
            let new: String = chars[self.emitted_len.min(chars.len())..].iter().collect();
            self.emitted_len = chars.len();
            if new.is_empty() {
                None
            } else {
                Some(new)
            }
        } else {
            None
        };

        let (tool_name, tool_input, tool_output) = match &self.skill_info {
            Some(info) => (
                info.get("name").and_then(Value::as_str).map(str::to_string),
                info.get("args").cloned(),
                info.get("output").and_then(Value::as_str).map(str::to_string),
            ),
            None => (None, None, None),
        };

        ProgressEntry {
            stage: self.kind.as_str().to_string(),
            status: self.status.as_str().to_string(),
            answer: if self.answer.is_empty() && self.kind != StageKind::Llm {
                None
            } else {
                Some(self.answer.clone())
            },
            delta,
            think: if self.think.is_empty() {
                None
            } else {
                Some(self.think.clone())
            },
            skill_info: self.skill_info.clone(),
            tool_name,
            tool_input,
            tool_output,
            id: self.id.clone(),
            metadata: if self.metadata.is_empty() {
                None
            } else {
                Some(self.metadata.clone())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_entry_carries_skill_fields() {
        let mut stage = Stage::new("s1".into(), StageKind::Skill, "agent".into());
        stage.skill_info = Some(json!({
            "name": "search",
            "args": {"q": "x"},
            "output": "found it",
        }));
        stage.answer = "found it".into();
        let entry = stage.to_progress_entry(false);
        assert_eq!(entry.stage, "skill");
        assert_eq!(entry.tool_name.as_deref(), Some("search"));
        assert_eq!(entry.tool_input, Some(json!({"q": "x"})));
        assert_eq!(entry.tool_output.as_deref(), Some("found it"));
    }

    #[test]
    fn delta_is_incremental_and_watermarked() {
        let mut stage = Stage::new("s1".into(), StageKind::Llm, "agent".into());
        stage.answer = "Hel".into();
        assert_eq!(stage.to_progress_entry(true).delta.as_deref(), Some("Hel"));
        stage.answer = "Hello".into();
        let entry = stage.to_progress_entry(true);
        assert_eq!(entry.delta.as_deref(), Some("lo"));
        assert_eq!(entry.answer.as_deref(), Some("Hello"));
        // No new content, no delta.
        assert_eq!(stage.to_progress_entry(true).delta, None);
    }

    #[test]
    fn non_llm_stages_never_carry_delta() {
        let mut stage = Stage::new("s1".into(), StageKind::Skill, "agent".into());
        stage.answer = "output".into();
        assert_eq!(stage.to_progress_entry(true).delta, None);
    }
}
