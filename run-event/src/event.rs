//! Sink-level event types: one tagged record per observable happening.
//! Consumers receive `(type, payload)`; the payload is the serialized variant body.

use serde::Serialize;
use serde_json::Value;

/// Sink event: wire shape for one `write(type, data)` call on an output sink.
/// The tag is the `type` string a renderer switches on.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkEvent {
    AgentStarted {
        agent_name: String,
    },
    AgentCompleted {
        agent_name: String,
        result: Value,
    },
    AgentFailed {
        agent_name: String,
        error: String,
    },
    AgentBlockStarted {
        agent_name: String,
        block_kind: String,
        block_index: usize,
    },
    AgentBlockCompleted {
        agent_name: String,
        block_kind: String,
        block_index: usize,
    },
    PlanCreated {
        plan_id: String,
        tasks: Vec<Value>,
        execution_mode: String,
        max_concurrency: usize,
    },
    PlanTaskUpdate {
        plan_id: String,
        task_id: String,
        status: String,
    },
    PlanTaskOutput {
        plan_id: String,
        task_id: String,
        output: String,
    },
    Text {
        content: String,
    },
    AnswerChunk {
        content: String,
    },
    ThinkingChunk {
        content: String,
    },
    SkillStart {
        name: String,
        args: Value,
    },
    SkillEnd {
        name: String,
        ok: bool,
    },
    ArtifactEvent {
        action: String,
        artifact_id: String,
        version: u32,
        summary: String,
    },
}

impl SinkEvent {
    /// The `type` tag for this event (same string the serialized form carries).
    pub fn kind(&self) -> &'static str {
        match self {
            SinkEvent::AgentStarted { .. } => "agent_started",
            SinkEvent::AgentCompleted { .. } => "agent_completed",
            SinkEvent::AgentFailed { .. } => "agent_failed",
            SinkEvent::AgentBlockStarted { .. } => "agent_block_started",
            SinkEvent::AgentBlockCompleted { .. } => "agent_block_completed",
            SinkEvent::PlanCreated { .. } => "plan_created",
            SinkEvent::PlanTaskUpdate { .. } => "plan_task_update",
            SinkEvent::PlanTaskOutput { .. } => "plan_task_output",
            SinkEvent::Text { .. } => "text",
            SinkEvent::AnswerChunk { .. } => "answer_chunk",
            SinkEvent::ThinkingChunk { .. } => "thinking_chunk",
            SinkEvent::SkillStart { .. } => "skill_start",
            SinkEvent::SkillEnd { .. } => "skill_end",
            SinkEvent::ArtifactEvent { .. } => "artifact_event",
        }
    }

    /// Serializes this event to a JSON object (type + payload).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
