//! Coroutine engine: execution frames, snapshots, pause/resume/terminate.
//!
//! A frame is a resumable execution position over a parsed block list. The
//! registry drives frames one atomic step at a time; each step restores the
//! context from the frame's snapshot, executes one unit (one block, or one
//! LLM-turn-plus-tool-responses inside explore), and commits a new snapshot
//! under the three-phase protocol: pending write → CAS frame update →
//! finalize. Interrupts become frame states, never panics.

mod handle;
mod registry;
mod snapshot;
mod store;

pub use handle::{HandleIssuer, ResumeHandle};
pub use registry::{FrameRegistry, StepOutcome};
pub use snapshot::ContextSnapshot;
pub use store::{
    FsSnapshotStore, InMemorySnapshotStore, JournalEntry, RecoveryReport, SnapshotStore,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from the frame engine and snapshot stores.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame not found: {0}")]
    NotFound(String),

    #[error("version conflict on frame {frame_id}: expected {expected}, found {found}")]
    Conflict {
        frame_id: String,
        expected: u64,
        found: u64,
    },

    #[error("snapshot not found: {frame_id}/{snapshot_id}")]
    SnapshotNotFound {
        frame_id: String,
        snapshot_id: String,
    },

    #[error("snapshot store: {0}")]
    Store(String),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("invalid resume handle: {0}")]
    InvalidHandle(String),

    #[error("frame {frame_id} is not resumable (status {status})")]
    NotResumable { frame_id: String, status: String },

    #[error("pause did not reach a step boundary in time")]
    PauseTimeout,
}

/// Frame status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Running,
    Paused,
    Completed,
    Failed,
    WaitingForIntervention,
    Terminated,
}

impl FrameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameStatus::Running => "running",
            FrameStatus::Paused => "paused",
            FrameStatus::Completed => "completed",
            FrameStatus::Failed => "failed",
            FrameStatus::WaitingForIntervention => "waiting_for_intervention",
            FrameStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FrameStatus::Completed | FrameStatus::Failed | FrameStatus::Terminated
        )
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            FrameStatus::Paused | FrameStatus::WaitingForIntervention
        )
    }
}

/// Runtime position inside a compound or resumable block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockStackEntry {
    pub block_index: usize,
    /// Serialized executor state (e.g. the explore turn state).
    pub state: Value,
}

/// Structured error recorded on a failed or interrupted frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameErrorInfo {
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    pub at_block: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervention_snapshot_id: Option<String>,
}

/// A resumable execution position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionFrame {
    pub frame_id: String,
    pub parent_id: Option<String>,
    pub agent_id: String,
    pub block_pointer: usize,
    pub block_stack: Vec<BlockStackEntry>,
    pub status: FrameStatus,
    /// Cooperative pause request; honored at the next step boundary.
    pub desired_pause: bool,
    pub context_snapshot_id: String,
    pub children: Vec<String>,
    /// Optimistic-concurrency version; bumped on every mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The agent file this frame executes.
    pub original_content: String,
    pub error: Option<FrameErrorInfo>,
}

impl ExecutionFrame {
    pub fn new(agent_id: &str, content: &str) -> Self {
        let now = Utc::now();
        Self {
            frame_id: format!("frame_{}", uuid::Uuid::new_v4().simple()),
            parent_id: None,
            agent_id: agent_id.to_string(),
            block_pointer: 0,
            block_stack: Vec::new(),
            status: FrameStatus::Running,
            desired_pause: false,
            context_snapshot_id: String::new(),
            children: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            original_content: content.to_string(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(FrameStatus::Completed.is_terminal());
        assert!(FrameStatus::Terminated.is_terminal());
        assert!(!FrameStatus::Paused.is_terminal());
        assert!(FrameStatus::Paused.is_resumable());
        assert!(FrameStatus::WaitingForIntervention.is_resumable());
        assert!(!FrameStatus::Running.is_resumable());
    }

    #[test]
    fn frame_roundtrips_through_serde() {
        let mut frame = ExecutionFrame::new("agent", "@prompt -> x\nhi\n@end\n");
        frame.error = Some(FrameErrorInfo {
            error_type: "ToolInterrupt".into(),
            message: "approve".into(),
            tool_name: Some("approve".into()),
            tool_args: Some(serde_json::json!({"k": 1})),
            at_block: 0,
            intervention_snapshot_id: Some("snap_1".into()),
        });
        let json = serde_json::to_string(&frame).unwrap();
        let back: ExecutionFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.frame_id, frame.frame_id);
        assert_eq!(back.error, frame.error);
        assert_eq!(back.status, FrameStatus::Running);
    }
}
