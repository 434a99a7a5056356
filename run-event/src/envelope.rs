//! Streaming output envelope: the shape of one item yielded by a run stream.
//!
//! Every item carries `_status`, the current `_progress` list, and optionally a
//! plan summary, an artifact summary list, and (on the final item) `result`.
//! Consumers treat `answer` as cumulative and `delta` as incremental.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Run status carried in `_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// One progress entry: a serialized stage.
///
/// `answer` is the accumulated text; `delta` is the framework-computed
/// increment when the run streams in delta mode.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub stage: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Plan counters mirrored into `_plan` while a plan is active.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub plan_id: String,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub running_tasks: usize,
    pub pending_tasks: usize,
    pub failed_tasks: usize,
}

/// One item of a streaming run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(rename = "_status")]
    pub status: RunStatus,
    #[serde(rename = "_progress")]
    pub progress: Vec<ProgressEntry>,
    #[serde(rename = "_artifacts", skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Value>>,
    #[serde(rename = "_plan", skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl StreamEnvelope {
    /// A running envelope with the given progress and nothing else.
    pub fn running(progress: Vec<ProgressEntry>) -> Self {
        Self {
            model_name: None,
            status: RunStatus::Running,
            progress,
            artifacts: None,
            plan: None,
            result: None,
        }
    }

    /// A completed envelope carrying the final result.
    pub fn completed(progress: Vec<ProgressEntry>, result: Value) -> Self {
        Self {
            model_name: None,
            status: RunStatus::Completed,
            progress,
            artifacts: None,
            plan: None,
            result: Some(result),
        }
    }

    /// A failed envelope carrying the error text as `result`.
    pub fn failed(progress: Vec<ProgressEntry>, error: String) -> Self {
        Self {
            model_name: None,
            status: RunStatus::Failed,
            progress,
            artifacts: None,
            plan: None,
            result: Some(Value::String(error)),
        }
    }

    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = Some(name.into());
        self
    }

    pub fn with_plan(mut self, plan: PlanSummary) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Value>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}
