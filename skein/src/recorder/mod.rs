//! Runtime graph and recorder: Agent → Block → Progress → Stage.
//!
//! The recorder owns the observation tree for one run. Every stage mutation
//! mirrors the serialized progress into the reserved `_progress` variable
//! (so variable subscribers observe it) and pushes it to the attached
//! emitter, which the agent wraps into envelope items. The graph is
//! ephemeral; snapshots never include it.

mod stage;

pub use stage::{Stage, StageKind, StageStatus};

use std::sync::Mutex;

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use run_event::ProgressEntry;

use crate::vars::{SetMode, VariablePool};

/// Streaming mode for progress emission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamMode {
    /// `answer` is cumulative; no increments.
    #[default]
    Full,
    /// LLM stages additionally carry the per-update `delta` increment.
    Delta,
}

/// Partial update applied to a processing stage.
#[derive(Clone, Debug, Default)]
pub struct StageUpdate {
    pub answer: Option<String>,
    pub think: Option<String>,
    pub skill_info: Option<Value>,
    pub block_answer: Option<String>,
    pub metadata: Option<serde_json::Map<String, Value>>,
}

struct BlockRecord {
    #[allow(dead_code)]
    block_index: usize,
    #[allow(dead_code)]
    block_kind: String,
    stages: Vec<Stage>,
}

#[derive(Default)]
struct RecorderInner {
    blocks: Vec<BlockRecord>,
    mode: StreamMode,
    emitter: Option<UnboundedSender<Vec<ProgressEntry>>>,
}

/// Per-context recorder.
pub struct Recorder {
    inner: Mutex<RecorderInner>,
    vars: Arc<VariablePool>,
}

impl Recorder {
    pub fn new(vars: Arc<VariablePool>) -> Self {
        Self {
            inner: Mutex::new(RecorderInner::default()),
            vars,
        }
    }

    /// Attaches the progress emitter for a streaming run.
    pub fn set_emitter(&self, emitter: UnboundedSender<Vec<ProgressEntry>>, mode: StreamMode) {
        let mut inner = self.lock();
        inner.emitter = Some(emitter);
        inner.mode = mode;
    }

    pub fn clear_emitter(&self) {
        self.lock().emitter = None;
    }

    /// Opens a new block record; subsequent stages belong to it.
    pub fn start_block(&self, block_index: usize, block_kind: &str) {
        let mut inner = self.lock();
        inner.blocks.push(BlockRecord {
            block_index,
            block_kind: block_kind.to_string(),
            stages: Vec::new(),
        });
    }

    /// Opens a stage in the current block and returns its id.
    pub fn start_stage(&self, kind: StageKind, agent_name: &str) -> String {
        let id = format!("stage_{}", Uuid::new_v4().simple());
        {
            let mut inner = self.lock();
            if inner.blocks.is_empty() {
                inner.blocks.push(BlockRecord {
                    block_index: 0,
                    block_kind: String::new(),
                    stages: Vec::new(),
                });
            }
            let stage = Stage::new(id.clone(), kind, agent_name.to_string());
            if let Some(block) = inner.blocks.last_mut() {
                block.stages.push(stage);
            }
        }
        self.mirror();
        id
    }

    /// Applies a partial update to a processing stage.
    pub fn update_stage(&self, id: &str, update: StageUpdate) {
        {
            let mut inner = self.lock();
            if let Some(stage) = find_stage(&mut inner, id) {
                if let Some(answer) = update.answer {
                    stage.answer = answer;
                }
                if let Some(think) = update.think {
                    stage.think = think;
                }
                if let Some(skill_info) = update.skill_info {
                    stage.skill_info = Some(skill_info);
                }
                if let Some(block_answer) = update.block_answer {
                    stage.block_answer = Some(block_answer);
                }
                if let Some(metadata) = update.metadata {
                    for (k, v) in metadata {
                        stage.metadata.insert(k, v);
                    }
                }
                stage.updated_at = chrono::Utc::now();
            }
        }
        self.mirror();
    }

    /// Closes a stage with a terminal status.
    pub fn end_stage(&self, id: &str, status: StageStatus) {
        {
            let mut inner = self.lock();
            if let Some(stage) = find_stage(&mut inner, id) {
                stage.status = status;
                stage.updated_at = chrono::Utc::now();
            }
        }
        self.mirror();
    }

    /// All stages of the run, flattened in execution order.
    pub fn progress(&self) -> Vec<ProgressEntry> {
        let mut inner = self.lock();
        let mode = inner.mode;
        inner
            .blocks
            .iter_mut()
            .flat_map(|b| b.stages.iter_mut())
            .map(|s| s.to_progress_entry(mode == StreamMode::Delta))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mirrors progress into `_progress` and pushes it to the emitter.
    fn mirror(&self) {
        let entries = self.progress();
        let serialized = serde_json::to_value(&entries).unwrap_or(Value::Array(Vec::new()));
        let _ = self
            .vars
            .set_reserved("_progress", serialized, SetMode::Overwrite);
        let inner = self.lock();
        if let Some(emitter) = &inner.emitter {
            let _ = emitter.send(entries);
        }
    }
}

fn find_stage<'a>(inner: &'a mut RecorderInner, id: &str) -> Option<&'a mut Stage> {
    inner
        .blocks
        .iter_mut()
        .rev()
        .flat_map(|b| b.stages.iter_mut())
        .find(|s| s.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (Recorder, Arc<VariablePool>) {
        let vars = Arc::new(VariablePool::new());
        (Recorder::new(Arc::clone(&vars)), vars)
    }

    #[test]
    fn stage_lifecycle_mirrors_progress_variable() {
        let (rec, vars) = recorder();
        rec.start_block(0, "prompt");
        let id = rec.start_stage(StageKind::Llm, "agent");
        rec.update_stage(
            &id,
            StageUpdate {
                answer: Some("Hello".into()),
                ..Default::default()
            },
        );
        rec.end_stage(&id, StageStatus::Completed);

        let progress = vars.get("_progress").unwrap();
        assert_eq!(progress[0]["stage"], "llm");
        assert_eq!(progress[0]["status"], "completed");
        assert_eq!(progress[0]["answer"], "Hello");
    }

    #[test]
    fn stages_flatten_across_blocks_in_order() {
        let (rec, _) = recorder();
        rec.start_block(0, "explore");
        let a = rec.start_stage(StageKind::Llm, "agent");
        rec.end_stage(&a, StageStatus::Completed);
        let b = rec.start_stage(StageKind::Skill, "agent");
        rec.end_stage(&b, StageStatus::Completed);
        rec.start_block(1, "prompt");
        let c = rec.start_stage(StageKind::Llm, "agent");
        rec.end_stage(&c, StageStatus::Completed);

        let entries = rec.progress();
        let kinds: Vec<&str> = entries.iter().map(|e| e.stage.as_str()).collect();
        assert_eq!(kinds, vec!["llm", "skill", "llm"]);
    }

    #[tokio::test]
    async fn emitter_receives_every_mutation() {
        let (rec, _) = recorder();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        rec.set_emitter(tx, StreamMode::Full);
        let id = rec.start_stage(StageKind::Llm, "agent");
        rec.update_stage(
            &id,
            StageUpdate {
                answer: Some("x".into()),
                ..Default::default()
            },
        );
        rec.end_stage(&id, StageStatus::Completed);

        let mut updates = Vec::new();
        while let Ok(u) = rx.try_recv() {
            updates.push(u);
        }
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[2][0].status, "completed");
    }

    #[test]
    fn delta_mode_computes_increments_per_emission() {
        let (rec, vars) = recorder();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        rec.set_emitter(tx, StreamMode::Delta);
        let id = rec.start_stage(StageKind::Llm, "agent");
        rec.update_stage(
            &id,
            StageUpdate {
                answer: Some("He".into()),
                ..Default::default()
            },
        );
        rec.update_stage(
            &id,
            StageUpdate {
                answer: Some("Hello".into()),
                ..Default::default()
            },
        );
        let mut deltas = Vec::new();
        while let Ok(u) = rx.try_recv() {
            if let Some(d) = &u[0].delta {
                deltas.push(d.clone());
            }
        }
        assert_eq!(deltas.concat(), "Hello");
        // The mirrored variable still carries the cumulative answer.
        let progress = vars.get("_progress").unwrap();
        assert_eq!(progress[0]["answer"], "Hello");
    }

    #[test]
    fn skill_metadata_merges_incrementally() {
        let (rec, _) = recorder();
        let id = rec.start_stage(StageKind::Skill, "agent");
        let mut meta = serde_json::Map::new();
        meta.insert("error".into(), json!(true));
        rec.update_stage(
            &id,
            StageUpdate {
                metadata: Some(meta),
                ..Default::default()
            },
        );
        let entries = rec.progress();
        assert_eq!(entries[0].metadata.as_ref().unwrap()["error"], json!(true));
    }
}
