//! Per-call skill context: the handle a skill receives while executing.

use std::sync::Arc;

use serde_json::{Map, Value};

use run_event::{OutputSink, SinkEvent};

use crate::cache::ResultCache;
use crate::context::AgentContext;
use crate::vars::{SetMode, VarError, VariablePool};

use super::SkillError;

/// Handle passed into every skill call.
///
/// Exposes variable pool read/write, the user-interrupt check, the output
/// sink, and the result cache. Subtask contexts carry `task_id`/`plan_id`
/// tags that are injected into every sink write.
#[derive(Clone)]
pub struct SkillContext {
    ctx: Arc<AgentContext>,
}

impl SkillContext {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// The owning agent context.
    pub fn agent(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn agent_name(&self) -> &str {
        &self.ctx.agent_name
    }

    pub fn vars(&self) -> &VariablePool {
        &self.ctx.vars
    }

    /// Read-through variable access (checks the parent pool for COW children).
    pub fn get_var(&self, path: &str) -> Option<Value> {
        self.ctx.get_var(path)
    }

    pub fn set_var(&self, path: &str, value: Value, mode: SetMode) -> Result<(), VarError> {
        self.ctx.vars.set(path, value, mode)
    }

    pub fn cache(&self) -> &Arc<dyn ResultCache> {
        &self.ctx.cache
    }

    /// Maps the shared user-interrupt flag into a typed error. Skills call
    /// this at their own suspension points (`_wait` does, once per second).
    pub fn check_interrupt(&self) -> Result<(), SkillError> {
        if self.ctx.interrupt_requested() {
            Err(SkillError::UserInterrupt)
        } else {
            Ok(())
        }
    }

    /// Writes an event to the output sink, with subtask tags injected.
    pub fn write_output(&self, event: &SinkEvent) {
        self.ctx.write_output(event);
    }

    /// Raw sink write for skill-specific payloads.
    pub fn write_raw(&self, kind: &str, mut data: Value) {
        if let Some(obj) = data.as_object_mut() {
            for (k, v) in self.tags() {
                obj.entry(k).or_insert(v);
            }
        }
        self.ctx.sink.write(kind, data);
    }

    fn tags(&self) -> Map<String, Value> {
        self.ctx.tags.clone()
    }
}
