//! Context snapshots: serializable captures taken at step boundaries.
//!
//! A snapshot holds variables, bucketed messages, and plan state. Runtime
//! handles (tasks, locks, channels) and the runtime graph never appear here;
//! `restore(save(snapshot))` is structurally the identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{AgentContext, MessageSnapshot};
use crate::plan::TaskRegistry;
use crate::vars::VarSnapshot;

use super::FrameError;

pub const SCHEMA_VERSION: u32 = 1;

/// A full capture of a frame's context at one step boundary. Immutable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub snapshot_id: String,
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub variables: VarSnapshot,
    pub messages: MessageSnapshot,
    /// Engine-private state; reserved.
    pub runtime_state: Value,
    /// Serialized plan state (`TaskRegistry`), `null` when no plan exists.
    pub skillkit_state: Value,
}

impl ContextSnapshot {
    /// Captures the current context state.
    pub fn capture(ctx: &AgentContext, frame_id: &str) -> Result<Self, FrameError> {
        let registry = ctx
            .task_registry
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let skillkit_state = match registry.as_ref() {
            Some(r) => serde_json::to_value(r)
                .map_err(|e| FrameError::Serialization(e.to_string()))?,
            None => Value::Null,
        };
        Ok(Self {
            snapshot_id: format!("snap_{}", uuid::Uuid::new_v4().simple()),
            frame_id: frame_id.to_string(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            variables: ctx.vars.snapshot(),
            messages: ctx.messages.snapshot(),
            runtime_state: Value::Null,
            skillkit_state,
        })
    }

    /// Restores this snapshot into the context.
    pub fn apply(&self, ctx: &AgentContext) -> Result<(), FrameError> {
        ctx.vars.restore(&self.variables);
        ctx.messages.restore(&self.messages);
        let registry = match &self.skillkit_state {
            Value::Null => None,
            state => Some(
                serde_json::from_value::<TaskRegistry>(state.clone())
                    .map_err(|e| FrameError::Serialization(e.to_string()))?,
            ),
        };
        let mut slot = ctx.task_registry.lock().unwrap_or_else(|e| e.into_inner());
        *slot = registry;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BucketName;
    use crate::llm::MockDriver;
    use crate::message::Message;
    use crate::vars::SetMode;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> Arc<AgentContext> {
        AgentContext::builder("t")
            .driver(Arc::new(MockDriver::empty()))
            .build()
    }

    #[test]
    fn capture_apply_roundtrips_variables_and_messages() {
        let a = ctx();
        a.vars.set("x", json!({"k": 1}), SetMode::Overwrite).unwrap();
        a.messages.add(BucketName::History, Message::user("hello"));
        let snapshot = ContextSnapshot::capture(&a, "frame_1").unwrap();

        let b = ctx();
        snapshot.apply(&b).unwrap();
        assert_eq!(b.vars.get("x"), Some(json!({"k": 1})));
        assert_eq!(b.messages.bucket(BucketName::History)[0].text_content(), "hello");

        // Structural roundtrip through serde as well.
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: ContextSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn plan_state_travels_in_skillkit_state() {
        let a = ctx();
        {
            let mut slot = a.task_registry.lock().unwrap();
            *slot = Some(TaskRegistry::new(
                "plan_1",
                crate::plan::ExecutionMode::Sequential,
                1,
            ));
        }
        let snapshot = ContextSnapshot::capture(&a, "frame_1").unwrap();
        assert!(snapshot.skillkit_state.is_object());

        let b = ctx();
        snapshot.apply(&b).unwrap();
        let restored = b.task_registry.lock().unwrap();
        assert_eq!(restored.as_ref().unwrap().plan_id, "plan_1");
    }
}
