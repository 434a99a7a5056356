//! Skills and skillkits: the callable surface an agent exposes to the LLM.
//!
//! A [`Skill`] is a named async callable with a JSON argument schema, a
//! category, and an optional context-retention policy describing how its
//! results are represented in future LLM context. Skills group into
//! [`Skillkit`]s; the [`SkillRegistry`](registry::SkillRegistry) enforces
//! unique names and generates the function-call tool schema for drivers.

mod context;
mod detail;
mod dispatch;
mod fn_skill;
mod registry;
mod retention;

pub use context::SkillContext;
pub use detail::DetailSkill;
pub use dispatch::{canonical_json, invoke, Deduplicator, InvokeOutcome};
pub use fn_skill::{FnSkill, FnSkillkit};
pub use registry::SkillRegistry;
pub use retention::{on_before_send_to_context, RenderedResult, PIN_MARKER};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ToolInterrupt;

/// Skill category, used for grouping and display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillCategory {
    System,
    #[default]
    User,
    Resource,
}

/// How a skill's result is represented in future LLM context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    #[default]
    Full,
    Summary,
    Reference,
    Pin,
}

impl RetentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionMode::Full => "full",
            RetentionMode::Summary => "summary",
            RetentionMode::Reference => "reference",
            RetentionMode::Pin => "pin",
        }
    }
}

/// Per-skill context-retention policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub mode: RetentionMode,
    /// Length threshold above which `summary` truncates.
    pub max_length: usize,
    /// Turns a processed result stays in context before eligible for
    /// compression; `None` means indefinitely.
    pub ttl_turns: Option<u32>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            mode: RetentionMode::Full,
            max_length: 4000,
            ttl_turns: None,
        }
    }
}

/// Static description of one skill.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkillSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the argument object.
    pub input_schema: Value,
    #[serde(default)]
    pub category: SkillCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,
}

/// Errors raised by skill resolution and execution.
#[derive(Debug, Error)]
pub enum SkillError {
    #[error("unknown skill: {0}")]
    Unknown(String),

    #[error("duplicate skill name: {0}")]
    Duplicate(String),

    #[error("invalid arguments for {skill}: {reason}")]
    InvalidArgs { skill: String, reason: String },

    #[error("{skill} failed: {reason}")]
    Execution { skill: String, reason: String },

    #[error("tool interrupt: {}", .0.tool)]
    Interrupt(ToolInterrupt),

    #[error("interrupted by user")]
    UserInterrupt,

    #[error("cache: {0}")]
    Cache(#[from] crate::cache::CacheError),
}

/// One callable tool.
///
/// The `ctx` handle exposes variable pool access, the interrupt check, the
/// output sink, and the result cache. A skill that needs user intervention
/// returns [`SkillError::Interrupt`]; the dispatcher propagates it untouched.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Unique name within a registry scope.
    fn name(&self) -> &str;

    /// Spec used for tool-schema generation and retention lookup.
    fn spec(&self) -> SkillSpec;

    /// Executes the skill. `args` is the parsed argument object.
    async fn call(&self, args: Value, ctx: &SkillContext) -> Result<Value, SkillError>;
}

/// A named group of skills registered as a unit.
pub trait Skillkit: Send + Sync {
    fn name(&self) -> &str;

    fn skills(&self) -> Vec<std::sync::Arc<dyn Skill>>;

    /// Kits marked here are filtered out of subtask registries (the plan kit
    /// always is, so subtasks cannot re-plan).
    fn exclude_from_subtask(&self) -> bool {
        false
    }
}
