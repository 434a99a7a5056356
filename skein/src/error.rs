//! Runtime error umbrella.
//!
//! Subsystems carry their own error enums (`MessageError`, `VarError`,
//! `CacheError`, `SkillError`, `LlmError`, `FrameError`, `HookError`); this
//! module folds them into [`RuntimeError`] at the block/explore boundary.
//! Interrupts are typed variants, never panics: `UserInterrupt` pauses the
//! frame, `ToolInterrupt` parks it waiting for intervention.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::CacheError;
use crate::explore::HookError;
use crate::frame::FrameError;
use crate::llm::LlmError;
use crate::message::MessageError;
use crate::skill::SkillError;
use crate::vars::VarError;

/// Request for user intervention raised from inside a skill.
///
/// Propagates untouched through the dispatcher and the explore loop; the
/// frame engine converts it into `waiting_for_intervention`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInterrupt {
    pub tool: String,
    pub args: Value,
}

/// Top-level runtime error.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Parse(#[from] skein_dsl::ParseError),

    #[error("message: {0}")]
    Message(#[from] MessageError),

    #[error("variable: {0}")]
    Variable(#[from] VarError),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("skill: {0}")]
    Skill(SkillError),

    #[error("llm: {0}")]
    Llm(#[from] LlmError),

    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    #[error("hook: {0}")]
    Hook(#[from] HookError),

    #[error("interrupted by user")]
    UserInterrupt,

    #[error("tool interrupt: {}", .0.tool)]
    ToolInterrupt(ToolInterrupt),

    #[error("configuration: {0}")]
    Config(String),

    #[error("output format: {0}")]
    OutputFormat(String),

    #[error("context budget exceeded: {estimated} tokens estimated, {budget} available")]
    BudgetExceeded { estimated: u32, budget: u32 },

    #[error("invalid agent state: {0}")]
    InvalidState(String),

    #[error("at block {index} ({kind}): {message}")]
    AtBlock {
        index: usize,
        kind: String,
        message: String,
    },
}

impl From<SkillError> for RuntimeError {
    fn from(err: SkillError) -> Self {
        // Interrupts keep their identity across the skill boundary so the
        // frame engine can route them.
        match err {
            SkillError::Interrupt(ti) => RuntimeError::ToolInterrupt(ti),
            SkillError::UserInterrupt => RuntimeError::UserInterrupt,
            other => RuntimeError::Skill(other),
        }
    }
}

impl RuntimeError {
    /// Attaches block position to an error crossing the executor boundary.
    pub fn at_block(self, index: usize, kind: &str) -> RuntimeError {
        match self {
            // Interrupts must stay matchable; position travels in the frame.
            RuntimeError::UserInterrupt | RuntimeError::ToolInterrupt(_) => self,
            other => RuntimeError::AtBlock {
                index,
                kind: kind.to_string(),
                message: other.to_string(),
            },
        }
    }
}
