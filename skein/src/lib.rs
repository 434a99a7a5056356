//! Skein: an agent runtime.
//!
//! Skein executes agent files — ordered sequences of typed blocks (`prompt`,
//! `explore`, `judge`, `tool`, `assign`, `if`, `for`, `parallel`) — against a
//! shared context holding variables, bucketed messages, a skill registry,
//! a result cache, a recorder, and a frame registry. The explore engine runs
//! a ReAct loop (LLM turns interleaved with sequential tool execution); the
//! frame engine makes every run resumable through snapshots with
//! pause/resume/terminate semantics.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skein::{Agent, MockDriver, ScriptedTurn};
//!
//! # async fn demo() -> Result<(), skein::RuntimeError> {
//! let agent = Agent::builder("greeter", "@prompt -> greeting\nSay hello\n@end\n")
//!     .driver(Arc::new(MockDriver::script(vec![ScriptedTurn::text("Hello")])))
//!     .build()?;
//! let answer = agent.achat("hi").await?;
//! assert_eq!(answer, serde_json::json!("Hello"));
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`message`]: typed messages with text-or-blocks content and token
//!   estimation.
//! - [`vars`]: the concurrency-safe variable pool with dotted-path access.
//! - [`skill`]: skills, skillkits, the registry, dispatch, and retention.
//! - [`cache`]: the result cache behind opaque reference ids.
//! - [`context`]: the agent context, buckets, and budget-aware assembly.
//! - [`llm`]: the streaming driver abstraction and implementations.
//! - [`explore`]: the ReAct loop.
//! - [`blocks`]: the other block executors.
//! - [`recorder`]: the runtime observation graph.
//! - [`frame`]: the coroutine engine (frames, snapshots, resume handles).
//! - [`agent`]: the lifecycle state machine and streaming entrypoints.
//! - [`plan`]: the plan skillkit and task registry.
//! - [`artifact`]: the versioned artifact store.

pub mod agent;
pub mod artifact;
pub mod blocks;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod explore;
pub mod frame;
pub mod llm;
pub mod message;
pub mod plan;
pub mod recorder;
pub mod skill;
pub mod vars;

pub use agent::{Agent, AgentBuilder, AgentEvent, AgentState};
pub use cache::{InMemoryResultCache, ResultCache, ResultRecord};
pub use config::{CacheConfig, DriverConfig, ExploreConfig, SnapshotGcConfig};
pub use context::{
    AgentContext, BucketName, CompressionConfig, CompressionStrategy, MessageStore, MultimodalMode,
};
pub use error::{RuntimeError, ToolInterrupt};
pub use explore::{ExploreOutcome, HookHandler, HookResult, OutputFormat};
pub use frame::{
    ContextSnapshot, ExecutionFrame, FrameRegistry, FrameStatus, FsSnapshotStore,
    InMemorySnapshotStore, ResumeHandle, SnapshotStore, StepOutcome,
};
pub use llm::{ChatChunk, ChatParams, LlmDriver, LlmUsage, MockDriver, OpenAiDriver, ScriptedTurn};
pub use message::{ContentBlock, Message, MessageContent, Role, TokenEstimator, UrlPolicy};
pub use plan::{ExecutionMode, PlanSkillkit, TaskRegistry, TaskStatus};
pub use recorder::{Recorder, Stage, StageKind, StageStatus, StreamMode};
pub use skill::{
    Deduplicator, FnSkill, FnSkillkit, RetentionMode, RetentionPolicy, Skill, SkillContext,
    SkillError, SkillRegistry, SkillSpec, Skillkit,
};
pub use vars::{SetMode, VariablePool};

// The DSL parser and the event/envelope wire types are re-exported so
// downstream crates need only one dependency.
pub use run_event::{
    OutputSink, PlanSummary, ProgressEntry, RunStatus, SinkEvent, StreamEnvelope,
};
pub use skein_dsl::{parse_agent_file, Block, BlockKind, ParseError};
