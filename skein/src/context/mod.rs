//! Agent context: the shared state every block executes against.
//!
//! A context owns the variable pool, the bucketed message store, the
//! recorder, the optional task registry (plan state), and references to the
//! skill registry, result cache, LLM driver, and output sink. Plan subtasks
//! and hook verifiers run in a copy-on-write child context: variables read
//! through the parent, writes stay local, messages are child-local, and the
//! interrupt flag and sink are shared (sink writes carry task tags).

mod bucket;
mod engineer;

pub use bucket::{BucketName, MessageSnapshot, MessageStore, ASSEMBLY_ORDER};
pub use engineer::{
    assemble, assemble_checked, CompressionConfig, CompressionStrategy, MultimodalMode,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use run_event::{NullSink, OutputSink, PlanSummary, SinkEvent};

use crate::cache::{InMemoryResultCache, ResultCache};
use crate::config::ExploreConfig;
use crate::error::RuntimeError;
use crate::frame::FrameRegistry;
use crate::llm::LlmDriver;
use crate::message::{Message, TokenEstimator, UrlPolicy};
use crate::plan::{PlanRuntime, TaskRegistry};
use crate::recorder::Recorder;
use crate::skill::SkillRegistry;
use crate::vars::{SetMode, VarError, VariablePool};

/// Shared execution context. Constructed through [`AgentContext::builder`].
pub struct AgentContext {
    pub agent_name: String,
    pub vars: Arc<VariablePool>,
    pub messages: MessageStore,
    pub skills: Arc<SkillRegistry>,
    pub cache: Arc<dyn ResultCache>,
    pub driver: Arc<dyn LlmDriver>,
    pub sink: Arc<dyn OutputSink>,
    pub recorder: Recorder,
    pub compression: CompressionConfig,
    pub estimator: TokenEstimator,
    pub url_policy: UrlPolicy,
    pub explore: ExploreConfig,
    /// Agent files addressable by `on_stop = "@name"` hook handlers.
    pub hook_agents: HashMap<String, String>,
    /// Plan state; all persistent plan data lives here.
    pub task_registry: Mutex<Option<TaskRegistry>>,
    /// Plan runtime handles; never serialized.
    pub plan_runtime: PlanRuntime,
    /// Frame tree for this context.
    pub frames: Arc<FrameRegistry>,
    /// Tags injected into sink writes (`task_id`, `plan_id` for subtasks).
    pub tags: Map<String, Value>,
    /// Cancellation root for this context; children get child tokens.
    pub cancel: CancellationToken,
    interrupt: Arc<AtomicBool>,
    parent_vars: Option<Arc<VariablePool>>,
}

impl AgentContext {
    pub fn builder(agent_name: impl Into<String>) -> AgentContextBuilder {
        AgentContextBuilder::new(agent_name)
    }

    // ---- interrupts ----

    /// Raises the shared user-interrupt flag; observed at every suspension point.
    pub fn request_user_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn clear_user_interrupt(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
    }

    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Typed check used by the explore loop and `_wait`.
    pub fn check_user_interrupt(&self) -> Result<(), RuntimeError> {
        if self.interrupt_requested() {
            Err(RuntimeError::UserInterrupt)
        } else {
            Ok(())
        }
    }

    // ---- messages ----

    /// Validates a message against the configured URL policy and appends it
    /// to a bucket. Every runtime-produced message goes through here, so the
    /// scheme policy holds for skill results and multimodal model output
    /// alike, not just caller-constructed input.
    pub fn add_message(&self, bucket: BucketName, message: Message) -> Result<(), RuntimeError> {
        message.validate(&self.url_policy)?;
        self.messages.add(bucket, message);
        Ok(())
    }

    // ---- variables (read-through for COW children) ----

    /// Reads a variable; COW children fall back to the parent pool.
    pub fn get_var(&self, path: &str) -> Option<Value> {
        self.vars
            .get(path)
            .or_else(|| self.parent_vars.as_ref().and_then(|p| p.get(path)))
    }

    pub fn set_var(&self, path: &str, value: Value, mode: SetMode) -> Result<(), VarError> {
        self.vars.set(path, value, mode)
    }

    /// Copies the named local variables into the parent pool. The only way a
    /// subtask writes back; default is no merge.
    pub fn merge_to_parent(&self, keys: &[String]) -> Result<(), VarError> {
        let Some(parent) = &self.parent_vars else {
            return Ok(());
        };
        for key in keys {
            if let Some(value) = self.vars.get(key) {
                parent.set(key, value, SetMode::Overwrite)?;
            }
        }
        Ok(())
    }

    // ---- plan ----

    /// True while a plan exists with any non-terminal task. The explore loop
    /// must not stop while this holds.
    pub fn has_active_plan(&self) -> bool {
        let registry = self.task_registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.as_ref().map(|r| !r.is_all_done()).unwrap_or(false)
    }

    pub fn plan_summary(&self) -> Option<PlanSummary> {
        let registry = self.task_registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.as_ref().map(TaskRegistry::summary)
    }

    /// Tears down plan state (registry and runtime handles).
    pub fn disable_plan(&self) {
        let mut registry = self.task_registry.lock().unwrap_or_else(|e| e.into_inner());
        *registry = None;
        self.plan_runtime.cancel_all();
    }

    // ---- output ----

    /// Writes a typed event to the sink, injecting subtask tags.
    pub fn write_output(&self, event: &SinkEvent) {
        if self.tags.is_empty() {
            self.sink.write_event(event);
            return;
        }
        let Ok(mut value) = event.to_value() else {
            return;
        };
        if let Some(obj) = value.as_object_mut() {
            obj.remove("type");
            for (k, v) in &self.tags {
                obj.entry(k.clone()).or_insert(v.clone());
            }
        }
        self.sink.write(event.kind(), value);
    }

    // ---- COW children ----

    /// Copy-on-write child for a plan subtask: fresh variables reading
    /// through the parent, child-local messages and recorder, filtered skill
    /// registry, shared interrupt flag, tagged sink writes.
    pub fn child_for_subtask(
        self: &Arc<Self>,
        task_id: &str,
        plan_id: &str,
    ) -> Arc<AgentContext> {
        let mut tags = Map::new();
        tags.insert("task_id".into(), Value::String(task_id.to_string()));
        tags.insert("plan_id".into(), Value::String(plan_id.to_string()));
        self.cow_child(format!("{}/{}", self.agent_name, task_id), tags, true)
    }

    /// Copy-on-write child for an `on_stop` verifier agent. The verifier sees
    /// the full skill registry minus subtask-excluded kits.
    pub fn child_for_hook(self: &Arc<Self>, hook_name: &str) -> Arc<AgentContext> {
        let mut tags = Map::new();
        tags.insert("hook".into(), Value::String(hook_name.to_string()));
        self.cow_child(format!("{}#{}", self.agent_name, hook_name), tags, true)
    }

    fn cow_child(
        self: &Arc<Self>,
        name: String,
        tags: Map<String, Value>,
        filter_skills: bool,
    ) -> Arc<AgentContext> {
        let vars = Arc::new(VariablePool::new());
        let skills = if filter_skills {
            Arc::new(self.skills.subtask_view())
        } else {
            Arc::clone(&self.skills)
        };
        Arc::new(AgentContext {
            agent_name: name,
            recorder: Recorder::new(Arc::clone(&vars)),
            vars,
            messages: MessageStore::new(),
            skills,
            cache: Arc::clone(&self.cache),
            driver: Arc::clone(&self.driver),
            sink: Arc::clone(&self.sink),
            compression: self.compression.clone(),
            estimator: self.estimator.clone(),
            url_policy: self.url_policy.clone(),
            explore: self.explore.clone(),
            hook_agents: self.hook_agents.clone(),
            task_registry: Mutex::new(None),
            plan_runtime: PlanRuntime::default(),
            frames: Arc::new(FrameRegistry::in_memory()),
            tags,
            cancel: self.cancel.child_token(),
            interrupt: Arc::clone(&self.interrupt),
            parent_vars: Some(Arc::clone(&self.vars)),
        })
    }
}

/// Builder for [`AgentContext`].
pub struct AgentContextBuilder {
    agent_name: String,
    driver: Option<Arc<dyn LlmDriver>>,
    sink: Arc<dyn OutputSink>,
    cache: Option<Arc<dyn ResultCache>>,
    skills: Option<Arc<SkillRegistry>>,
    compression: CompressionConfig,
    estimator: TokenEstimator,
    url_policy: UrlPolicy,
    explore: ExploreConfig,
    hook_agents: HashMap<String, String>,
    frames: Option<Arc<FrameRegistry>>,
}

impl AgentContextBuilder {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            driver: None,
            sink: Arc::new(NullSink),
            cache: None,
            skills: None,
            compression: CompressionConfig::default(),
            estimator: TokenEstimator::default(),
            url_policy: UrlPolicy::default(),
            explore: ExploreConfig::default(),
            hook_agents: HashMap::new(),
            frames: None,
        }
    }

    pub fn driver(mut self, driver: Arc<dyn LlmDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn skills(mut self, skills: Arc<SkillRegistry>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn explore_config(mut self, explore: ExploreConfig) -> Self {
        self.explore = explore;
        self
    }

    pub fn url_policy(mut self, url_policy: UrlPolicy) -> Self {
        self.url_policy = url_policy;
        self
    }

    /// Registers an agent file addressable from `on_stop = "@name"`.
    pub fn hook_agent(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.hook_agents.insert(name.into(), content.into());
        self
    }

    /// Uses a specific frame registry (e.g. one backed by a durable
    /// snapshot store).
    pub fn frames(mut self, frames: Arc<FrameRegistry>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Builds the context. A driver is required; everything else defaults.
    pub fn build(self) -> Arc<AgentContext> {
        let vars = Arc::new(VariablePool::new());
        let driver = self
            .driver
            .expect("AgentContextBuilder requires a driver; use .driver(...)");
        Arc::new(AgentContext {
            agent_name: self.agent_name,
            recorder: Recorder::new(Arc::clone(&vars)),
            vars,
            messages: MessageStore::new(),
            skills: self.skills.unwrap_or_default(),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(InMemoryResultCache::default())),
            driver,
            sink: self.sink,
            compression: self.compression,
            estimator: self.estimator,
            url_policy: self.url_policy,
            explore: self.explore,
            hook_agents: self.hook_agents,
            task_registry: Mutex::new(None),
            plan_runtime: PlanRuntime::default(),
            frames: self
                .frames
                .unwrap_or_else(|| Arc::new(FrameRegistry::in_memory())),
            tags: Map::new(),
            cancel: CancellationToken::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            parent_vars: None,
        })
    }
}
