//! Agent: lifecycle, streaming entrypoints, pause/resume/terminate.
//!
//! `arun` starts a fresh execution of the agent file; `continue_chat`
//! re-enters the same context with a new user message; `achat` is the
//! one-shot convenience. All three stream envelope items shaped per the
//! output contract: `{_status, _progress, _plan?, _artifacts?, result?}`.

mod state;

pub use state::{AgentEvent, AgentState, StateMachine};

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use run_event::{OutputSink, ProgressEntry, RunStatus, SinkEvent, StreamEnvelope};

use crate::artifact::{ArtifactSkillkit, ArtifactStore};
use crate::cache::ResultCache;
use crate::config::ExploreConfig;
use crate::context::{AgentContext, BucketName, CompressionConfig};
use crate::error::RuntimeError;
use crate::frame::{FrameRegistry, FrameStatus, ResumeHandle, StepOutcome};
use crate::llm::LlmDriver;
use crate::message::Message;
use crate::plan::PlanSkillkit;
use crate::recorder::StreamMode;
use crate::skill::{SkillRegistry, Skillkit};

/// A runnable agent bound to one agent file and one context.
pub struct Agent {
    pub name: String,
    content: String,
    ctx: Arc<AgentContext>,
    machine: Arc<StateMachine>,
    root_frame: Arc<Mutex<Option<String>>>,
    last_handle: Arc<Mutex<Option<ResumeHandle>>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Agent {
    pub fn builder(name: impl Into<String>, content: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name, content)
    }

    pub fn state(&self) -> AgentState {
        self.machine.state()
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Frame id of the current (or last) run.
    pub fn root_frame_id(&self) -> Option<String> {
        self.current_frame()
    }

    /// Registers a lifecycle listener.
    pub fn on(&self, event: AgentEvent, listener: impl Fn(AgentState) + Send + Sync + 'static) {
        self.machine.on(event, listener);
    }

    /// First execution. Lazily initializes, then streams envelope items
    /// until the run completes, pauses, or fails.
    pub async fn arun(
        &self,
        query: impl Into<String>,
        stream_mode: StreamMode,
    ) -> Result<ReceiverStream<StreamEnvelope>, RuntimeError> {
        if self.machine.state() == AgentState::Created {
            self.machine.transition(AgentState::Initialized)?;
        }
        self.machine.transition(AgentState::Running)?;

        let query = query.into();
        if !query.is_empty() {
            self.ctx
                .add_message(BucketName::History, Message::user(query))?;
        }
        let frame = self
            .ctx
            .frames
            .start_coroutine(&self.ctx, &self.content, Map::new())
            .await?;
        self.set_root_frame(&frame.frame_id);
        Ok(self.drive(frame.frame_id, stream_mode))
    }

    /// Continues in the existing context (variables and messages persist).
    /// Fast-fails with `NEED_RESUME` when the agent is parked on a tool
    /// interrupt; resuming with updates is the only way forward there.
    pub async fn continue_chat(
        &self,
        message: impl Into<String>,
    ) -> Result<ReceiverStream<StreamEnvelope>, RuntimeError> {
        if let Some(frame_id) = self.current_frame() {
            if let Some(frame) = self.ctx.frames.get(&frame_id) {
                if frame.status == FrameStatus::WaitingForIntervention {
                    return Err(RuntimeError::InvalidState("NEED_RESUME".to_string()));
                }
            }
        }
        self.machine.transition(AgentState::Running)?;
        self.ctx.clear_user_interrupt();
        self.ctx
            .add_message(BucketName::History, Message::user(message.into()))?;
        let frame = self
            .ctx
            .frames
            .start_coroutine(&self.ctx, &self.content, Map::new())
            .await?;
        self.set_root_frame(&frame.frame_id);
        Ok(self.drive(frame.frame_id, StreamMode::Full))
    }

    /// One-shot convenience: run and return the final result.
    pub async fn achat(&self, query: impl Into<String>) -> Result<Value, RuntimeError> {
        use tokio_stream::StreamExt;
        let mut stream = self.arun(query, StreamMode::Full).await?;
        let mut last = None;
        while let Some(envelope) = stream.next().await {
            last = Some(envelope);
        }
        match last {
            Some(envelope) if envelope.status == RunStatus::Completed => {
                Ok(envelope.result.unwrap_or(Value::Null))
            }
            Some(envelope) => Err(RuntimeError::InvalidState(format!(
                "run ended with status {:?}",
                envelope.status
            ))),
            None => Err(RuntimeError::InvalidState("run produced no output".into())),
        }
    }

    /// Requests a user interrupt; the run pauses at the next suspension point.
    pub fn interrupt(&self) {
        self.ctx.request_user_interrupt();
    }

    /// Cooperative pause; returns the resume handle.
    pub async fn pause(&self) -> Result<ResumeHandle, RuntimeError> {
        let frame_id = self
            .current_frame()
            .ok_or_else(|| RuntimeError::InvalidState("no active run".to_string()))?;
        let handle = self.ctx.frames.pause_coroutine(&frame_id).await?;
        if self.machine.state() == AgentState::Running {
            self.machine.transition(AgentState::Paused)?;
        }
        let mut slot = self.last_handle.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Resumes the paused/waiting frame with the most recent handle,
    /// applying `updates` to the variable pool (`tool_result` for
    /// interventions), and streams the rest of the run.
    pub async fn resume(
        &self,
        updates: Map<String, Value>,
    ) -> Result<ReceiverStream<StreamEnvelope>, RuntimeError> {
        let handle = {
            let mut slot = self.last_handle.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        }
        .ok_or_else(|| RuntimeError::InvalidState("no resume handle held".to_string()))?;
        self.resume_with(handle, updates).await
    }

    /// Resumes with an explicit handle (e.g. one transported elsewhere).
    pub async fn resume_with(
        &self,
        handle: ResumeHandle,
        updates: Map<String, Value>,
    ) -> Result<ReceiverStream<StreamEnvelope>, RuntimeError> {
        let frame = self
            .ctx
            .frames
            .resume_coroutine(&self.ctx, &handle, updates)
            .await?;
        if self.machine.state() == AgentState::Paused {
            self.machine.transition(AgentState::Running)?;
        }
        Ok(self.drive(frame.frame_id, StreamMode::Full))
    }

    /// Terminates the run; cancellation reaches in-flight streams and skills.
    pub async fn terminate(&self) -> Result<(), RuntimeError> {
        if let Some(frame_id) = self.current_frame() {
            self.ctx.frames.terminate(&frame_id).await?;
        }
        self.ctx.plan_runtime.cancel_all();
        self.machine.transition(AgentState::Terminated)?;
        Ok(())
    }

    fn current_frame(&self) -> Option<String> {
        self.root_frame
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_root_frame(&self, frame_id: &str) {
        let mut slot = self.root_frame.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(frame_id.to_string());
    }

    /// Spawns the step loop and the progress forwarder; returns the consumer
    /// stream of envelope items.
    fn drive(&self, frame_id: String, stream_mode: StreamMode) -> ReceiverStream<StreamEnvelope> {
        let (env_tx, env_rx) = mpsc::channel::<StreamEnvelope>(64);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<Vec<ProgressEntry>>();
        self.ctx.recorder.set_emitter(progress_tx, stream_mode);

        let ctx = Arc::clone(&self.ctx);
        let machine = Arc::clone(&self.machine);
        let handle_slot = Arc::clone(&self.last_handle);
        let model_name = self.ctx.driver.model_name().to_string();
        let agent_name = self.name.clone();
        let content = self.content.clone();

        // Forwarder: every progress mutation becomes a running envelope.
        let forward_ctx = Arc::clone(&self.ctx);
        let forward_tx = env_tx.clone();
        let forward_model = model_name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let mut envelope =
                    StreamEnvelope::running(progress).with_model_name(forward_model.clone());
                if let Some(plan) = forward_ctx.plan_summary() {
                    envelope = envelope.with_plan(plan);
                }
                if let Some(Value::Array(list)) = forward_ctx.vars.get("_artifacts") {
                    envelope = envelope.with_artifacts(list);
                }
                if forward_tx.send(envelope).await.is_err() {
                    return;
                }
            }
        });

        tokio::spawn(async move {
            ctx.write_output(&SinkEvent::AgentStarted {
                agent_name: agent_name.clone(),
            });
            let transition = |state: AgentState| {
                if let Err(e) = machine.transition(state) {
                    debug!(error = %e, "driver-requested transition rejected");
                }
            };
            let final_envelope = loop {
                match ctx.frames.step_coroutine(&ctx, &frame_id).await {
                    Ok(StepOutcome::Advanced) => continue,
                    Ok(StepOutcome::Done) => {
                        let result = final_result(&ctx, &content);
                        transition(AgentState::Completed);
                        ctx.write_output(&SinkEvent::AgentCompleted {
                            agent_name: agent_name.clone(),
                            result: result.clone(),
                        });
                        break StreamEnvelope::completed(ctx.recorder.progress(), result);
                    }
                    Ok(StepOutcome::Paused(handle)) | Ok(StepOutcome::Intervention(handle)) => {
                        {
                            let mut slot =
                                handle_slot.lock().unwrap_or_else(|e| e.into_inner());
                            *slot = Some(handle);
                        }
                        transition(AgentState::Paused);
                        break StreamEnvelope::running(ctx.recorder.progress());
                    }
                    Ok(StepOutcome::Failed { error }) => {
                        transition(AgentState::Error);
                        ctx.write_output(&SinkEvent::AgentFailed {
                            agent_name: agent_name.clone(),
                            error: error.clone(),
                        });
                        break StreamEnvelope::failed(ctx.recorder.progress(), error);
                    }
                    Ok(StepOutcome::Suspended) => {
                        debug!(frame_id = %frame_id, "frame suspended; ending stream");
                        break StreamEnvelope::running(ctx.recorder.progress());
                    }
                    Err(e) => {
                        transition(AgentState::Error);
                        let error = e.to_string();
                        ctx.write_output(&SinkEvent::AgentFailed {
                            agent_name: agent_name.clone(),
                            error: error.clone(),
                        });
                        break StreamEnvelope::failed(ctx.recorder.progress(), error);
                    }
                }
            };
            // Stop progress emission, let the forwarder drain, then finish.
            ctx.recorder.clear_emitter();
            let _ = forwarder.await;
            let mut final_envelope = final_envelope.with_model_name(model_name);
            if let Some(plan) = ctx.plan_summary() {
                final_envelope = final_envelope.with_plan(plan);
            }
            let _ = env_tx.send(final_envelope).await;
        });

        ReceiverStream::new(env_rx)
    }
}

/// The final `result`: the last output-bound variable, falling back to the
/// last recorded answer.
fn final_result(ctx: &AgentContext, content: &str) -> Value {
    if let Ok(blocks) = skein_dsl::parse_agent_file(content) {
        if let Some(var) = blocks.iter().rev().find_map(|b| b.output_var.as_ref()) {
            if let Some(value) = ctx.get_var(var) {
                return value;
            }
        }
    }
    ctx.recorder
        .progress()
        .iter()
        .rev()
        .find_map(|entry| entry.answer.clone())
        .map(Value::String)
        .unwrap_or(Value::Null)
}

/// Builder wiring the context, skills, and optional capability kits.
pub struct AgentBuilder {
    name: String,
    content: String,
    driver: Option<Arc<dyn LlmDriver>>,
    sink: Option<Arc<dyn OutputSink>>,
    cache: Option<Arc<dyn ResultCache>>,
    frames: Option<Arc<FrameRegistry>>,
    kits: Vec<Arc<dyn Skillkit>>,
    compression: Option<CompressionConfig>,
    explore: Option<ExploreConfig>,
    hook_agents: Vec<(String, String)>,
    with_plan: bool,
    with_artifacts: bool,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            driver: None,
            sink: None,
            cache: None,
            frames: None,
            kits: Vec::new(),
            compression: None,
            explore: None,
            hook_agents: Vec::new(),
            with_plan: false,
            with_artifacts: false,
        }
    }

    pub fn driver(mut self, driver: Arc<dyn LlmDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn frames(mut self, frames: Arc<FrameRegistry>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn skillkit(mut self, kit: Arc<dyn Skillkit>) -> Self {
        self.kits.push(kit);
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn explore_config(mut self, explore: ExploreConfig) -> Self {
        self.explore = Some(explore);
        self
    }

    pub fn hook_agent(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.hook_agents.push((name.into(), content.into()));
        self
    }

    /// Enables the plan skillkit.
    pub fn with_plan(mut self) -> Self {
        self.with_plan = true;
        self
    }

    /// Enables the artifact store and skillkit.
    pub fn with_artifacts(mut self) -> Self {
        self.with_artifacts = true;
        self
    }

    pub fn build(self) -> Result<Agent, RuntimeError> {
        // Validate the agent file up front; parse errors are fatal here.
        skein_dsl::parse_agent_file(&self.content)?;

        let driver = self
            .driver
            .ok_or_else(|| RuntimeError::Config("agent requires an LLM driver".to_string()))?;

        let registry = SkillRegistry::new();
        for kit in self.kits {
            registry.register(kit).map_err(RuntimeError::from)?;
        }
        if self.with_plan {
            registry
                .register(Arc::new(PlanSkillkit))
                .map_err(RuntimeError::from)?;
        }
        if self.with_artifacts {
            let store = Arc::new(ArtifactStore::new());
            registry
                .register(Arc::new(ArtifactSkillkit::new(store)))
                .map_err(RuntimeError::from)?;
        }

        let mut ctx_builder = AgentContext::builder(&self.name)
            .driver(driver)
            .skills(Arc::new(registry));
        if let Some(sink) = self.sink {
            ctx_builder = ctx_builder.sink(sink);
        }
        if let Some(cache) = self.cache {
            ctx_builder = ctx_builder.cache(cache);
        }
        if let Some(frames) = self.frames {
            ctx_builder = ctx_builder.frames(frames);
        }
        if let Some(compression) = self.compression {
            ctx_builder = ctx_builder.compression(compression);
        }
        if let Some(explore) = self.explore {
            ctx_builder = ctx_builder.explore_config(explore);
        }
        for (name, content) in self.hook_agents {
            ctx_builder = ctx_builder.hook_agent(name, content);
        }

        Ok(Agent {
            name: self.name,
            content: self.content,
            ctx: ctx_builder.build(),
            machine: Arc::new(StateMachine::new()),
            root_frame: Arc::new(Mutex::new(None)),
            last_handle: Arc::new(Mutex::new(None)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockDriver, ScriptedTurn};
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn echo_agent(turns: Vec<ScriptedTurn>) -> Agent {
        Agent::builder("echo", "@prompt -> greeting\nSay hello\n@end\n")
            .driver(Arc::new(MockDriver::script(turns)))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn lifecycle_is_lazy_and_completes() {
        let agent = echo_agent(vec![ScriptedTurn::text("Hello")]);
        assert_eq!(agent.state(), AgentState::Created);
        let result = agent.achat("hi").await.unwrap();
        assert_eq!(result, json!("Hello"));
        assert_eq!(agent.state(), AgentState::Completed);
        assert_eq!(agent.context().get_var("greeting"), Some(json!("Hello")));
    }

    #[tokio::test]
    async fn arun_streams_progress_then_final_envelope() {
        let agent = echo_agent(vec![ScriptedTurn::text("Hello").chunked(2)]);
        let mut stream = agent.arun("hi", StreamMode::Full).await.unwrap();
        let mut envelopes = Vec::new();
        while let Some(envelope) = stream.next().await {
            envelopes.push(envelope);
        }
        assert!(envelopes.len() >= 2);
        let last = envelopes.last().unwrap();
        assert_eq!(last.status, RunStatus::Completed);
        assert_eq!(last.result, Some(json!("Hello")));
        assert_eq!(last.model_name.as_deref(), Some("mock"));
        // Earlier envelopes are running with cumulative answers.
        assert!(envelopes[..envelopes.len() - 1]
            .iter()
            .all(|e| e.status == RunStatus::Running));
    }

    #[tokio::test]
    async fn delta_mode_carries_increments() {
        let agent = echo_agent(vec![ScriptedTurn::text("Hello").chunked(1)]);
        let mut stream = agent.arun("hi", StreamMode::Delta).await.unwrap();
        let mut deltas = String::new();
        while let Some(envelope) = stream.next().await {
            for entry in &envelope.progress {
                if let Some(delta) = &entry.delta {
                    deltas.push_str(delta);
                }
            }
        }
        assert_eq!(deltas, "Hello");
    }

    #[tokio::test]
    async fn continue_chat_reuses_context() {
        let agent = echo_agent(vec![
            ScriptedTurn::text("first"),
            ScriptedTurn::text("second"),
        ]);
        agent.achat("one").await.unwrap();
        let mut stream = agent.continue_chat("two").await.unwrap();
        let mut last = None;
        while let Some(envelope) = stream.next().await {
            last = Some(envelope);
        }
        assert_eq!(last.unwrap().result, Some(json!("second")));
        // History carries both turns.
        let history = agent.context().messages.bucket(BucketName::History);
        assert!(history.len() >= 4);
    }

    #[tokio::test]
    async fn listeners_observe_lifecycle() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let agent = echo_agent(vec![ScriptedTurn::text("x")]);
        let completions = Arc::new(AtomicUsize::new(0));
        {
            let completions = Arc::clone(&completions);
            agent.on(AgentEvent::Complete, move |_| {
                completions.fetch_add(1, Ordering::SeqCst);
            });
        }
        agent.achat("go").await.unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminate_is_terminal() {
        let agent = echo_agent(vec![ScriptedTurn::text("x")]);
        agent.achat("go").await.unwrap();
        agent.terminate().await.unwrap();
        assert_eq!(agent.state(), AgentState::Terminated);
        assert!(agent.continue_chat("more").await.is_err());
    }

    #[tokio::test]
    async fn invalid_agent_file_fails_at_build() {
        let err = Agent::builder("bad", "@nope\n@end\n")
            .driver(Arc::new(MockDriver::empty()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown block kind"));
    }
}
