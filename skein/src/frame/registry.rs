//! Frame registry: the tree of frames and the step driver.
//!
//! Step granularity: one plain block per step; inside an explore block, one
//! LLM-turn-plus-its-tool-responses per step. A snapshot therefore never
//! splits an assistant message from its tool responses.
//!
//! Commit protocol per step: write the pending snapshot, journal the commit
//! intent, CAS the frame (version+1) under the per-frame short lock, then
//! finalize the snapshot with an atomic rename. The lock never brackets an
//! LLM call.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use run_event::SinkEvent;
use skein_dsl::{Block, BlockKind};

use crate::context::AgentContext;
use crate::error::RuntimeError;
use crate::explore::{ExploreParams, ExploreTurnState, TurnOutcome};
use crate::vars::SetMode;

use super::{
    BlockStackEntry, ContextSnapshot, ExecutionFrame, FrameError, FrameErrorInfo, FrameStatus,
    HandleIssuer, InMemorySnapshotStore, JournalEntry, RecoveryReport, ResumeHandle, SnapshotStore,
};

/// Result of one `step_coroutine` call.
#[derive(Debug)]
pub enum StepOutcome {
    /// One atomic unit executed; the frame is still running.
    Advanced,
    /// Every block is done; the frame is completed.
    Done,
    /// The frame paused at this boundary (user interrupt or pause request).
    Paused(ResumeHandle),
    /// A skill requested intervention; resume with `updates.tool_result`.
    Intervention(ResumeHandle),
    /// The step failed; the frame is failed and keeps its last good snapshot.
    Failed { error: String },
    /// The frame is not running (already paused, waiting, or terminal).
    Suspended,
}

/// Registry of execution frames for one process.
pub struct FrameRegistry {
    frames: DashMap<String, ExecutionFrame>,
    parsed: DashMap<String, Arc<Vec<Block>>>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    in_flight: DashMap<String, ()>,
    cancels: DashMap<String, CancellationToken>,
    store: Arc<dyn SnapshotStore>,
    issuer: HandleIssuer,
}

impl FrameRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            frames: DashMap::new(),
            parsed: DashMap::new(),
            locks: DashMap::new(),
            in_flight: DashMap::new(),
            cancels: DashMap::new(),
            store,
            issuer: HandleIssuer::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySnapshotStore::new()))
    }

    pub fn get(&self, frame_id: &str) -> Option<ExecutionFrame> {
        self.frames.get(frame_id).map(|f| f.value().clone())
    }

    /// Runs snapshot-store crash recovery.
    pub async fn recover(&self, pending_max_age: Duration) -> Result<RecoveryReport, FrameError> {
        self.store.recover(pending_max_age).await
    }

    // ---- lifecycle ----

    /// Parses the agent file, creates the root frame, snapshots the initial
    /// context, and registers the frame in `running` state.
    pub async fn start_coroutine(
        &self,
        ctx: &Arc<AgentContext>,
        content: &str,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionFrame, RuntimeError> {
        let blocks = Arc::new(skein_dsl::parse_agent_file(content)?);
        let frame = ExecutionFrame::new(&ctx.agent_name, content);
        for (key, value) in inputs {
            ctx.vars.set_reserved(&key, value, SetMode::Overwrite)?;
        }

        let snapshot = ContextSnapshot::capture(ctx, &frame.frame_id)?;
        self.store.save_pending(&snapshot).await?;
        self.store
            .append_journal(&JournalEntry {
                frame_id: frame.frame_id.clone(),
                snapshot_id: snapshot.snapshot_id.clone(),
                version: frame.version,
                timestamp: chrono::Utc::now(),
            })
            .await?;
        let mut frame = frame;
        frame.context_snapshot_id = snapshot.snapshot_id.clone();
        self.parsed.insert(frame.frame_id.clone(), blocks);
        self.cancels
            .insert(frame.frame_id.clone(), ctx.cancel.clone());
        self.frames.insert(frame.frame_id.clone(), frame.clone());
        self.store
            .finalize(&frame.frame_id, &snapshot.snapshot_id)
            .await?;
        info!(frame_id = %frame.frame_id, agent = %ctx.agent_name, "coroutine started");
        Ok(frame)
    }

    /// Executes exactly one atomic unit of the frame.
    pub async fn step_coroutine(
        &self,
        ctx: &Arc<AgentContext>,
        frame_id: &str,
    ) -> Result<StepOutcome, RuntimeError> {
        let frame = self
            .get(frame_id)
            .ok_or_else(|| FrameError::NotFound(frame_id.to_string()))?;

        if frame.status.is_terminal() {
            return Ok(StepOutcome::Done);
        }
        if frame.status != FrameStatus::Running {
            return Ok(StepOutcome::Suspended);
        }
        if frame.desired_pause {
            let paused = self.cas_update(frame_id, frame.version, |f| {
                f.status = FrameStatus::Paused;
                f.desired_pause = false;
            })?;
            return Ok(StepOutcome::Paused(
                self.issuer.issue(&paused, &paused.agent_id),
            ));
        }

        self.in_flight.insert(frame_id.to_string(), ());
        let result = self.step_inner(ctx, frame).await;
        self.in_flight.remove(frame_id);
        result
    }

    async fn step_inner(
        &self,
        ctx: &Arc<AgentContext>,
        mut frame: ExecutionFrame,
    ) -> Result<StepOutcome, RuntimeError> {
        // Restore the context to the frame's last committed state.
        let snapshot = self
            .store
            .load(&frame.frame_id, &frame.context_snapshot_id)
            .await?;
        snapshot.apply(ctx)?;

        let blocks = self.parsed_blocks(&frame)?;
        if frame.block_pointer >= blocks.len() {
            match self
                .commit(ctx, &frame.frame_id, frame.version, |f| {
                    f.status = FrameStatus::Completed;
                })
                .await
            {
                Ok(done) => {
                    debug!(frame_id = %done.frame_id, "frame completed");
                    return Ok(StepOutcome::Done);
                }
                Err(e) => return self.resolve_commit_conflict(&frame.frame_id, e),
            }
        }

        let index = frame.block_pointer;
        let block = &blocks[index];
        let fresh_block = !frame
            .block_stack
            .iter()
            .any(|entry| entry.block_index == index);
        if fresh_block {
            ctx.recorder.start_block(index, block.kind.as_str());
            ctx.write_output(&SinkEvent::AgentBlockStarted {
                agent_name: ctx.agent_name.clone(),
                block_kind: block.kind.as_str().to_string(),
                block_index: index,
            });
        }

        let step = self.execute_unit(ctx, &mut frame, block, index).await;
        match step {
            Ok(block_finished) => {
                if block_finished {
                    frame.block_pointer += 1;
                    frame.block_stack.retain(|entry| entry.block_index != index);
                    ctx.write_output(&SinkEvent::AgentBlockCompleted {
                        agent_name: ctx.agent_name.clone(),
                        block_kind: block.kind.as_str().to_string(),
                        block_index: index,
                    });
                }
                let done = frame.block_pointer >= blocks.len();
                let pointer = frame.block_pointer;
                let stack = frame.block_stack.clone();
                match self
                    .commit(ctx, &frame.frame_id, frame.version, move |f| {
                        f.block_pointer = pointer;
                        f.block_stack = stack;
                        if done {
                            f.status = FrameStatus::Completed;
                        }
                    })
                    .await
                {
                    Ok(_) => {}
                    Err(e) => return self.resolve_commit_conflict(&frame.frame_id, e),
                }
                Ok(if done {
                    StepOutcome::Done
                } else {
                    StepOutcome::Advanced
                })
            }
            Err(RuntimeError::UserInterrupt) => {
                let stack = frame.block_stack.clone();
                let paused = match self
                    .commit(ctx, &frame.frame_id, frame.version, move |f| {
                        f.block_stack = stack;
                        f.status = FrameStatus::Paused;
                        f.desired_pause = false;
                    })
                    .await
                {
                    Ok(paused) => paused,
                    Err(e) => return self.resolve_commit_conflict(&frame.frame_id, e),
                };
                info!(frame_id = %paused.frame_id, "frame paused by user interrupt");
                Ok(StepOutcome::Paused(
                    self.issuer.issue(&paused, &paused.agent_id),
                ))
            }
            Err(RuntimeError::ToolInterrupt(interrupt)) => {
                let stack = frame.block_stack.clone();
                let tool = interrupt.tool.clone();
                let args = interrupt.args.clone();
                let waiting = match self
                    .commit(ctx, &frame.frame_id, frame.version, move |f| {
                        f.block_stack = stack;
                        f.status = FrameStatus::WaitingForIntervention;
                        f.error = Some(FrameErrorInfo {
                            error_type: "ToolInterrupt".to_string(),
                            message: format!("tool '{tool}' requests intervention"),
                            tool_name: Some(tool),
                            tool_args: Some(args),
                            at_block: index,
                            intervention_snapshot_id: None,
                        });
                    })
                    .await
                {
                    Ok(waiting) => waiting,
                    Err(e) => return self.resolve_commit_conflict(&frame.frame_id, e),
                };
                // The commit pointed the frame at the intervention snapshot.
                let snapshot_id = waiting.context_snapshot_id.clone();
                let waiting = self.cas_update(&waiting.frame_id, waiting.version, |f| {
                    if let Some(err) = f.error.as_mut() {
                        err.intervention_snapshot_id = Some(snapshot_id);
                    }
                })?;
                info!(frame_id = %waiting.frame_id, "frame waiting for intervention");
                Ok(StepOutcome::Intervention(
                    self.issuer.issue(&waiting, &waiting.agent_id),
                ))
            }
            Err(e) => {
                // Keep the last good snapshot; record the failure.
                let message = e.to_string();
                let info_message = message.clone();
                if let Err(cas_err) = self.cas_update(&frame.frame_id, frame.version, move |f| {
                    f.status = FrameStatus::Failed;
                    f.error = Some(FrameErrorInfo {
                        error_type: "RuntimeError".to_string(),
                        message: info_message,
                        tool_name: None,
                        tool_args: None,
                        at_block: index,
                        intervention_snapshot_id: None,
                    });
                }) {
                    return self.resolve_commit_conflict(&frame.frame_id, cas_err.into());
                }
                warn!(frame_id = %frame.frame_id, error = %message, "frame failed");
                Ok(StepOutcome::Failed { error: message })
            }
        }
    }

    /// Executes one atomic unit. Returns whether the current block finished.
    async fn execute_unit(
        &self,
        ctx: &Arc<AgentContext>,
        frame: &mut ExecutionFrame,
        block: &Block,
        index: usize,
    ) -> Result<bool, RuntimeError> {
        if block.kind == BlockKind::Explore {
            let params = ExploreParams::from_block(block, &ctx.explore, &ctx.skills)?;
            let mut state: ExploreTurnState = frame
                .block_stack
                .iter()
                .find(|entry| entry.block_index == index)
                .map(|entry| serde_json::from_value(entry.state.clone()))
                .transpose()
                .map_err(|e| FrameError::Serialization(e.to_string()))?
                .unwrap_or_default();

            let outcome = crate::explore::run_turn(ctx, &params, &mut state).await;

            // Persist the mutated turn state in every case; a tool interrupt
            // must find its pending batch again after resume.
            let serialized = serde_json::to_value(&state)
                .map_err(|e| FrameError::Serialization(e.to_string()))?;
            frame.block_stack.retain(|entry| entry.block_index != index);
            frame.block_stack.push(BlockStackEntry {
                block_index: index,
                state: serialized,
            });

            match outcome? {
                TurnOutcome::Continue => Ok(false),
                TurnOutcome::Finished(_) => Ok(true),
            }
        } else {
            crate::blocks::execute_block(ctx, block).await?;
            Ok(true)
        }
    }

    /// Cooperative pause. If a step is in flight, the request is honored at
    /// its boundary; otherwise the transition happens immediately.
    pub async fn pause_coroutine(&self, frame_id: &str) -> Result<ResumeHandle, RuntimeError> {
        let frame = self
            .get(frame_id)
            .ok_or_else(|| FrameError::NotFound(frame_id.to_string()))?;
        match frame.status {
            FrameStatus::Paused | FrameStatus::WaitingForIntervention => {
                return Ok(self.issuer.issue(&frame, &frame.agent_id));
            }
            FrameStatus::Running => {}
            other => {
                return Err(FrameError::NotResumable {
                    frame_id: frame_id.to_string(),
                    status: other.as_str().to_string(),
                }
                .into())
            }
        }

        // The pause flag is advisory and must not disturb the in-flight
        // step's CAS, so it is set without a version bump.
        self.request_pause(frame_id)?;

        // Wait for the step boundary; transition directly when quiescent.
        for _ in 0..500 {
            let current = self
                .get(frame_id)
                .ok_or_else(|| FrameError::NotFound(frame_id.to_string()))?;
            match current.status {
                FrameStatus::Paused | FrameStatus::WaitingForIntervention => {
                    return Ok(self.issuer.issue(&current, &current.agent_id));
                }
                FrameStatus::Running if !self.in_flight.contains_key(frame_id) => {
                    match self.cas_update(frame_id, current.version, |f| {
                        f.status = FrameStatus::Paused;
                        f.desired_pause = false;
                    }) {
                        Ok(paused) => {
                            return Ok(self.issuer.issue(&paused, &paused.agent_id))
                        }
                        // A step slipped in between the check and the CAS;
                        // try again at the next boundary.
                        Err(FrameError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                FrameStatus::Running => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                _ => {
                    return Err(FrameError::NotResumable {
                        frame_id: frame_id.to_string(),
                        status: current.status.as_str().to_string(),
                    }
                    .into())
                }
            }
        }
        Err(FrameError::PauseTimeout.into())
    }

    /// Sets the advisory pause flag without bumping the frame version.
    fn request_pause(&self, frame_id: &str) -> Result<(), FrameError> {
        let mut entry = self
            .frames
            .get_mut(frame_id)
            .ok_or_else(|| FrameError::NotFound(frame_id.to_string()))?;
        entry.desired_pause = true;
        entry.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// A commit CAS lost against a concurrent administrative transition
    /// (terminate, pause). Resolve by the live frame state instead of
    /// surfacing a spurious failure.
    fn resolve_commit_conflict(
        &self,
        frame_id: &str,
        error: RuntimeError,
    ) -> Result<StepOutcome, RuntimeError> {
        if !matches!(error, RuntimeError::Frame(FrameError::Conflict { .. })) {
            return Err(error);
        }
        match self.get(frame_id) {
            Some(frame) if frame.status.is_terminal() => Ok(StepOutcome::Done),
            Some(frame) if frame.status.is_resumable() => Ok(StepOutcome::Suspended),
            _ => Err(error),
        }
    }

    /// Restores the handle's snapshot, applies `updates` to the variable pool
    /// (including a fabricated `tool_result` for interventions), commits a
    /// fresh snapshot, and sets the frame running again.
    pub async fn resume_coroutine(
        &self,
        ctx: &Arc<AgentContext>,
        handle: &ResumeHandle,
        updates: Map<String, Value>,
    ) -> Result<ExecutionFrame, RuntimeError> {
        let frame = self
            .get(&handle.frame_id)
            .ok_or_else(|| FrameError::NotFound(handle.frame_id.clone()))?;
        self.issuer.validate(handle, &frame, &frame.agent_id)?;

        let snapshot = self.store.load(&handle.frame_id, &handle.snapshot_id).await?;
        snapshot.apply(ctx)?;
        for (key, value) in updates {
            ctx.vars.set_reserved(&key, value, SetMode::Overwrite)?;
        }
        ctx.clear_user_interrupt();

        let resumed = self
            .commit(ctx, &handle.frame_id, frame.version, |f| {
                f.status = FrameStatus::Running;
                f.desired_pause = false;
                f.error = None;
            })
            .await?;
        info!(frame_id = %resumed.frame_id, "frame resumed");
        Ok(resumed)
    }

    /// Terminates a frame and its descendants; cancellation propagates to
    /// in-flight LLM streams and skills through the context token.
    pub async fn terminate(&self, frame_id: &str) -> Result<(), FrameError> {
        let mut stack = vec![frame_id.to_string()];
        while let Some(id) = stack.pop() {
            let Some(frame) = self.get(&id) else {
                continue;
            };
            stack.extend(frame.children.iter().cloned());
            if let Some(cancel) = self.cancels.get(&id) {
                cancel.cancel();
            }
            // Retry the CAS against in-flight step commits.
            for _ in 0..10 {
                let Some(current) = self.get(&id) else {
                    break;
                };
                if current.status.is_terminal() {
                    break;
                }
                match self.cas_update(&id, current.version, |f| {
                    f.status = FrameStatus::Terminated;
                }) {
                    Ok(_) => {
                        info!(frame_id = %id, "frame terminated");
                        break;
                    }
                    Err(FrameError::Conflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    // ---- eager children (parallel branches) ----

    /// Registers a child frame for an eagerly-executed branch so the frame
    /// tree stays observable.
    pub fn register_eager_child(&self, agent_id: &str, label: &str) -> String {
        let mut frame = ExecutionFrame::new(agent_id, "");
        frame.parent_id = Some(label.to_string());
        let id = frame.frame_id.clone();
        self.frames.insert(id.clone(), frame);
        id
    }

    pub fn finish_eager_child(&self, frame_id: &str, status: FrameStatus) {
        if let Some(mut frame) = self.frames.get_mut(frame_id) {
            frame.status = status;
            frame.version += 1;
            frame.updated_at = chrono::Utc::now();
        }
    }

    // ---- internals ----

    fn parsed_blocks(&self, frame: &ExecutionFrame) -> Result<Arc<Vec<Block>>, RuntimeError> {
        if let Some(blocks) = self.parsed.get(&frame.frame_id) {
            return Ok(Arc::clone(&blocks));
        }
        let blocks = Arc::new(skein_dsl::parse_agent_file(&frame.original_content)?);
        self.parsed.insert(frame.frame_id.clone(), Arc::clone(&blocks));
        Ok(blocks)
    }

    fn lock_for(&self, frame_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(frame_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Optimistic-concurrency frame mutation; version must match.
    fn cas_update(
        &self,
        frame_id: &str,
        expected_version: u64,
        mutate: impl FnOnce(&mut ExecutionFrame),
    ) -> Result<ExecutionFrame, FrameError> {
        let mut entry = self
            .frames
            .get_mut(frame_id)
            .ok_or_else(|| FrameError::NotFound(frame_id.to_string()))?;
        if entry.version != expected_version {
            return Err(FrameError::Conflict {
                frame_id: frame_id.to_string(),
                expected: expected_version,
                found: entry.version,
            });
        }
        mutate(&mut entry);
        entry.version += 1;
        entry.updated_at = chrono::Utc::now();
        Ok(entry.clone())
    }

    /// Three-phase commit: pending snapshot → journal → CAS → finalize.
    /// The superseded snapshot is pruned afterwards; the frame has
    /// progressed past it and stale handles are rejected by version anyway.
    async fn commit(
        &self,
        ctx: &Arc<AgentContext>,
        frame_id: &str,
        expected_version: u64,
        mutate: impl FnOnce(&mut ExecutionFrame),
    ) -> Result<ExecutionFrame, RuntimeError> {
        let snapshot = ContextSnapshot::capture(ctx, frame_id)?;
        self.store.save_pending(&snapshot).await?;
        let previous = self.get(frame_id).map(|f| f.context_snapshot_id);

        let lock = self.lock_for(frame_id);
        let _guard = lock.lock().await;
        self.store
            .append_journal(&JournalEntry {
                frame_id: frame_id.to_string(),
                snapshot_id: snapshot.snapshot_id.clone(),
                version: expected_version + 1,
                timestamp: chrono::Utc::now(),
            })
            .await?;
        let snapshot_id = snapshot.snapshot_id.clone();
        let frame = self.cas_update(frame_id, expected_version, move |f| {
            mutate(f);
            f.context_snapshot_id = snapshot_id;
        })?;
        self.store.finalize(frame_id, &snapshot.snapshot_id).await?;
        if let Some(previous) = previous {
            if !previous.is_empty() && previous != snapshot.snapshot_id {
                let _ = self.store.delete(frame_id, &previous).await;
            }
        }
        Ok(frame)
    }
}
