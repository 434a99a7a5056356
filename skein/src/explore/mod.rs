//! Explore engine: the ReAct loop.
//!
//! One invocation interleaves LLM turns and sequential tool execution until
//! the model stops without tool calls (and the `on_stop` hook, if any,
//! accepts the answer), then coerces the accumulated answer into the
//! declared output format and binds the output variable.
//!
//! The loop is resumable: all per-invocation state lives in the
//! serializable [`ExploreTurnState`], which the frame engine snapshots
//! between turns and across tool interrupts.

mod on_stop;
mod output;
mod stream_item;

pub use on_stop::{evaluate, feedback_message, HookError, HookHandler, HookInput, HookResult};
pub(crate) use on_stop::install_allowed_functions;
pub use output::OutputFormat;
pub use stream_item::{finalize_turn, ParsedToolCall, StreamItem};

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use run_event::SinkEvent;

use skein_dsl::Block;

use crate::context::{assemble_checked, AgentContext, BucketName};
use crate::error::RuntimeError;
use crate::llm::{ChatChunk, ChatParams};
use crate::message::{Message, ToolCallDescriptor};
use crate::recorder::{StageKind, StageStatus, StageUpdate};
use crate::skill::{
    invoke, on_before_send_to_context, Deduplicator, RetentionMode, RetentionPolicy,
};
use crate::vars::SetMode;

/// Parameters of one explore invocation, parsed from the block header.
#[derive(Clone, Debug)]
pub struct ExploreParams {
    /// Allowed skill names; `None` exposes the whole registry.
    pub tools: Option<Vec<String>>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub output: OutputFormat,
    pub on_stop: Option<HookHandler>,
    pub multi_tool_calls: bool,
    pub max_retries: u32,
    pub threshold: f64,
    pub dedup: bool,
    /// Per-block retention override applied to every tool response.
    pub retention_override: Option<RetentionPolicy>,
    pub output_var: Option<String>,
    pub body: String,
}

impl ExploreParams {
    pub fn from_block(
        block: &Block,
        defaults: &crate::config::ExploreConfig,
        registry: &crate::skill::SkillRegistry,
    ) -> Result<Self, RuntimeError> {
        let mut tools: Option<Vec<String>> = None;
        if let Some(list) = block.param_str("tools") {
            tools = Some(
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
        if let Some(kits) = block.param_str("skillkits") {
            let kit_names: Vec<String> = kits
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            let mut names = tools.unwrap_or_default();
            names.extend(registry.names_in_kits(&kit_names));
            tools = Some(names);
        }

        let retention_override = match block.param_str("retention_mode") {
            None => None,
            Some(raw) => {
                let mode = match raw {
                    "full" => RetentionMode::Full,
                    "summary" => RetentionMode::Summary,
                    "reference" => RetentionMode::Reference,
                    "pin" => RetentionMode::Pin,
                    other => {
                        return Err(RuntimeError::Config(format!(
                            "unknown retention_mode '{other}'"
                        )))
                    }
                };
                let max_length = block
                    .param_f64("retention_max_length")
                    .map(|n| n as usize)
                    .unwrap_or(RetentionPolicy::default().max_length);
                Some(RetentionPolicy {
                    mode,
                    max_length,
                    ttl_turns: None,
                })
            }
        };

        Ok(Self {
            tools,
            model: block.param_str("model").map(str::to_string),
            system_prompt: block.param_str("system_prompt").map(str::to_string),
            output: OutputFormat::parse(block.param_str("output"))?,
            on_stop: block.param_str("on_stop").map(HookHandler::parse),
            multi_tool_calls: block.param_bool("multi_tool_calls").unwrap_or(true),
            max_retries: block
                .param_f64("max_retries")
                .map(|n| n as u32)
                .unwrap_or(defaults.default_max_retries),
            threshold: block
                .param_f64("threshold")
                .unwrap_or(defaults.default_threshold),
            dedup: block.param_bool("dedup").unwrap_or(defaults.dedup_enabled),
            retention_override,
            output_var: block.output_var.clone(),
            body: block.body.clone(),
        })
    }
}

/// Pending tool batch, kept across a tool interrupt.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PendingTools {
    pub calls: Vec<ParsedToolCall>,
    pub next_index: usize,
}

/// Serializable per-invocation loop state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExploreTurnState {
    pub attempt: u32,
    pub session_counter: u64,
    pub turns: u32,
    pub started: bool,
    pub tool_calls_total: u32,
    pub last_answer: String,
    pub last_llm_stage: Option<String>,
    pub dedup_seen: HashMap<String, String>,
    pub pending: Option<PendingTools>,
}

/// Outcome of one atomic turn.
pub enum TurnOutcome {
    Continue,
    Finished(ExploreOutcome),
}

/// Final result of an explore invocation.
#[derive(Clone, Debug)]
pub struct ExploreOutcome {
    pub answer: String,
    pub value: Value,
    pub attempts: u32,
    pub hook: Option<HookResult>,
}

/// Runs a whole explore block to completion (used by the plain block path,
/// plan subtasks, and verifier agents; the frame engine drives
/// [`run_turn`] directly instead, one atomic step at a time).
pub async fn run(
    ctx: &Arc<AgentContext>,
    block: &Block,
) -> Result<ExploreOutcome, RuntimeError> {
    let params = ExploreParams::from_block(block, &ctx.explore, &ctx.skills)?;
    let mut state = ExploreTurnState::default();
    loop {
        match run_turn(ctx, &params, &mut state).await? {
            TurnOutcome::Continue => {}
            TurnOutcome::Finished(outcome) => return Ok(outcome),
        }
    }
}

/// Executes one atomic unit: one LLM turn plus its tool responses (or, when
/// resuming from an intervention, the remainder of the pending tool batch).
pub async fn run_turn(
    ctx: &Arc<AgentContext>,
    params: &ExploreParams,
    state: &mut ExploreTurnState,
) -> Result<TurnOutcome, RuntimeError> {
    if !state.started {
        state.started = true;
        if let Some(system_prompt) = &params.system_prompt {
            ctx.add_message(BucketName::System, Message::system(system_prompt.clone()))?;
        }
        let body = crate::blocks::render_template(&params.body, ctx);
        if !body.trim().is_empty() {
            ctx.add_message(BucketName::History, Message::user(body))?;
        }
    }

    // Remainder of an interrupted tool batch: inject the intervention result,
    // then run the rest. No LLM turn happens in this step.
    if state.pending.is_some() {
        inject_intervention_result(ctx, state)?;
        execute_pending(ctx, params, state).await?;
        return Ok(TurnOutcome::Continue);
    }

    ctx.check_user_interrupt()?;

    if state.turns >= ctx.explore.max_turns {
        debug!(turns = state.turns, "explore turn budget exhausted");
        return finish(ctx, params, state, None);
    }
    state.turns += 1;

    // Build the prompt under budget, with the output contract appended.
    let mut messages = assemble_checked(&ctx.messages, &ctx.compression, &ctx.estimator)?;
    if let Some(contract) = params.output.contract() {
        messages.push(Message::system(contract));
    }

    let tool_filter = params.tools.as_deref();
    let schemas = ctx.skills.tool_schemas(tool_filter);
    let tools = if schemas.is_empty() {
        None
    } else {
        Some(schemas)
    };

    // Stream one LLM turn into a stage.
    let stage_id = ctx.recorder.start_stage(StageKind::Llm, &ctx.agent_name);
    state.last_llm_stage = Some(stage_id.clone());
    let chat_params = ChatParams::new(
        params
            .model
            .clone()
            .unwrap_or_else(|| ctx.driver.model_name().to_string()),
    );
    let stream = ctx
        .driver
        .chat_stream(
            &messages,
            tools.as_deref(),
            &chat_params,
            ctx.cancel.child_token(),
        )
        .await;
    let mut stream = match stream {
        Ok(s) => s,
        Err(e) => {
            ctx.recorder.end_stage(&stage_id, StageStatus::Failed);
            return Err(e.into());
        }
    };

    let mut last = ChatChunk::default();
    let mut sent_answer = 0usize;
    let mut sent_think = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                ctx.recorder.end_stage(&stage_id, StageStatus::Failed);
                return Err(e.into());
            }
        };
        emit_increment(ctx, &chunk.content, &mut sent_answer, false);
        emit_increment(ctx, &chunk.reasoning_content, &mut sent_think, true);
        ctx.recorder.update_stage(
            &stage_id,
            StageUpdate {
                answer: Some(chunk.content.clone()),
                think: Some(chunk.reasoning_content.clone()),
                ..Default::default()
            },
        );
        last = chunk;
    }
    let item = finalize_turn(last, &mut state.session_counter);
    if let Some(usage) = &item.usage {
        crate::blocks::record_usage(ctx, &stage_id, usage);
    }
    ctx.recorder.end_stage(&stage_id, StageStatus::Completed);
    state.last_answer = item.answer.clone();

    // Complete tool calls only; optionally limited to one per turn.
    let mut calls: Vec<ParsedToolCall> = item
        .tool_calls
        .iter()
        .filter(|c| c.is_complete)
        .cloned()
        .collect();
    if !params.multi_tool_calls {
        calls.truncate(1);
    }

    // Record the assistant message with exactly the calls that will execute,
    // so every tool_call id gets a matching response.
    let assistant = if calls.is_empty() {
        Message::assistant(item.answer.clone())
    } else {
        Message::assistant_with_tool_calls(
            item.answer.clone(),
            calls
                .iter()
                .map(|c| ToolCallDescriptor {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    arguments: if c.raw_arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        c.raw_arguments.clone()
                    },
                })
                .collect(),
        )
    };
    ctx.add_message(BucketName::History, assistant)?;

    if calls.is_empty() {
        // Plan guardrail has the highest priority: while a plan is active the
        // loop must not stop, whatever the model says.
        if ctx.has_active_plan() {
            if let Some(summary) = ctx.plan_summary() {
                let open = summary.running_tasks + summary.pending_tasks;
                ctx.add_message(
                    BucketName::Control,
                    Message::system(format!(
                        "{open} plan tasks are not finished yet; call `_wait(15)` and then \
                         `_check_progress` before concluding."
                    )),
                )?;
            }
            return Ok(TurnOutcome::Continue);
        }

        if let Some(handler) = &params.on_stop {
            let input = HookInput {
                answer: item.answer.clone(),
                think: item.think.clone(),
                steps: state.turns,
                tool_calls_count: state.tool_calls_total,
                attempt: state.attempt,
            };
            let hook = evaluate(handler, &input, ctx, params.threshold).await?;
            if hook.retry && state.attempt < params.max_retries {
                state.attempt += 1;
                ctx.add_message(
                    BucketName::Scratchpad,
                    Message::user(feedback_message(&hook, state.attempt)),
                )?;
                return Ok(TurnOutcome::Continue);
            }
            return finish(ctx, params, state, Some(hook));
        }
        return finish(ctx, params, state, None);
    }

    state.pending = Some(PendingTools {
        calls,
        next_index: 0,
    });
    execute_pending(ctx, params, state).await?;
    Ok(TurnOutcome::Continue)
}

/// Streams the not-yet-sent suffix of accumulated text to the sink.
fn emit_increment(ctx: &AgentContext, accumulated: &str, sent: &mut usize, thinking: bool) {
    let chars: Vec<char> = accumulated.chars().collect();
    if chars.len() <= *sent {
        return;
    }
    let piece: String = chars[*sent..].iter().collect();
    *sent = chars.len();
    let event = if thinking {
        SinkEvent::ThinkingChunk { content: piece }
    } else {
        SinkEvent::AnswerChunk { content: piece }
    };
    ctx.write_output(&event);
}

/// On resume after an intervention, fabricate the tool response for the
/// interrupted call from the `tool_result` variable.
fn inject_intervention_result(
    ctx: &Arc<AgentContext>,
    state: &mut ExploreTurnState,
) -> Result<(), RuntimeError> {
    let Some(pending) = state.pending.as_mut() else {
        return Ok(());
    };
    let Some(result) = ctx.vars.get("tool_result") else {
        return Ok(());
    };
    let Some(call) = pending.calls.get(pending.next_index) else {
        return Ok(());
    };

    let content = crate::cache::stringify_raw(&result);
    let stage_id = ctx
        .recorder
        .start_stage(StageKind::ToolResponse, &ctx.agent_name);
    ctx.recorder.update_stage(
        &stage_id,
        StageUpdate {
            answer: Some(content.clone()),
            skill_info: Some(serde_json::json!({
                "name": call.name,
                "args": call.arguments,
                "output": content,
            })),
            ..Default::default()
        },
    );
    ctx.recorder.end_stage(&stage_id, StageStatus::Completed);

    let mut metadata = Map::new();
    metadata.insert("intervention".into(), Value::Bool(true));
    ctx.add_message(
        BucketName::History,
        Message::tool(call.id.clone(), content).with_metadata(metadata),
    )?;
    pending.next_index += 1;
    ctx.vars.delete("tool_result");
    Ok(())
}

/// Executes the pending tool batch sequentially, in index order. A tool
/// interrupt re-raises with the batch position saved in `state.pending`; a
/// regular error becomes an error tool-response and the batch continues.
async fn execute_pending(
    ctx: &Arc<AgentContext>,
    params: &ExploreParams,
    state: &mut ExploreTurnState,
) -> Result<(), RuntimeError> {
    let Some(pending) = state.pending.clone() else {
        return Ok(());
    };
    let dedup = Deduplicator::from_seen(params.dedup, state.dedup_seen.clone());
    let sctx = crate::skill::SkillContext::new(Arc::clone(ctx));

    for i in pending.next_index..pending.calls.len() {
        let call = &pending.calls[i];
        let stage_id = ctx.recorder.start_stage(StageKind::Skill, &ctx.agent_name);
        ctx.recorder.update_stage(
            &stage_id,
            StageUpdate {
                skill_info: Some(serde_json::json!({
                    "name": call.name,
                    "args": call.arguments,
                })),
                ..Default::default()
            },
        );
        ctx.write_output(&SinkEvent::SkillStart {
            name: call.name.clone(),
            args: call.arguments.clone(),
        });

        match invoke(&sctx, &call.name, call.arguments.clone(), Some(&dedup)).await {
            Ok(outcome) => {
                state.tool_calls_total += 1;
                let record = outcome.record();
                let policy = params
                    .retention_override
                    .clone()
                    .or_else(|| ctx.skills.retention_for(&call.name));
                // Summary/reference renderings promise the full content back
                // through `_get_result_detail`; pin so eviction cannot break
                // that promise mid-run.
                if matches!(
                    policy.as_ref().map(|p| p.mode),
                    Some(RetentionMode::Summary) | Some(RetentionMode::Reference)
                ) {
                    ctx.cache.pin(&record.reference_id).await?;
                }
                let rendered = on_before_send_to_context(record, policy.as_ref());

                let mut metadata = rendered.metadata.clone();
                if outcome.was_deduplicated() {
                    metadata.insert("deduplicated".into(), Value::Bool(true));
                }
                ctx.recorder.update_stage(
                    &stage_id,
                    StageUpdate {
                        answer: Some(rendered.content.clone()),
                        skill_info: Some(serde_json::json!({
                            "name": call.name,
                            "args": call.arguments,
                            "output": rendered.content,
                        })),
                        metadata: Some(metadata.clone()),
                        ..Default::default()
                    },
                );
                ctx.recorder.end_stage(&stage_id, StageStatus::Completed);
                ctx.write_output(&SinkEvent::SkillEnd {
                    name: call.name.clone(),
                    ok: true,
                });
                ctx.add_message(
                    BucketName::History,
                    Message::tool(call.id.clone(), rendered.content).with_metadata(metadata),
                )?;
            }
            Err(crate::skill::SkillError::Interrupt(interrupt)) => {
                // Save the batch position so resume continues exactly here.
                state.dedup_seen = dedup.seen();
                if let Some(p) = state.pending.as_mut() {
                    p.next_index = i;
                }
                ctx.write_output(&SinkEvent::SkillEnd {
                    name: call.name.clone(),
                    ok: false,
                });
                return Err(RuntimeError::ToolInterrupt(interrupt));
            }
            Err(crate::skill::SkillError::UserInterrupt) => {
                state.dedup_seen = dedup.seen();
                if let Some(p) = state.pending.as_mut() {
                    p.next_index = i;
                }
                return Err(RuntimeError::UserInterrupt);
            }
            Err(e) => {
                let mut metadata = Map::new();
                metadata.insert("error".into(), Value::Bool(true));
                ctx.recorder.update_stage(
                    &stage_id,
                    StageUpdate {
                        answer: Some(e.to_string()),
                        metadata: Some(metadata.clone()),
                        ..Default::default()
                    },
                );
                ctx.recorder.end_stage(&stage_id, StageStatus::Failed);
                ctx.write_output(&SinkEvent::SkillEnd {
                    name: call.name.clone(),
                    ok: false,
                });
                ctx.add_message(
                    BucketName::History,
                    Message::tool(call.id.clone(), format!("Error: {e}"))
                        .with_metadata(metadata),
                )?;
            }
        }
        if let Some(p) = state.pending.as_mut() {
            p.next_index = i + 1;
        }
    }

    state.dedup_seen = dedup.seen();
    state.pending = None;
    Ok(())
}

/// Terminates the invocation: coerce, bind, mark the closing stage.
fn finish(
    ctx: &Arc<AgentContext>,
    params: &ExploreParams,
    state: &mut ExploreTurnState,
    hook: Option<HookResult>,
) -> Result<TurnOutcome, RuntimeError> {
    let answer = state.last_answer.clone();
    let value = params.output.coerce(&answer)?;
    if let Some(var) = &params.output_var {
        ctx.vars.set(var, value.clone(), SetMode::Overwrite)?;
    }
    if let Some(stage_id) = &state.last_llm_stage {
        ctx.recorder.update_stage(
            stage_id,
            StageUpdate {
                block_answer: Some(answer.clone()),
                ..Default::default()
            },
        );
    }
    Ok(TurnOutcome::Finished(ExploreOutcome {
        answer,
        value,
        attempts: state.attempt + 1,
        hook,
    }))
}
