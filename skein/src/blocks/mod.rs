//! Block executors: prompt, judge, tool, assign, and control flow.
//!
//! Explore has its own engine (`crate::explore`); everything else lives
//! here. Executors borrow the context and own no state; control-flow blocks
//! re-parse their bodies lazily and recurse through [`execute_block`].

mod assign;
mod control;
mod judge;
mod prompt;
mod render;
mod tool;

pub use render::render_template;

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;

use run_event::SinkEvent;
use skein_dsl::{Block, BlockKind};

use crate::context::{assemble_checked, AgentContext};
use crate::error::RuntimeError;
use crate::explore::{finalize_turn, StreamItem};
use crate::llm::{ChatChunk, ChatParams, LlmUsage};
use crate::message::Message;
use crate::recorder::{StageKind, StageStatus, StageUpdate};
use crate::vars::SetMode;

/// Tags an LLM stage with its token usage and folds it into the cumulative
/// `_usage` reserved variable.
pub(crate) fn record_usage(ctx: &AgentContext, stage_id: &str, usage: &LlmUsage) {
    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "usage".to_string(),
        serde_json::to_value(usage).unwrap_or(serde_json::Value::Null),
    );
    ctx.recorder.update_stage(
        stage_id,
        StageUpdate {
            metadata: Some(metadata),
            ..Default::default()
        },
    );
    let mut total: LlmUsage = ctx
        .vars
        .get("_usage")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    total.add(usage);
    if let Ok(value) = serde_json::to_value(&total) {
        let _ = ctx.vars.set_reserved("_usage", value, SetMode::Overwrite);
    }
}

/// Executes one block against the context. Boxed so control-flow blocks can
/// recurse.
pub fn execute_block<'a>(
    ctx: &'a Arc<AgentContext>,
    block: &'a Block,
) -> BoxFuture<'a, Result<(), RuntimeError>> {
    Box::pin(async move {
        let result = match block.kind {
            BlockKind::Prompt => prompt::execute(ctx, block).await,
            BlockKind::Explore => crate::explore::run(ctx, block).await.map(|_| ()),
            BlockKind::Judge => judge::execute(ctx, block).await,
            BlockKind::Tool => tool::execute(ctx, block).await,
            BlockKind::Assign => assign::execute(ctx, block).await,
            BlockKind::If | BlockKind::For | BlockKind::Parallel => {
                control::execute(ctx, block).await
            }
        };
        result.map_err(|e| e.at_block(block.line_range.0, block.kind.as_str()))
    })
}

/// Runs a block sequence to completion, recording block boundaries.
/// Used by verifier agents, control-flow bodies, and parallel branches; the
/// frame engine drives root frames one step at a time instead.
pub async fn run_blocks(
    ctx: Arc<AgentContext>,
    blocks: Arc<Vec<Block>>,
) -> Result<(), RuntimeError> {
    for (index, block) in blocks.iter().enumerate() {
        ctx.recorder.start_block(index, block.kind.as_str());
        ctx.write_output(&SinkEvent::AgentBlockStarted {
            agent_name: ctx.agent_name.clone(),
            block_kind: block.kind.as_str().to_string(),
            block_index: index,
        });
        execute_block(&ctx, block).await?;
        ctx.write_output(&SinkEvent::AgentBlockCompleted {
            agent_name: ctx.agent_name.clone(),
            block_kind: block.kind.as_str().to_string(),
            block_index: index,
        });
    }
    Ok(())
}

/// One tool-less LLM turn over the assembled context plus `extra` messages,
/// recorded as an `llm` stage with chunk streaming to the sink.
pub(crate) async fn llm_turn(
    ctx: &Arc<AgentContext>,
    extra: Vec<Message>,
    model: Option<&str>,
) -> Result<StreamItem, RuntimeError> {
    let mut messages = assemble_checked(&ctx.messages, &ctx.compression, &ctx.estimator)?;
    messages.extend(extra);

    let stage_id = ctx.recorder.start_stage(StageKind::Llm, &ctx.agent_name);
    let params = ChatParams::new(
        model
            .map(str::to_string)
            .unwrap_or_else(|| ctx.driver.model_name().to_string()),
    );
    let stream = ctx
        .driver
        .chat_stream(&messages, None, &params, ctx.cancel.child_token())
        .await;
    let mut stream = match stream {
        Ok(s) => s,
        Err(e) => {
            ctx.recorder.end_stage(&stage_id, StageStatus::Failed);
            return Err(e.into());
        }
    };

    let mut last = ChatChunk::default();
    let mut sent = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                ctx.recorder.end_stage(&stage_id, StageStatus::Failed);
                return Err(e.into());
            }
        };
        let chars: Vec<char> = chunk.content.chars().collect();
        if chars.len() > sent {
            let piece: String = chars[sent..].iter().collect();
            sent = chars.len();
            ctx.write_output(&SinkEvent::AnswerChunk { content: piece });
        }
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
    let mut counter = 0u64;
    let item = finalize_turn(last, &mut counter);
    if let Some(usage) = &item.usage {
        record_usage(ctx, &stage_id, usage);
    }
    ctx.recorder.update_stage(
        &stage_id,
        StageUpdate {
            block_answer: Some(item.answer.clone()),
            ..Default::default()
        },
    );
    ctx.recorder.end_stage(&stage_id, StageStatus::Completed);
    Ok(item)
}
