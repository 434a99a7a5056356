//! Judge block: LLM turn with strict boolean/score extraction.

use std::sync::Arc;

use skein_dsl::Block;

use crate::context::{AgentContext, BucketName};
use crate::error::RuntimeError;
use crate::message::Message;
use crate::vars::SetMode;

use super::{llm_turn, render_template};

const VERDICT_INSTRUCTION: &str =
    "Answer strictly with `true` or `false` (or a score between 0 and 1), nothing else.";

pub async fn execute(ctx: &Arc<AgentContext>, block: &Block) -> Result<(), RuntimeError> {
    let body = render_template(&block.body, ctx);
    if !body.trim().is_empty() {
        ctx.add_message(BucketName::History, Message::user(body))?;
    }

    let mut extra = Vec::new();
    if let Some(criteria) = block.param_str("criteria") {
        extra.push(Message::system(format!("Judge against: {criteria}")));
    }
    extra.push(Message::system(VERDICT_INSTRUCTION));

    let item = llm_turn(ctx, extra, block.param_str("model")).await?;
    let threshold = block.param_f64("threshold").unwrap_or(0.5);
    let verdict = extract_verdict(&item.answer, threshold).ok_or_else(|| {
        RuntimeError::OutputFormat(format!(
            "judge answer is neither boolean nor score: '{}'",
            item.answer
        ))
    })?;

    ctx.add_message(BucketName::History, Message::assistant(item.answer.clone()))?;
    if let Some(var) = &block.output_var {
        ctx.vars
            .set(var, serde_json::Value::Bool(verdict), SetMode::Overwrite)?;
    }
    Ok(())
}

/// Strict extraction: a leading boolean word, or a leading number compared
/// against the threshold.
fn extract_verdict(answer: &str, threshold: f64) -> Option<bool> {
    let token = answer.trim().split_whitespace().next()?;
    let token = token.trim_matches(|c: char| "`\"'.,:;!".contains(c));
    match token.to_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        other => other.parse::<f64>().ok().map(|score| score >= threshold),
    }
}
