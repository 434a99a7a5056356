//! Control-flow blocks: `if`, `for`, `parallel`.
//!
//! Bodies are re-parsed lazily and executed through the normal executor.
//! `parallel` runs each top-level sub-block as a branch task; the frame
//! registry tracks a child frame per branch so the tree stays observable,
//! and the supervision policy decides what a branch failure means.

use std::sync::Arc;

use evalexpr::{Context, ContextWithMutableFunctions, ContextWithMutableVariables};
use serde_json::Value;
use tracing::warn;

use skein_dsl::{Block, BlockKind};

use crate::context::AgentContext;
use crate::error::RuntimeError;
use crate::frame::FrameStatus;
use crate::vars::SetMode;

/// Supervision policy for parallel branches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Supervision {
    /// Retry only the failed branch (once).
    OneForOne,
    /// First failure cancels the remaining branches and fails the block.
    AllForOne,
    /// Record branch failures and keep going.
    #[default]
    AlwaysContinue,
}

impl Supervision {
    fn parse(raw: Option<&str>) -> Result<Self, RuntimeError> {
        match raw {
            None | Some("always_continue") => Ok(Supervision::AlwaysContinue),
            Some("one_for_one") => Ok(Supervision::OneForOne),
            Some("all_for_one") => Ok(Supervision::AllForOne),
            Some(other) => Err(RuntimeError::Config(format!(
                "unknown supervision policy '{other}'"
            ))),
        }
    }
}

pub async fn execute(ctx: &Arc<AgentContext>, block: &Block) -> Result<(), RuntimeError> {
    match block.kind {
        BlockKind::If => execute_if(ctx, block).await,
        BlockKind::For => execute_for(ctx, block).await,
        BlockKind::Parallel => execute_parallel(ctx, block).await,
        _ => Err(RuntimeError::Config(format!(
            "not a control block: {}",
            block.kind
        ))),
    }
}

async fn execute_if(ctx: &Arc<AgentContext>, block: &Block) -> Result<(), RuntimeError> {
    let cond = block
        .param_str("cond")
        .ok_or_else(|| RuntimeError::Config("if block requires cond=\"...\"".to_string()))?;
    if !eval_condition(ctx, cond)? {
        return Ok(());
    }
    let body = skein_dsl::parse_agent_file(&block.body)?;
    for sub in &body {
        super::execute_block(ctx, sub).await?;
    }
    Ok(())
}

async fn execute_for(ctx: &Arc<AgentContext>, block: &Block) -> Result<(), RuntimeError> {
    let item_var = block
        .param_str("item")
        .ok_or_else(|| RuntimeError::Config("for block requires item=\"name\"".to_string()))?
        .to_string();
    let source = block
        .param_str("in")
        .ok_or_else(|| RuntimeError::Config("for block requires in=\"variable\"".to_string()))?;
    let items = match ctx.get_var(source) {
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(RuntimeError::Config(format!(
                "for source '{source}' is not a list (got {other})"
            )))
        }
        None => Vec::new(),
    };

    let body = skein_dsl::parse_agent_file(&block.body)?;
    for (index, item) in items.into_iter().enumerate() {
        ctx.check_user_interrupt()?;
        ctx.vars.set(&item_var, item, SetMode::Overwrite)?;
        ctx.vars.set(
            &format!("{item_var}_index"),
            Value::Number(index.into()),
            SetMode::Overwrite,
        )?;
        for sub in &body {
            super::execute_block(ctx, sub).await?;
        }
    }
    Ok(())
}

async fn execute_parallel(ctx: &Arc<AgentContext>, block: &Block) -> Result<(), RuntimeError> {
    let policy = Supervision::parse(block.param_str("supervision"))?;
    let branches = skein_dsl::parse_agent_file(&block.body)?;
    if branches.is_empty() {
        return Ok(());
    }

    let mut handles = Vec::with_capacity(branches.len());
    for (index, branch) in branches.into_iter().enumerate() {
        let branch_ctx = Arc::clone(ctx);
        let frame_id = ctx
            .frames
            .register_eager_child(&ctx.agent_name, &format!("branch-{index}"));
        let frames = Arc::clone(&ctx.frames);
        let cancel = ctx.cancel.child_token();
        handles.push(tokio::spawn(async move {
            let run_once = |ctx: Arc<AgentContext>, branch: Block| async move {
                super::execute_block(&ctx, &branch).await
            };
            let mut result = tokio::select! {
                _ = cancel.cancelled() => Err(RuntimeError::UserInterrupt),
                r = run_once(Arc::clone(&branch_ctx), branch.clone()) => r,
            };
            if result.is_err() && policy == Supervision::OneForOne {
                warn!(branch = index, "branch failed; one_for_one retry");
                result = run_once(Arc::clone(&branch_ctx), branch).await;
            }
            let status = match &result {
                Ok(()) => FrameStatus::Completed,
                Err(_) => FrameStatus::Failed,
            };
            frames.finish_eager_child(&frame_id, status);
            (index, result)
        }));
    }

    let mut first_error: Option<RuntimeError> = None;
    for handle in handles {
        match handle.await {
            Ok((index, Err(e))) => {
                warn!(branch = index, error = %e, "parallel branch failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
                if policy == Supervision::AllForOne {
                    ctx.cancel.cancel();
                }
            }
            Ok((_, Ok(()))) => {}
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(RuntimeError::Config(format!(
                        "branch task panicked: {join_err}"
                    )));
                }
            }
        }
    }

    match (policy, first_error) {
        (Supervision::AllForOne, Some(e)) => Err(e),
        (Supervision::OneForOne, Some(e)) => Err(e),
        _ => Ok(()),
    }
}

/// Truthiness of a restricted expression over top-level variables.
fn eval_condition(ctx: &AgentContext, expr: &str) -> Result<bool, RuntimeError> {
    let tree = evalexpr::build_operator_tree(expr)
        .map_err(|e| RuntimeError::Config(format!("invalid condition: {e}")))?;
    let mut context: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
    context
        .set_builtin_functions_disabled(true)
        .map_err(|e| RuntimeError::Config(e.to_string()))?;
    for name in ctx.vars.names() {
        let Some(value) = ctx.get_var(&name) else {
            continue;
        };
        let eval_value = match value {
            Value::String(s) => evalexpr::Value::String(s),
            Value::Bool(b) => evalexpr::Value::Boolean(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => evalexpr::Value::Int(i),
                None => evalexpr::Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            _ => continue,
        };
        context
            .set_value(name, eval_value)
            .map_err(|e| RuntimeError::Config(e.to_string()))?;
    }
    crate::explore::install_allowed_functions(&mut context).map_err(RuntimeError::Config)?;

    let value = tree
        .eval_with_context(&context)
        .map_err(|e| RuntimeError::Config(format!("condition failed: {e}")))?;
    Ok(match value {
        evalexpr::Value::Boolean(b) => b,
        evalexpr::Value::Int(i) => i != 0,
        evalexpr::Value::Float(f) => f != 0.0,
        evalexpr::Value::String(s) => !s.is_empty(),
        _ => false,
    })
}
