//! `on_stop` hooks: verifier evaluation at explore termination.
//!
//! Two handler shapes: a restricted expression (evaluated in-process) and a
//! verifier agent (`@name`, run in a COW child context with `_hook_context`
//! injected). Expression syntax errors fail fast with a typed error; handler
//! *runtime* crashes degrade to `score=0, retry=false` with the error
//! recorded, never aborting the explore loop.

use std::sync::Arc;
use std::time::Duration;

use evalexpr::{Context, ContextWithMutableFunctions, ContextWithMutableVariables};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::context::AgentContext;
use crate::error::RuntimeError;
use crate::vars::SetMode;

/// Errors from hook configuration and evaluation.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid on_stop expression: {0}")]
    InvalidExpression(String),

    #[error("hook agent '@{0}' is not registered")]
    AgentNotFound(String),

    #[error("verifier agent failed: {0}")]
    VerifierFailed(String),

    #[error("verifier timeout after {0:?}")]
    Timeout(Duration),
}

/// Parsed `on_stop` handler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookHandler {
    /// Restricted expression over `answer`, `think`, `steps`, `tool_calls_count`.
    Expression(String),
    /// Verifier agent file registered under this name.
    Agent(String),
}

impl HookHandler {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('@') {
            Some(name) => HookHandler::Agent(name.to_string()),
            None => HookHandler::Expression(raw.to_string()),
        }
    }
}

/// Inputs exposed to a hook.
#[derive(Clone, Debug)]
pub struct HookInput {
    pub answer: String,
    pub think: String,
    pub steps: u32,
    pub tool_calls_count: u32,
    pub attempt: u32,
}

/// Result of one hook evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    pub score: f64,
    pub passed: bool,
    pub feedback: Option<String>,
    pub retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookResult {
    fn from_score(score: f64, threshold: f64) -> Self {
        let score = score.clamp(0.0, 1.0);
        let passed = score >= threshold;
        Self {
            score,
            passed,
            feedback: None,
            retry: !passed,
            error: None,
        }
    }

    /// Degraded result used when a handler crashes at runtime.
    fn degraded(error: String) -> Self {
        Self {
            score: 0.0,
            passed: false,
            feedback: None,
            retry: false,
            error: Some(error),
        }
    }
}

/// Evaluates a handler. Syntax errors and unregistered hook agents propagate
/// as typed errors; runtime failures degrade per the error ladder.
pub async fn evaluate(
    handler: &HookHandler,
    input: &HookInput,
    ctx: &Arc<AgentContext>,
    threshold: f64,
) -> Result<HookResult, RuntimeError> {
    match handler {
        HookHandler::Expression(expr) => {
            let tree = evalexpr::build_operator_tree(expr)
                .map_err(|e| HookError::InvalidExpression(e.to_string()))?;
            match eval_expression(&tree, input) {
                Ok(score) => Ok(HookResult::from_score(score, threshold)),
                Err(e) => {
                    warn!(error = %e, "on_stop expression failed at runtime; degrading");
                    Ok(HookResult::degraded(e))
                }
            }
        }
        HookHandler::Agent(name) => {
            let content = ctx
                .hook_agents
                .get(name)
                .cloned()
                .ok_or_else(|| HookError::AgentNotFound(name.clone()))?;
            match run_verifier(ctx, name, &content, input).await {
                Ok(value) => Ok(interpret_verifier_output(&value, threshold)),
                Err(e) => {
                    warn!(hook = %name, error = %e, "verifier crashed; degrading");
                    Ok(HookResult::degraded(e.to_string()))
                }
            }
        }
    }
}

/// Evaluates the restricted expression with only the allowed names and
/// functions (`len`, `min`, `max`, `abs`) available.
fn eval_expression(tree: &evalexpr::Node, input: &HookInput) -> Result<f64, String> {
    let mut context: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
    context
        .set_builtin_functions_disabled(true)
        .map_err(|e| e.to_string())?;
    context
        .set_value("answer".into(), evalexpr::Value::String(input.answer.clone()))
        .map_err(|e| e.to_string())?;
    context
        .set_value("think".into(), evalexpr::Value::String(input.think.clone()))
        .map_err(|e| e.to_string())?;
    context
        .set_value("steps".into(), evalexpr::Value::Int(input.steps as i64))
        .map_err(|e| e.to_string())?;
    context
        .set_value(
            "tool_calls_count".into(),
            evalexpr::Value::Int(input.tool_calls_count as i64),
        )
        .map_err(|e| e.to_string())?;

    install_allowed_functions(&mut context)?;

    let value = tree.eval_with_context(&context).map_err(|e| e.to_string())?;
    match value {
        evalexpr::Value::Boolean(b) => Ok(if b { 1.0 } else { 0.0 }),
        evalexpr::Value::Int(i) => Ok(i as f64),
        evalexpr::Value::Float(f) => Ok(f),
        other => Err(format!("expression produced non-score value {other:?}")),
    }
}

/// Registers the allowed function set (`len`, `min`, `max`, `abs`) into a
/// context with builtins disabled. Shared with the assign-block evaluator.
pub(crate) fn install_allowed_functions(
    context: &mut evalexpr::HashMapContext,
) -> Result<(), String> {
    context
        .set_function(
            "len".into(),
            evalexpr::Function::new(|arg| match arg {
                evalexpr::Value::String(s) => Ok(evalexpr::Value::Int(s.chars().count() as i64)),
                evalexpr::Value::Tuple(t) => Ok(evalexpr::Value::Int(t.len() as i64)),
                other => Err(evalexpr::EvalexprError::CustomMessage(format!(
                    "len expects a string or tuple, got {other:?}"
                ))),
            }),
        )
        .map_err(|e| e.to_string())?;
    context
        .set_function(
            "min".into(),
            evalexpr::Function::new(|arg| fold_numbers(arg, f64::min)),
        )
        .map_err(|e| e.to_string())?;
    context
        .set_function(
            "max".into(),
            evalexpr::Function::new(|arg| fold_numbers(arg, f64::max)),
        )
        .map_err(|e| e.to_string())?;
    context
        .set_function(
            "abs".into(),
            evalexpr::Function::new(|arg| match arg.as_number() {
                Ok(n) => Ok(evalexpr::Value::Float(f64::abs(n))),
                Err(e) => Err(e),
            }),
        )
        .map_err(|e| e.to_string())?;
    Ok(())
}

fn fold_numbers(
    arg: &evalexpr::Value,
    fold: fn(f64, f64) -> f64,
) -> Result<evalexpr::Value, evalexpr::EvalexprError> {
    match arg {
        evalexpr::Value::Tuple(items) => {
            let mut acc: Option<f64> = None;
            for item in items {
                let n = item.as_number()?;
                acc = Some(match acc {
                    Some(a) => fold(a, n),
                    None => n,
                });
            }
            match acc {
                Some(n) => Ok(evalexpr::Value::Float(n)),
                None => Err(evalexpr::EvalexprError::CustomMessage(
                    "min/max need at least one argument".to_string(),
                )),
            }
        }
        single => Ok(evalexpr::Value::Float(single.as_number()?)),
    }
}

/// Runs the verifier agent file in an isolated COW context with only
/// `_hook_context` injected, under the verifier timeout.
async fn run_verifier(
    ctx: &Arc<AgentContext>,
    name: &str,
    content: &str,
    input: &HookInput,
) -> Result<Value, HookError> {
    let blocks = skein_dsl::parse_agent_file(content)
        .map_err(|e| HookError::VerifierFailed(e.to_string()))?;
    let child = ctx.child_for_hook(name);
    child
        .vars
        .set_reserved(
            "_hook_context",
            json!({
                "attempt": input.attempt,
                "stage": "on_stop",
                "answer": input.answer,
                "think": input.think,
                "steps": input.steps,
                "tool_calls": input.tool_calls_count,
            }),
            SetMode::Overwrite,
        )
        .map_err(|e| HookError::VerifierFailed(e.to_string()))?;

    let run = Box::pin(crate::blocks::run_blocks(child.clone(), Arc::new(blocks.clone())));
    tokio::time::timeout(ctx.explore.verifier_timeout, run)
        .await
        .map_err(|_| HookError::Timeout(ctx.explore.verifier_timeout))?
        .map_err(|e| HookError::VerifierFailed(e.to_string()))?;

    // The verifier's verdict is the last block's output variable.
    let verdict = blocks
        .iter()
        .rev()
        .find_map(|b| b.output_var.as_ref())
        .and_then(|var| child.vars.get(var))
        .unwrap_or(Value::Null);
    Ok(verdict)
}

/// Parses `{score, passed?, feedback?, retry?}` or a bare number.
fn interpret_verifier_output(value: &Value, threshold: f64) -> HookResult {
    let from_object = |obj: &serde_json::Map<String, Value>| -> HookResult {
        let score = obj
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let passed = obj
            .get("passed")
            .and_then(Value::as_bool)
            .unwrap_or(score >= threshold);
        HookResult {
            score,
            passed,
            feedback: obj
                .get("feedback")
                .and_then(Value::as_str)
                .map(str::to_string),
            retry: obj.get("retry").and_then(Value::as_bool).unwrap_or(!passed),
            error: None,
        }
    };

    match value {
        Value::Number(n) => HookResult::from_score(n.as_f64().unwrap_or(0.0), threshold),
        Value::Bool(b) => HookResult::from_score(if *b { 1.0 } else { 0.0 }, threshold),
        Value::Object(obj) => from_object(obj),
        Value::String(s) => {
            if let Ok(n) = s.trim().parse::<f64>() {
                return HookResult::from_score(n, threshold);
            }
            match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(obj)) => from_object(&obj),
                _ => HookResult::degraded(format!("unparseable verifier output: {s}")),
            }
        }
        other => HookResult::degraded(format!("unparseable verifier output: {other}")),
    }
}

/// Builds the user-visible feedback message appended to the scratchpad on retry.
pub fn feedback_message(result: &HookResult, attempt: u32) -> String {
    let feedback = result
        .feedback
        .as_deref()
        .unwrap_or("The answer did not pass verification.");
    format!(
        "Verification failed (score {:.2}, attempt {}). {} Please improve the answer.",
        result.score,
        attempt + 1,
        feedback
    )
}
