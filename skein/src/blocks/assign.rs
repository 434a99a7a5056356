//! Assign block: evaluate an expression or literal and write a variable.

use std::sync::Arc;

use evalexpr::{Context, ContextWithMutableFunctions, ContextWithMutableVariables};
use serde_json::Value;

use skein_dsl::Block;

use crate::context::AgentContext;
use crate::error::RuntimeError;
use crate::recorder::{StageKind, StageStatus, StageUpdate};
use crate::vars::SetMode;

use super::render_template;

pub async fn execute(ctx: &Arc<AgentContext>, block: &Block) -> Result<(), RuntimeError> {
    let var = block
        .output_var
        .clone()
        .ok_or_else(|| RuntimeError::Config("assign block requires '-> variable'".to_string()))?;
    let mode = match block.param_str("mode") {
        Some("append") => SetMode::Append,
        Some("overwrite") | None => SetMode::Overwrite,
        Some(other) => {
            return Err(RuntimeError::Config(format!("unknown assign mode '{other}'")))
        }
    };

    let value = if let Some(expr) = block.param_str("expr") {
        eval_assign_expr(ctx, expr)?
    } else if let Some(literal) = block.params.get("value") {
        literal.to_json()
    } else {
        let rendered = render_template(&block.body, ctx);
        let trimmed = rendered.trim();
        // Bodies that parse as JSON assign the parsed value, otherwise text.
        serde_json::from_str(trimmed).unwrap_or(Value::String(trimmed.to_string()))
    };

    let stage_id = ctx.recorder.start_stage(StageKind::Assign, &ctx.agent_name);
    ctx.recorder.update_stage(
        &stage_id,
        StageUpdate {
            answer: Some(crate::cache::stringify_raw(&value)),
            ..Default::default()
        },
    );
    let result = ctx.vars.set(&var, value, mode);
    match result {
        Ok(()) => {
            ctx.recorder.end_stage(&stage_id, StageStatus::Completed);
            Ok(())
        }
        Err(e) => {
            ctx.recorder.end_stage(&stage_id, StageStatus::Failed);
            Err(e.into())
        }
    }
}

/// Evaluates a restricted expression over the top-level scalar variables.
fn eval_assign_expr(ctx: &AgentContext, expr: &str) -> Result<Value, RuntimeError> {
    let tree = evalexpr::build_operator_tree(expr)
        .map_err(|e| RuntimeError::Config(format!("invalid assign expression: {e}")))?;

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
        .map_err(|e| RuntimeError::Config(format!("assign expression failed: {e}")))?;
    Ok(match value {
        evalexpr::Value::String(s) => Value::String(s),
        evalexpr::Value::Int(i) => Value::Number(i.into()),
        evalexpr::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        evalexpr::Value::Boolean(b) => Value::Bool(b),
        evalexpr::Value::Tuple(items) => Value::Array(
            items
                .into_iter()
                .map(|v| match v {
                    evalexpr::Value::String(s) => Value::String(s),
                    evalexpr::Value::Int(i) => Value::Number(i.into()),
                    evalexpr::Value::Float(f) => serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                    evalexpr::Value::Boolean(b) => Value::Bool(b),
                    _ => Value::Null,
                })
                .collect(),
        ),
        evalexpr::Value::Empty => Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockDriver;
    use serde_json::json;
    use skein_dsl::parse_agent_file;

    fn ctx() -> Arc<AgentContext> {
        AgentContext::builder("t")
            .driver(Arc::new(MockDriver::empty()))
            .build()
    }

    async fn run(ctx: &Arc<AgentContext>, src: &str) -> Result<(), RuntimeError> {
        let blocks = parse_agent_file(src).unwrap();
        execute(ctx, &blocks[0]).await
    }

    #[tokio::test]
    async fn literal_value_assigns() {
        let ctx = ctx();
        run(&ctx, "@assign(value=42) -> n\n@end\n").await.unwrap();
        assert_eq!(ctx.vars.get("n"), Some(json!(42.0)));
    }

    #[tokio::test]
    async fn body_json_parses_body_text_stays_text() {
        let ctx = ctx();
        run(&ctx, "@assign -> data\n{\"k\": [1, 2]}\n@end\n").await.unwrap();
        assert_eq!(ctx.vars.get("data"), Some(json!({"k": [1, 2]})));

        run(&ctx, "@assign -> text\nplain words\n@end\n").await.unwrap();
        assert_eq!(ctx.vars.get("text"), Some(json!("plain words")));
    }

    #[tokio::test]
    async fn expression_reads_variables() {
        let ctx = ctx();
        ctx.vars.set("a", json!(2), SetMode::Overwrite).unwrap();
        ctx.vars.set("b", json!(3), SetMode::Overwrite).unwrap();
        run(&ctx, "@assign(expr=\"a + b\") -> sum\n@end\n").await.unwrap();
        assert_eq!(ctx.vars.get("sum"), Some(json!(5)));
    }

    #[tokio::test]
    async fn append_mode_extends_lists() {
        let ctx = ctx();
        ctx.vars.set("log", json!(["x"]), SetMode::Overwrite).unwrap();
        run(&ctx, "@assign(mode=\"append\", value=\"y\") -> log\n@end\n")
            .await
            .unwrap();
        assert_eq!(ctx.vars.get("log"), Some(json!(["x", "y"])));
    }

    #[tokio::test]
    async fn bad_expression_is_config_error() {
        let ctx = ctx();
        let err = run(&ctx, "@assign(expr=\"1 +\") -> n\n@end\n").await.unwrap_err();
        assert!(err.to_string().contains("assign"));
    }
}
