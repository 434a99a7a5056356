//! Prompt block: one LLM turn, no tools, answer bound to the output variable.

use std::sync::Arc;

use skein_dsl::Block;

use crate::context::{AgentContext, BucketName};
use crate::error::RuntimeError;
use crate::explore::OutputFormat;
use crate::message::Message;
use crate::vars::SetMode;

use super::{llm_turn, render_template};

pub async fn execute(ctx: &Arc<AgentContext>, block: &Block) -> Result<(), RuntimeError> {
    let output = OutputFormat::parse(block.param_str("output"))?;
    let body = render_template(&block.body, ctx);
    if !body.trim().is_empty() {
        ctx.add_message(BucketName::History, Message::user(body))?;
    }

    let extra = output.contract().map(Message::system).into_iter().collect();
    let item = llm_turn(ctx, extra, block.param_str("model")).await?;

    ctx.add_message(BucketName::History, Message::assistant(item.answer.clone()))?;

    if let Some(var) = &block.output_var {
        let value = output.coerce(&item.answer)?;
        ctx.vars.set(var, value, SetMode::Overwrite)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockDriver, ScriptedTurn};
    use serde_json::json;
    use skein_dsl::parse_agent_file;

    #[tokio::test]
    async fn binds_answer_and_appends_history() {
        let ctx = AgentContext::builder("t")
            .driver(Arc::new(MockDriver::script(vec![ScriptedTurn::text("Hello")])))
            .build();
        let blocks = parse_agent_file("@prompt -> greeting\nSay hello\n@end\n").unwrap();
        execute(&ctx, &blocks[0]).await.unwrap();

        assert_eq!(ctx.vars.get("greeting"), Some(json!("Hello")));
        let history = ctx.messages.bucket(BucketName::History);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text_content(), "Hello");
    }

    #[tokio::test]
    async fn json_output_coerces_before_binding() {
        let ctx = AgentContext::builder("t")
            .driver(Arc::new(MockDriver::script(vec![ScriptedTurn::text(
                "{\"a\": 1}",
            )])))
            .build();
        let blocks =
            parse_agent_file("@prompt(output=\"json\") -> data\nGive me JSON\n@end\n").unwrap();
        execute(&ctx, &blocks[0]).await.unwrap();
        assert_eq!(ctx.vars.get("data"), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn body_interpolates_variables() {
        let driver = Arc::new(MockDriver::script(vec![ScriptedTurn::text("ok")]));
        let ctx = AgentContext::builder("t").driver(driver.clone()).build();
        ctx.vars
            .set("topic", json!("tides"), SetMode::Overwrite)
            .unwrap();
        let blocks = parse_agent_file("@prompt -> out\nSummarize ${topic}\n@end\n").unwrap();
        execute(&ctx, &blocks[0]).await.unwrap();
        let prompt = &driver.prompts()[0];
        assert!(prompt[0].text_content().contains("Summarize tides"));
    }
}
