//! Tool block: direct invocation of one skill with rendered arguments.

use std::sync::Arc;

use serde_json::{Map, Value};

use run_event::SinkEvent;
use skein_dsl::Block;

use crate::context::AgentContext;
use crate::error::RuntimeError;
use crate::recorder::{StageKind, StageStatus, StageUpdate};
use crate::skill::{invoke, SkillContext};
use crate::vars::SetMode;

use super::render_template;

pub async fn execute(ctx: &Arc<AgentContext>, block: &Block) -> Result<(), RuntimeError> {
    let name = block
        .param_str("skill")
        .ok_or_else(|| RuntimeError::Config("tool block requires skill=\"name\"".to_string()))?
        .to_string();

    // Arguments come from the `args` parameter or the body, both rendered.
    let raw_args = block
        .param_str("args")
        .map(str::to_string)
        .unwrap_or_else(|| block.body.clone());
    let rendered = render_template(&raw_args, ctx);
    let args: Value = if rendered.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(&rendered).map_err(|e| {
            RuntimeError::Config(format!("tool arguments are not valid JSON: {e}"))
        })?
    };

    let stage_id = ctx.recorder.start_stage(StageKind::Skill, &ctx.agent_name);
    ctx.recorder.update_stage(
        &stage_id,
        StageUpdate {
            skill_info: Some(serde_json::json!({"name": name, "args": args})),
            ..Default::default()
        },
    );
    ctx.write_output(&SinkEvent::SkillStart {
        name: name.clone(),
        args: args.clone(),
    });

    let sctx = SkillContext::new(Arc::clone(ctx));
    match invoke(&sctx, &name, args.clone(), None).await {
        Ok(outcome) => {
            let record = outcome.record();
            ctx.recorder.update_stage(
                &stage_id,
                StageUpdate {
                    answer: Some(record.content.clone()),
                    skill_info: Some(serde_json::json!({
                        "name": name,
                        "args": args,
                        "output": record.content,
                        "reference_id": record.reference_id,
                    })),
                    ..Default::default()
                },
            );
            ctx.recorder.end_stage(&stage_id, StageStatus::Completed);
            ctx.write_output(&SinkEvent::SkillEnd {
                name: name.clone(),
                ok: true,
            });
            if let Some(var) = &block.output_var {
                ctx.vars.set(
                    var,
                    Value::String(record.content.clone()),
                    SetMode::Overwrite,
                )?;
            }
            Ok(())
        }
        Err(e) => {
            let is_interrupt = matches!(
                e,
                crate::skill::SkillError::Interrupt(_) | crate::skill::SkillError::UserInterrupt
            );
            if !is_interrupt {
                let mut metadata = Map::new();
                metadata.insert("error".into(), Value::Bool(true));
                ctx.recorder.update_stage(
                    &stage_id,
                    StageUpdate {
                        answer: Some(e.to_string()),
                        metadata: Some(metadata),
                        ..Default::default()
                    },
                );
                ctx.recorder.end_stage(&stage_id, StageStatus::Failed);
                ctx.write_output(&SinkEvent::SkillEnd {
                    name: name.clone(),
                    ok: false,
                });
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::{FnSkill, FnSkillkit, SkillRegistry, Skillkit};
    use serde_json::json;
    use skein_dsl::parse_agent_file;

    fn ctx_with_echo() -> Arc<AgentContext> {
        let registry = SkillRegistry::new();
        let kit: Arc<dyn Skillkit> = Arc::new(FnSkillkit::new(
            "base",
            vec![FnSkill::new("echo", "echo args", |args, _ctx| async move {
                Ok(json!({"echoed": args}))
            })],
        ));
        registry.register(kit).unwrap();
        AgentContext::builder("t")
            .driver(Arc::new(crate::llm::MockDriver::empty()))
            .skills(Arc::new(registry))
            .build()
    }

    #[tokio::test]
    async fn invokes_skill_and_binds_content() {
        let ctx = ctx_with_echo();
        let blocks =
            parse_agent_file("@tool(skill=\"echo\", args=\"{\\\"q\\\": 1}\") -> out\n@end\n")
                .unwrap();
        execute(&ctx, &blocks[0]).await.unwrap();
        let out = ctx.vars.get("out").unwrap();
        assert_eq!(out, json!(r#"{"echoed":{"q":1}}"#));
    }

    #[tokio::test]
    async fn body_supplies_arguments() {
        let ctx = ctx_with_echo();
        ctx.vars.set("q", json!("tides"), SetMode::Overwrite).unwrap();
        let blocks =
            parse_agent_file("@tool(skill=\"echo\") -> out\n{\"query\": \"${q}\"}\n@end\n").unwrap();
        execute(&ctx, &blocks[0]).await.unwrap();
        assert!(ctx
            .vars
            .get("out")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("tides"));
    }

    #[tokio::test]
    async fn unknown_skill_is_fatal() {
        let ctx = ctx_with_echo();
        let blocks = parse_agent_file("@tool(skill=\"nope\")\n@end\n").unwrap();
        let err = execute(&ctx, &blocks[0]).await.unwrap_err();
        assert!(err.to_string().contains("unknown skill"));
    }
}
