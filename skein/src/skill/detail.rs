//! `_get_result_detail`: system skill that reads raw results back out of the
//! result cache, with offset/limit paging.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Skill, SkillCategory, SkillContext, SkillError, SkillSpec};

const DEFAULT_LIMIT: usize = 4000;

/// Reads a cached raw result by reference id.
///
/// Auto-injected by the registry whenever any skill retains results as
/// `summary` or `reference`.
pub struct DetailSkill;

impl DetailSkill {
    pub const NAME: &'static str = "_get_result_detail";
}

#[async_trait]
impl Skill for DetailSkill {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn spec(&self) -> SkillSpec {
        SkillSpec {
            name: Self::NAME.to_string(),
            description: "Read the full content of a cached tool result by reference id. \
                          Use offset/limit to page through long results."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "reference_id": {"type": "string"},
                    "offset": {"type": "integer", "minimum": 0},
                    "limit": {"type": "integer", "minimum": 1}
                },
                "required": ["reference_id"]
            }),
            category: SkillCategory::System,
            retention: None,
        }
    }

    async fn call(&self, args: Value, ctx: &SkillContext) -> Result<Value, SkillError> {
        let reference_id = args
            .get("reference_id")
            .and_then(Value::as_str)
            .ok_or_else(|| SkillError::InvalidArgs {
                skill: Self::NAME.to_string(),
                reason: "reference_id is required".to_string(),
            })?;
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_LIMIT);

        let record = ctx
            .cache()
            .get(reference_id)
            .await
            .ok_or_else(|| SkillError::Execution {
                skill: Self::NAME.to_string(),
                reason: format!("no cached result for reference '{reference_id}'"),
            })?;

        let chars: Vec<char> = record.content.chars().collect();
        if offset >= chars.len() {
            return Ok(Value::String(String::new()));
        }
        let end = (offset + limit).min(chars.len());
        let mut out: String = chars[offset..end].iter().collect();
        let remaining = chars.len() - end;
        if remaining > 0 {
            out.push_str(&format!(
                "\n[{remaining} chars remaining; call {} with offset={end}]",
                Self::NAME
            ));
        }
        Ok(Value::String(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::context::AgentContext;
    use crate::llm::MockDriver;

    async fn ctx_with_cached(content: &str) -> (SkillContext, String) {
        let ctx = AgentContext::builder("tester")
            .driver(Arc::new(MockDriver::empty()))
            .build();
        let record = ctx
            .cache
            .store("search", &json!({}), &json!(content), None)
            .await
            .unwrap();
        (SkillContext::new(ctx), record.reference_id)
    }

    #[tokio::test]
    async fn reads_full_content_when_short() {
        let (sctx, reference_id) = ctx_with_cached("short result").await;
        let out = DetailSkill
            .call(json!({"reference_id": reference_id}), &sctx)
            .await
            .unwrap();
        assert_eq!(out, json!("short result"));
    }

    #[tokio::test]
    async fn pages_with_offset_and_limit() {
        let (sctx, reference_id) = ctx_with_cached("abcdefghij").await;
        let out = DetailSkill
            .call(
                json!({"reference_id": reference_id, "offset": 2, "limit": 3}),
                &sctx,
            )
            .await
            .unwrap();
        let text = out.as_str().unwrap();
        assert!(text.starts_with("cde"));
        assert!(text.contains("5 chars remaining"));
        assert!(text.contains("offset=5"));
    }

    #[tokio::test]
    async fn offset_past_end_returns_empty() {
        let (sctx, reference_id) = ctx_with_cached("abc").await;
        let out = DetailSkill
            .call(json!({"reference_id": reference_id, "offset": 10}), &sctx)
            .await
            .unwrap();
        assert_eq!(out, json!(""));
    }

    #[tokio::test]
    async fn unknown_reference_errors() {
        let (sctx, _) = ctx_with_cached("x").await;
        let err = DetailSkill
            .call(json!({"reference_id": "ref_nope"}), &sctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SkillError::Execution { .. }));
    }

    #[tokio::test]
    async fn missing_reference_id_is_invalid_args() {
        let (sctx, _) = ctx_with_cached("x").await;
        let err = DetailSkill.call(json!({}), &sctx).await.unwrap_err();
        assert!(matches!(err, SkillError::InvalidArgs { .. }));
    }
}
