//! `${path}` interpolation in block bodies and parameters.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::context::AgentContext;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}")
            .unwrap_or_else(|e| panic!("invalid template pattern: {e}"))
    })
}

/// Replaces `${a.b.c}` with the variable value: strings verbatim, everything
/// else as compact JSON. Unknown paths render as an empty string.
pub fn render_template(text: &str, ctx: &AgentContext) -> String {
    pattern()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match ctx.get_var(&caps[1]) {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => String::new(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockDriver;
    use crate::vars::SetMode;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> Arc<AgentContext> {
        AgentContext::builder("t")
            .driver(Arc::new(MockDriver::empty()))
            .build()
    }

    #[test]
    fn renders_strings_verbatim_and_values_as_json() {
        let ctx = ctx();
        ctx.set_var("name", json!("world"), SetMode::Overwrite).unwrap();
        ctx.set_var("count", json!(3), SetMode::Overwrite).unwrap();
        assert_eq!(
            render_template("hello ${name}, ${count} times", &ctx),
            "hello world, 3 times"
        );
    }

    #[test]
    fn renders_dotted_paths() {
        let ctx = ctx();
        ctx.set_var("user.name", json!("ada"), SetMode::Overwrite).unwrap();
        assert_eq!(render_template("${user.name}", &ctx), "ada");
    }

    #[test]
    fn unknown_paths_render_empty() {
        let ctx = ctx();
        assert_eq!(render_template("[${missing}]", &ctx), "[]");
    }

    #[test]
    fn text_without_placeholders_is_untouched(){
        let ctx = ctx();
        assert_eq!(render_template("plain $text {x}", &ctx), "plain $text {x}");
    }
}
