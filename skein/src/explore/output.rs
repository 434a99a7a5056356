//! Output-format coercion for block answers.

use serde_json::Value;

use crate::error::RuntimeError;

/// Declared output format of a block (`output` parameter).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// The raw answer string.
    #[default]
    Raw,
    /// A single JSON value.
    Json,
    /// One JSON value per line, collected into a list.
    Jsonl,
    /// A JSON object expected to match the named type.
    Obj(String),
}

impl OutputFormat {
    pub fn parse(raw: Option<&str>) -> Result<Self, RuntimeError> {
        match raw {
            None | Some("raw") => Ok(OutputFormat::Raw),
            Some("json") => Ok(OutputFormat::Json),
            Some("jsonl") => Ok(OutputFormat::Jsonl),
            Some(other) => match other.strip_prefix("obj/") {
                Some(name) if !name.is_empty() => Ok(OutputFormat::Obj(name.to_string())),
                _ => Err(RuntimeError::OutputFormat(format!(
                    "unknown output format '{other}'"
                ))),
            },
        }
    }

    /// Instruction appended to the prompt when a format is declared.
    pub fn contract(&self) -> Option<String> {
        match self {
            OutputFormat::Raw => None,
            OutputFormat::Json => {
                Some("Return the final answer as a single JSON value, nothing else.".to_string())
            }
            OutputFormat::Jsonl => Some(
                "Return the final answer as JSON Lines: one JSON object per line, nothing else."
                    .to_string(),
            ),
            OutputFormat::Obj(name) => Some(format!(
                "Return the final answer as a single JSON object of type {name}, nothing else."
            )),
        }
    }

    /// Coerces the accumulated answer into the declared format.
    pub fn coerce(&self, answer: &str) -> Result<Value, RuntimeError> {
        match self {
            OutputFormat::Raw => Ok(Value::String(answer.to_string())),
            OutputFormat::Json => {
                serde_json::from_str(strip_fences(answer)).map_err(|e| {
                    RuntimeError::OutputFormat(format!("answer is not valid JSON: {e}"))
                })
            }
            OutputFormat::Jsonl => {
                let mut items = Vec::new();
                for (i, line) in strip_fences(answer).lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: Value = serde_json::from_str(line).map_err(|e| {
                        RuntimeError::OutputFormat(format!("line {} is not valid JSON: {e}", i + 1))
                    })?;
                    items.push(value);
                }
                Ok(Value::Array(items))
            }
            OutputFormat::Obj(name) => {
                let value: Value = serde_json::from_str(strip_fences(answer)).map_err(|e| {
                    RuntimeError::OutputFormat(format!("answer is not valid JSON: {e}"))
                })?;
                if !value.is_object() {
                    return Err(RuntimeError::OutputFormat(format!(
                        "expected a JSON object for type {name}"
                    )));
                }
                Ok(value)
            }
        }
    }
}

/// Strips a surrounding markdown code fence, if any.
fn strip_fences(answer: &str) -> &str {
    let trimmed = answer.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_recognizes_all_formats() {
        assert_eq!(OutputFormat::parse(None).unwrap(), OutputFormat::Raw);
        assert_eq!(OutputFormat::parse(Some("json")).unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::parse(Some("jsonl")).unwrap(), OutputFormat::Jsonl);
        assert_eq!(
            OutputFormat::parse(Some("obj/Report")).unwrap(),
            OutputFormat::Obj("Report".into())
        );
        assert!(OutputFormat::parse(Some("xml")).is_err());
        assert!(OutputFormat::parse(Some("obj/")).is_err());
    }

    #[test]
    fn raw_passes_through() {
        assert_eq!(
            OutputFormat::Raw.coerce("hello").unwrap(),
            Value::String("hello".into())
        );
    }

    #[test]
    fn json_coercion_strips_fences() {
        let answer = "```json\n{\"a\": 1}\n```";
        assert_eq!(OutputFormat::Json.coerce(answer).unwrap(), json!({"a": 1}));
        assert!(OutputFormat::Json.coerce("not json").is_err());
    }

    #[test]
    fn jsonl_collects_lines_and_skips_blanks() {
        let answer = "{\"a\": 1}\n\n{\"b\": 2}\n";
        assert_eq!(
            OutputFormat::Jsonl.coerce(answer).unwrap(),
            json!([{"a": 1}, {"b": 2}])
        );
        assert!(OutputFormat::Jsonl.coerce("{\"a\": 1}\nnope").is_err());
    }

    #[test]
    fn obj_requires_an_object() {
        let fmt = OutputFormat::Obj("Report".into());
        assert_eq!(fmt.coerce("{\"title\": \"x\"}").unwrap(), json!({"title": "x"}));
        assert!(fmt.coerce("[1, 2]").is_err());
    }

    #[test]
    fn contracts_exist_for_non_raw() {
        assert!(OutputFormat::Raw.contract().is_none());
        assert!(OutputFormat::Json.contract().is_some());
        assert!(OutputFormat::Obj("T".into()).contract().unwrap().contains('T'));
    }
}
