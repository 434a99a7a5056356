//! Parsed block records: kind, flat parameter map, body, output binding.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Block kind. Control-flow kinds (`if`, `for`, `parallel`) may nest further
/// blocks in their bodies; the executor re-parses those lazily.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Prompt,
    Explore,
    Judge,
    Tool,
    Assign,
    If,
    For,
    Parallel,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Prompt => "prompt",
            BlockKind::Explore => "explore",
            BlockKind::Judge => "judge",
            BlockKind::Tool => "tool",
            BlockKind::Assign => "assign",
            BlockKind::If => "if",
            BlockKind::For => "for",
            BlockKind::Parallel => "parallel",
        }
    }

    /// Whether the body may itself contain nested blocks.
    pub fn is_compound(&self) -> bool {
        matches!(self, BlockKind::If | BlockKind::For | BlockKind::Parallel)
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(BlockKind::Prompt),
            "explore" => Ok(BlockKind::Explore),
            "judge" => Ok(BlockKind::Judge),
            "tool" => Ok(BlockKind::Tool),
            "assign" => Ok(BlockKind::Assign),
            "if" => Ok(BlockKind::If),
            "for" => Ok(BlockKind::For),
            "parallel" => Ok(BlockKind::Parallel),
            other => Err(other.to_string()),
        }
    }
}

/// One header parameter value: a string, number, or boolean literal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ParamValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// A parsed block. Immutable after parsing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    /// Flat key → value parameters from the header.
    pub params: BTreeMap<String, ParamValue>,
    /// Inline body text between the header and the matching `@end`.
    pub body: String,
    /// Variable that receives the block result, from `-> name`.
    pub output_var: Option<String>,
    /// 1-based line span `(header, end)` in the source file.
    pub line_range: (usize, usize),
}

impl Block {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(ParamValue::as_str)
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(ParamValue::as_f64)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(ParamValue::as_bool)
    }
}
