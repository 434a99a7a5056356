//! Per-turn accumulation of an LLM stream into a parsed item.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{ChatChunk, LlmUsage};

/// One tool call parsed from a finished LLM turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedToolCall {
    /// Provider id when present, otherwise `call_{session_counter}_{index}`.
    pub id: String,
    pub name: String,
    /// Parsed argument object (`{}` for empty argument text).
    pub arguments: Value,
    /// Argument text as received, for the wire-shape descriptor.
    pub raw_arguments: String,
    /// Whether the call parsed fully (name present, arguments valid JSON).
    pub is_complete: bool,
    pub index: u32,
}

/// Accumulated result of one LLM turn.
#[derive(Clone, Debug, Default)]
pub struct StreamItem {
    pub answer: String,
    pub think: String,
    pub tool_calls: Vec<ParsedToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Option<LlmUsage>,
}

/// Finalizes the last accumulated chunk of a turn into a [`StreamItem`].
///
/// `session_counter` is bumped once per turn; fallback ids are
/// `call_{session_counter}_{index}`, unique and monotone within one explore
/// invocation and deterministic across runs of the same transcript.
pub fn finalize_turn(chunk: ChatChunk, session_counter: &mut u64) -> StreamItem {
    *session_counter += 1;
    let mut tool_calls = Vec::new();
    for (index, data) in &chunk.tool_calls_data {
        let raw_arguments = data.arguments();
        let (arguments, parsed_ok) = if raw_arguments.trim().is_empty() {
            (Value::Object(serde_json::Map::new()), true)
        } else {
            match serde_json::from_str::<Value>(&raw_arguments) {
                Ok(v) => (v, true),
                Err(_) => (Value::Null, false),
            }
        };
        let id = match &data.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("call_{}_{}", *session_counter, index),
        };
        tool_calls.push(ParsedToolCall {
            id,
            name: data.name.clone(),
            is_complete: parsed_ok && !data.name.is_empty(),
            arguments,
            raw_arguments,
            index: *index,
        });
    }
    StreamItem {
        answer: chunk.content,
        think: chunk.reasoning_content,
        tool_calls,
        finish_reason: chunk.finish_reason,
        usage: chunk.usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCallData;
    use serde_json::json;

    fn chunk_with_calls(calls: Vec<(u32, Option<&str>, &str, &str)>) -> ChatChunk {
        let mut chunk = ChatChunk::default();
        for (index, id, name, args) in calls {
            chunk.tool_calls_data.insert(
                index,
                ToolCallData {
                    id: id.map(str::to_string),
                    name: name.to_string(),
                    arguments_delta_list: vec![args.to_string()],
                },
            );
        }
        chunk
    }

    #[test]
    fn provider_ids_are_preserved_verbatim() {
        let mut counter = 0;
        let item = finalize_turn(
            chunk_with_calls(vec![(0, Some("call_x"), "_now", "{}")]),
            &mut counter,
        );
        assert_eq!(item.tool_calls[0].id, "call_x");
        assert!(item.tool_calls[0].is_complete);
    }

    #[test]
    fn fallback_ids_are_monotone_per_turn_and_index() {
        let mut counter = 0;
        let first = finalize_turn(
            chunk_with_calls(vec![(0, None, "a", "{}"), (1, None, "b", "{}")]),
            &mut counter,
        );
        assert_eq!(first.tool_calls[0].id, "call_1_0");
        assert_eq!(first.tool_calls[1].id, "call_1_1");

        let second = finalize_turn(chunk_with_calls(vec![(0, None, "a", "{}")]), &mut counter);
        assert_eq!(second.tool_calls[0].id, "call_2_0");
    }

    #[test]
    fn same_transcript_yields_identical_ids() {
        let run = || {
            let mut counter = 0;
            let mut ids = Vec::new();
            for _ in 0..3 {
                let item = finalize_turn(
                    chunk_with_calls(vec![(0, None, "a", "{}"), (1, None, "b", "{}")]),
                    &mut counter,
                );
                ids.extend(item.tool_calls.into_iter().map(|c| c.id));
            }
            ids
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn incomplete_arguments_mark_call_incomplete() {
        let mut counter = 0;
        let item = finalize_turn(
            chunk_with_calls(vec![(0, None, "search", "{\"q\": \"unterminated")]),
            &mut counter,
        );
        assert!(!item.tool_calls[0].is_complete);
        assert_eq!(item.tool_calls[0].arguments, Value::Null);
    }

    #[test]
    fn empty_arguments_parse_as_empty_object() {
        let mut counter = 0;
        let item = finalize_turn(chunk_with_calls(vec![(0, None, "_now", "")]), &mut counter);
        assert!(item.tool_calls[0].is_complete);
        assert_eq!(item.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn missing_name_marks_call_incomplete() {
        let mut counter = 0;
        let item = finalize_turn(chunk_with_calls(vec![(0, None, "", "{}")]), &mut counter);
        assert!(!item.tool_calls[0].is_complete);
    }
}
