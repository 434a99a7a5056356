//! Scripted mock driver for tests: fixed turns, chunked emission.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

use super::{ChatChunk, ChatParams, ChunkStream, LlmDriver, LlmError, LlmUsage, ToolCallData};

/// One scripted tool call emitted at the end of a turn.
#[derive(Clone, Debug)]
pub struct ScriptedToolCall {
    /// Provider id; `None` exercises the fallback-id path downstream.
    pub id: Option<String>,
    pub name: String,
    /// Full JSON argument text; split into two deltas on emission.
    pub arguments: String,
}

/// One scripted LLM turn.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTurn {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ScriptedToolCall>,
    pub usage: Option<LlmUsage>,
    /// Characters per content chunk; 0 emits the content in one chunk.
    pub chunk_chars: usize,
}

impl ScriptedTurn {
    /// A plain text turn with no tool calls (terminates an explore loop).
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_tool_call(
        mut self,
        id: Option<&str>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        self.tool_calls.push(ScriptedToolCall {
            id: id.map(str::to_string),
            name: name.into(),
            arguments: arguments.to_string(),
        });
        self
    }

    pub fn with_usage(mut self, prompt: u32, completion: u32) -> Self {
        self.usage = Some(LlmUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        });
        self
    }

    pub fn chunked(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars;
        self
    }
}

/// Driver that replays scripted turns in order. Exhausted scripts yield
/// empty stop turns, so runaway loops terminate cleanly.
pub struct MockDriver {
    turns: Mutex<Vec<ScriptedTurn>>,
    calls: AtomicUsize,
    /// Prompts seen by each call, for assertions.
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl MockDriver {
    pub fn script(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A driver that always answers with an empty stop turn.
    pub fn empty() -> Self {
        Self::script(Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmDriver for MockDriver {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        _tools: Option<&[Value]>,
        _params: &ChatParams,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());

        let turn = {
            let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
            if turns.is_empty() {
                ScriptedTurn::default()
            } else {
                turns.remove(0)
            }
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<ChatChunk, LlmError>>(16);
        tokio::spawn(async move {
            let mut acc = ChatChunk::default();

            // Reasoning first, as providers stream it before content.
            if !turn.reasoning.is_empty() {
                acc.reasoning_content = turn.reasoning.clone();
                if send_or_cancel(&tx, &cancel, acc.clone()).await.is_err() {
                    return;
                }
            }

            let chunk_chars = if turn.chunk_chars == 0 {
                turn.content.chars().count().max(1)
            } else {
                turn.chunk_chars
            };
            let chars: Vec<char> = turn.content.chars().collect();
            for piece in chars.chunks(chunk_chars) {
                acc.content.push_str(&piece.iter().collect::<String>());
                if send_or_cancel(&tx, &cancel, acc.clone()).await.is_err() {
                    return;
                }
            }

            // Tool calls: arguments split into two deltas to exercise
            // accumulation, full array iterated per delta.
            for (index, call) in turn.tool_calls.iter().enumerate() {
                let split = call.arguments.len() / 2;
                let (head, tail) = call.arguments.split_at(split);
                let entry = acc.tool_calls_data.entry(index as u32).or_default();
                *entry = ToolCallData {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments_delta_list: vec![head.to_string()],
                };
                if send_or_cancel(&tx, &cancel, acc.clone()).await.is_err() {
                    return;
                }
                if let Some(entry) = acc.tool_calls_data.get_mut(&(index as u32)) {
                    entry.arguments_delta_list.push(tail.to_string());
                }
                if send_or_cancel(&tx, &cancel, acc.clone()).await.is_err() {
                    return;
                }
            }

            acc.finish_reason = Some(if turn.tool_calls.is_empty() {
                "stop".to_string()
            } else {
                "tool_calls".to_string()
            });
            acc.usage = turn.usage.clone();
            let _ = send_or_cancel(&tx, &cancel, acc).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn send_or_cancel(
    tx: &tokio::sync::mpsc::Sender<Result<ChatChunk, LlmError>>,
    cancel: &CancellationToken,
    chunk: ChatChunk,
) -> Result<(), ()> {
    if cancel.is_cancelled() {
        let _ = tx.send(Err(LlmError::Cancelled)).await;
        return Err(());
    }
    tx.send(Ok(chunk)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    async fn drain(stream: ChunkStream) -> Vec<ChatChunk> {
        stream
            .filter_map(|c| async { c.ok() })
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn text_turn_accumulates_and_stops() {
        let driver = MockDriver::script(vec![ScriptedTurn::text("Hello").chunked(2)]);
        let stream = driver
            .chat_stream(&[], None, &ChatParams::new("mock"), CancellationToken::new())
            .await
            .unwrap();
        let chunks = drain(stream).await;
        let last = chunks.last().unwrap();
        assert_eq!(last.content, "Hello");
        assert_eq!(last.finish_reason.as_deref(), Some("stop"));
        // Accumulated: earlier chunks are prefixes.
        assert!(chunks.windows(2).all(|w| w[1].content.starts_with(&w[0].content)));
    }

    #[tokio::test]
    async fn tool_calls_arrive_with_split_arguments() {
        let driver = MockDriver::script(vec![ScriptedTurn::default()
            .with_tool_call(Some("call_x"), "_now", json!({}))
            .with_tool_call(None, "search", json!({"q": "x"}))]);
        let stream = driver
            .chat_stream(&[], None, &ChatParams::new("mock"), CancellationToken::new())
            .await
            .unwrap();
        let chunks = drain(stream).await;
        let last = chunks.last().unwrap();
        assert_eq!(last.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(last.tool_calls_data.len(), 2);
        assert_eq!(last.tool_calls_data[&0].id.as_deref(), Some("call_x"));
        assert_eq!(last.tool_calls_data[&1].id, None);
        assert_eq!(last.tool_calls_data[&1].arguments(), r#"{"q":"x"}"#);
        assert!(last.tool_calls_data[&1].arguments_delta_list.len() > 1);
    }

    #[tokio::test]
    async fn exhausted_script_yields_empty_stop() {
        let driver = MockDriver::empty();
        let stream = driver
            .chat_stream(&[], None, &ChatParams::new("mock"), CancellationToken::new())
            .await
            .unwrap();
        let chunks = drain(stream).await;
        let last = chunks.last().unwrap();
        assert_eq!(last.content, "");
        assert_eq!(last.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn records_prompts_for_assertions() {
        let driver = MockDriver::empty();
        let messages = vec![Message::user("hi")];
        let _ = driver
            .chat_stream(&messages, None, &ChatParams::new("mock"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(driver.calls(), 1);
        assert_eq!(driver.prompts()[0][0].text_content(), "hi");
    }
}
