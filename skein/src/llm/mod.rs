//! LLM driver abstraction: streaming chat with multi-tool-call parsing.
//!
//! A driver exposes one operation, [`LlmDriver::chat_stream`], returning a
//! stream of [`ChatChunk`]s. Chunks carry *accumulated* content so consumers
//! can compute deltas; tool-call data is keyed by provider index and is never
//! dropped. Implementations: [`MockDriver`] (scripted turns, tests) and
//! [`OpenAiDriver`] (OpenAI-style SSE baseline; other provider dialects are
//! normalized to this shape by their drivers).

mod mock;
mod openai;

pub use mock::{MockDriver, ScriptedToolCall, ScriptedTurn};
pub use openai::OpenAiDriver;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Errors from a driver. IO failures are typed, never silent truncation.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),
}

/// Token usage for one completion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl LlmUsage {
    pub fn add(&mut self, other: &LlmUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Accumulated state of one tool call across deltas.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolCallData {
    /// Provider-supplied call id, preserved verbatim when present.
    pub id: Option<String>,
    pub name: String,
    /// Argument fragments in arrival order; join to get the full JSON text.
    pub arguments_delta_list: Vec<String>,
}

impl ToolCallData {
    pub fn arguments(&self) -> String {
        self.arguments_delta_list.concat()
    }
}

/// One streamed chunk. `content` and `reasoning_content` are accumulated;
/// `tool_calls_data` maps provider index to the call state so far.
#[derive(Clone, Debug, Default)]
pub struct ChatChunk {
    pub content: String,
    pub reasoning_content: String,
    pub tool_calls_data: BTreeMap<u32, ToolCallData>,
    pub finish_reason: Option<String>,
    pub usage: Option<LlmUsage>,
}

/// Per-request parameters.
#[derive(Clone, Debug)]
pub struct ChatParams {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

impl ChatParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            timeout: Duration::from_secs(120),
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>;

/// Streaming chat driver.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    /// Model identifier echoed into envelopes.
    fn model_name(&self) -> &str;

    /// Opens a streaming chat completion. The returned stream must:
    /// iterate every entry of each delta's tool-call array (never just index
    /// 0), preserve provider call ids verbatim, fail with a typed error on
    /// IO problems, and stop promptly when `cancel` fires.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: Option<&[Value]>,
        params: &ChatParams,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, LlmError>;
}
