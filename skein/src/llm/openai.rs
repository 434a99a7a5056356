//! OpenAI-style streaming driver: chat completions over SSE.
//!
//! Normalizes the wire baseline into [`ChatChunk`]s: per-delta, the full
//! `tool_calls` array is iterated (never just index 0), ids are preserved
//! verbatim, and argument fragments accumulate per index. Transient
//! connection failures retry with exponential backoff before the stream
//! starts; mid-stream failures surface as typed errors.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DriverConfig;
use crate::message::{Message, MessageContent};

use super::{ChatChunk, ChatParams, ChunkStream, LlmDriver, LlmError, LlmUsage, ToolCallData};

/// Driver for OpenAI-compatible chat completion endpoints.
pub struct OpenAiDriver {
    http: reqwest::Client,
    config: DriverConfig,
}

impl OpenAiDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn request_body(
        &self,
        messages: &[Message],
        tools: Option<&[Value]>,
        params: &ChatParams,
    ) -> Value {
        let messages: Vec<Value> = messages.iter().map(wire_message).collect();
        let mut body = json!({
            "model": params.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(tools) = tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools.to_vec());
            }
        }
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = params.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }

    async fn connect(
        &self,
        body: &Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut last_err = String::new();
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.backoff * 2u32.saturating_pow(attempt - 1);
                warn!(attempt, ?backoff, "retrying chat completion connect");
                tokio::time::sleep(backoff).await;
            }
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .timeout(timeout)
                .json(body)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = format!("server status {}", resp.status());
                }
                Ok(resp) => {
                    // Client errors do not retry.
                    return Err(LlmError::Protocol(format!(
                        "status {}: {}",
                        resp.status(),
                        resp.text().await.unwrap_or_default()
                    )));
                }
                Err(e) if e.is_timeout() => return Err(LlmError::Timeout(timeout)),
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(LlmError::RetriesExhausted(last_err))
    }
}

#[async_trait]
impl LlmDriver for OpenAiDriver {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: Option<&[Value]>,
        params: &ChatParams,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        let body = self.request_body(messages, tools, params);
        let response = self.connect(&body, params.timeout).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<ChatChunk, LlmError>>(32);
        tokio::spawn(async move {
            let mut acc = ChatChunk::default();
            let mut buffer = String::new();
            let mut bytes = response.bytes_stream();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(LlmError::Cancelled)).await;
                        return;
                    }
                    next = bytes.next() => next,
                };
                let Some(item) = next else {
                    return;
                };
                let data = match item {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Transport(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&data));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<SseChunk>(payload) {
                        Ok(parsed) => {
                            apply_delta(&mut acc, &parsed);
                            if tx.send(Ok(acc.clone())).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "skipping unparseable SSE line");
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Serializes one message into the wire shape of the tool-call contract.
fn wire_message(message: &Message) -> Value {
    let content: Value = match &message.content {
        MessageContent::Text(s) => {
            if s.is_empty() && message.tool_calls.is_some() {
                Value::Null
            } else {
                Value::String(s.clone())
            }
        }
        MessageContent::Blocks(blocks) => serde_json::to_value(blocks).unwrap_or(Value::Null),
    };
    let mut out = json!({
        "role": message.role.as_str(),
        "content": content,
    });
    if let Some(tool_calls) = &message.tool_calls {
        out["tool_calls"] = Value::Array(
            tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {"name": tc.name, "arguments": tc.arguments},
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        out["tool_call_id"] = Value::String(id.clone());
    }
    out
}

#[derive(Debug, Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
    #[serde(default)]
    usage: Option<SseUsage>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<SseToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct SseToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<SseFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct SseFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// Folds one parsed SSE chunk into the accumulated chunk state.
fn apply_delta(acc: &mut ChatChunk, chunk: &SseChunk) {
    if let Some(u) = &chunk.usage {
        acc.usage = Some(LlmUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
    }
    let Some(choice) = chunk.choices.first() else {
        return;
    };
    if let Some(content) = &choice.delta.content {
        acc.content.push_str(content);
    }
    if let Some(reasoning) = &choice.delta.reasoning_content {
        acc.reasoning_content.push_str(reasoning);
    }
    // Every entry of the array, not just index 0.
    for tc in &choice.delta.tool_calls {
        let entry = acc
            .tool_calls_data
            .entry(tc.index)
            .or_insert_with(ToolCallData::default);
        if let Some(id) = &tc.id {
            entry.id = Some(id.clone());
        }
        if let Some(function) = &tc.function {
            if let Some(name) = &function.name {
                entry.name.push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                entry.arguments_delta_list.push(arguments.clone());
            }
        }
    }
    if choice.finish_reason.is_some() {
        acc.finish_reason = choice.finish_reason.clone();
    }
}
