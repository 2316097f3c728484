//! Streaming HTTP provider client.
//!
//! One [`HttpModel::stream_text`] call performs one model turn: POST the
//! conversation, read the SSE response, and translate provider chunks into
//! [`StreamPart`]s. Two wire dialects are supported — OpenAI-compatible chat
//! completions (OpenRouter, OpenAI) and the Anthropic Messages API.

use std::collections::BTreeMap;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ChatMessage, LanguageModel, StreamPart, StreamTextRequest, Usage};

/// Maximum accumulated response text per turn.
const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

/// Maximum time to wait for response headers after sending the request.
const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum time to wait for the first SSE event after headers arrive.
/// Routed providers (OpenRouter) answer with headers immediately while the
/// upstream model queues for tens of seconds.
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Duration without any SSE chunk before the turn is abandoned mid-stream.
const STALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    OpenAi,
    Anthropic,
}

pub struct HttpModel {
    provider: String,
    model: String,
    base_url: String,
    api_key: String,
    format: ApiFormat,
    client: Client,
}

impl HttpModel {
    pub fn new(
        provider: String,
        model: String,
        base_url: String,
        api_key: String,
        format: ApiFormat,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_default();
        Self {
            provider,
            model,
            base_url,
            api_key,
            format,
            client,
        }
    }
}

impl LanguageModel for HttpModel {
    fn provider_id(&self) -> &str {
        &self.provider
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn stream_text(&self, req: StreamTextRequest) -> BoxStream<'static, StreamPart> {
        let (tx, rx) = mpsc::channel::<StreamPart>(32);
        let client = self.client.clone();
        let provider = self.provider.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        let format = self.format;
        let body = match format {
            ApiFormat::OpenAi => build_openai_body(&self.model, &req),
            ApiFormat::Anthropic => build_anthropic_body(&self.model, &req),
        };

        tokio::spawn(async move {
            run_turn(client, provider, base_url, api_key, format, body, req.cancellation, tx).await;
        });

        ReceiverStream::new(rx).boxed()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_turn(
    client: Client,
    provider: String,
    base_url: String,
    api_key: String,
    format: ApiFormat,
    body: serde_json::Value,
    cancellation: CancellationToken,
    tx: mpsc::Sender<StreamPart>,
) {
    let builder = match format {
        ApiFormat::OpenAi => client
            .post(&base_url)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json"),
        ApiFormat::Anthropic => client
            .post(&base_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json"),
    };

    // Scoped timeout around send() only: connect_timeout covers TCP/TLS, this
    // covers the gap between connection and the first response header.
    let send_future = builder.json(&body).send();
    let response = tokio::select! {
        _ = cancellation.cancelled() => return,
        result = tokio::time::timeout(HEADERS_TIMEOUT, send_future) => match result {
            Err(_) => {
                let _ = tx.send(StreamPart::Error {
                    message: format!("{provider} did not respond in time"),
                }).await;
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(provider, "provider request failed: {e}");
                let _ = tx.send(StreamPart::Error {
                    message: format!("request to {provider} failed"),
                }).await;
                return;
            }
            Ok(Ok(response)) => response,
        },
    };

    let status = response.status();
    if !status.is_success() {
        let message = match status.as_u16() {
            429 => format!("rate limited by {provider}"),
            401 | 403 => format!("authentication failed for {provider}"),
            _ => format!("upstream error from {provider} ({status})"),
        };
        let tail = read_body_capped(response, 2048).await;
        tracing::warn!(provider, %status, body = %tail, "provider returned error status");
        let _ = tx.send(StreamPart::Error { message }).await;
        return;
    }

    let mut stream = response.bytes_stream().eventsource();
    let mut state = TurnState::new(format);
    let mut received_first = false;
    let mut last_chunk_at = tokio::time::Instant::now();

    let stall_sleep = tokio::time::sleep(FIRST_BYTE_TIMEOUT);
    tokio::pin!(stall_sleep);

    loop {
        let guard = if received_first {
            last_chunk_at + STALL_TIMEOUT
        } else {
            last_chunk_at + FIRST_BYTE_TIMEOUT
        };
        stall_sleep.as_mut().reset(guard);

        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = &mut stall_sleep => {
                let _ = tx.send(StreamPart::Error {
                    message: format!("{provider} stream stalled"),
                }).await;
                return;
            }
            event = stream.next() => match event {
                Some(Ok(ev)) => {
                    received_first = true;
                    last_chunk_at = tokio::time::Instant::now();
                    let step = state.ingest(&ev.event, &ev.data);
                    if state.emitted_bytes > MAX_RESPONSE_BYTES {
                        let _ = tx.send(StreamPart::Error {
                            message: format!("streaming response from {provider} too large"),
                        }).await;
                        return;
                    }
                    for part in step.parts {
                        if tx.send(part).await.is_err() {
                            // Consumer disconnected; stop reading upstream.
                            return;
                        }
                    }
                    if step.done {
                        for part in state.finish() {
                            if tx.send(part).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(provider, "SSE stream error: {e}");
                    let _ = tx.send(StreamPart::Error {
                        message: format!("stream error from {provider}"),
                    }).await;
                    return;
                }
                None => {
                    // Stream ended without a terminal marker. Surface what we
                    // have as a finished turn rather than dropping it.
                    tracing::warn!(provider, "SSE stream ended without terminal event");
                    for part in state.finish() {
                        if tx.send(part).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
            },
        }
    }
}

async fn read_body_capped(mut response: reqwest::Response, max_bytes: usize) -> String {
    let mut body = Vec::with_capacity(max_bytes.min(1024));
    while let Ok(Some(chunk)) = response.chunk().await {
        let remaining = max_bytes.saturating_sub(body.len());
        body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        if body.len() >= max_bytes {
            break;
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

// --- per-turn parse state ---

/// A tool call being assembled from streamed fragments.
#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

struct IngestStep {
    parts: Vec<StreamPart>,
    done: bool,
}

impl IngestStep {
    fn none() -> Self {
        Self {
            parts: Vec::new(),
            done: false,
        }
    }

    fn parts(parts: Vec<StreamPart>) -> Self {
        Self { parts, done: false }
    }

    fn done() -> Self {
        Self {
            parts: Vec::new(),
            done: true,
        }
    }
}

struct TurnState {
    format: ApiFormat,
    pending: BTreeMap<u64, PendingCall>,
    finish_reason: Option<String>,
    usage: Usage,
    saw_usage: bool,
    emitted_bytes: usize,
}

impl TurnState {
    fn new(format: ApiFormat) -> Self {
        Self {
            format,
            pending: BTreeMap::new(),
            finish_reason: None,
            usage: Usage::default(),
            saw_usage: false,
            emitted_bytes: 0,
        }
    }

    fn ingest(&mut self, event_name: &str, data: &str) -> IngestStep {
        match self.format {
            ApiFormat::OpenAi => self.ingest_openai(data),
            ApiFormat::Anthropic => self.ingest_anthropic(event_name, data),
        }
    }

    /// Flush assembled tool calls and the terminal `Finish`.
    fn finish(&mut self) -> Vec<StreamPart> {
        let mut parts: Vec<StreamPart> = Vec::new();
        for (_, call) in std::mem::take(&mut self.pending) {
            parts.push(StreamPart::ToolCall {
                id: call.id,
                name: call.name,
                input: parse_arguments(&call.arguments),
            });
        }
        let reason = self
            .finish_reason
            .take()
            .unwrap_or_else(|| "stop".to_string());
        parts.push(StreamPart::Finish {
            reason,
            usage: self.saw_usage.then_some(self.usage),
        });
        parts
    }

    fn ingest_openai(&mut self, data: &str) -> IngestStep {
        if data.trim() == "[DONE]" {
            return IngestStep::done();
        }
        let Ok(chunk) = serde_json::from_str::<OaChunk>(data) else {
            return IngestStep::none();
        };

        if let Some(usage) = chunk.usage {
            self.usage = Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
            self.saw_usage = true;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return IngestStep::none();
        };
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(map_openai_finish(&reason));
        }

        let mut parts = Vec::new();
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            self.emitted_bytes += text.len();
            parts.push(StreamPart::TextDelta { text });
        }
        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let entry = self.pending.entry(delta.index).or_default();
            if let Some(id) = delta.id.filter(|i| !i.is_empty()) {
                entry.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                    entry.name = name;
                }
                if let Some(arguments) = function.arguments {
                    self.emitted_bytes += arguments.len();
                    entry.arguments.push_str(&arguments);
                }
            }
        }
        IngestStep::parts(parts)
    }

    fn ingest_anthropic(&mut self, _event_name: &str, data: &str) -> IngestStep {
        let Ok(event) = serde_json::from_str::<AnEvent>(data) else {
            return IngestStep::none();
        };

        match event.event_type.as_str() {
            "message_start" => {
                if let Some(usage) = event.message.and_then(|m| m.usage) {
                    self.usage.input_tokens = usage.input_tokens;
                    self.saw_usage = true;
                }
                IngestStep::none()
            }
            "content_block_start" => {
                if let Some(block) = event.content_block
                    && block.block_type.as_deref() == Some("tool_use")
                {
                    self.pending.insert(
                        event.index.unwrap_or(0),
                        PendingCall {
                            id: block.id.unwrap_or_default(),
                            name: block.name.unwrap_or_default(),
                            arguments: String::new(),
                        },
                    );
                }
                IngestStep::none()
            }
            "content_block_delta" => {
                let Some(delta) = event.delta else {
                    return IngestStep::none();
                };
                match delta.delta_type.as_deref() {
                    Some("text_delta") => {
                        if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                            self.emitted_bytes += text.len();
                            return IngestStep::parts(vec![StreamPart::TextDelta { text }]);
                        }
                        IngestStep::none()
                    }
                    Some("input_json_delta") => {
                        if let Some(json) = delta.partial_json {
                            self.emitted_bytes += json.len();
                            if let Some(call) =
                                self.pending.get_mut(&event.index.unwrap_or(0))
                            {
                                call.arguments.push_str(&json);
                            }
                        }
                        IngestStep::none()
                    }
                    _ => IngestStep::none(),
                }
            }
            "content_block_stop" => {
                // Flush this block's tool call immediately, preserving the
                // call-before-finish ordering the agent relies on.
                if let Some(call) = self.pending.remove(&event.index.unwrap_or(0)) {
                    return IngestStep::parts(vec![StreamPart::ToolCall {
                        id: call.id,
                        name: call.name,
                        input: parse_arguments(&call.arguments),
                    }]);
                }
                IngestStep::none()
            }
            "message_delta" => {
                if let Some(delta) = event.delta
                    && let Some(reason) = delta.stop_reason
                {
                    self.finish_reason = Some(map_anthropic_finish(&reason));
                }
                if let Some(usage) = event.usage {
                    self.usage.output_tokens = usage.output_tokens;
                    self.saw_usage = true;
                }
                IngestStep::none()
            }
            "message_stop" => IngestStep::done(),
            _ => IngestStep::none(),
        }
    }
}

/// Streamed tool arguments are a JSON fragment; an empty or broken fragment
/// degrades to an empty object so the tool sees a schema-shaped input.
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
}

fn map_openai_finish(reason: &str) -> String {
    match reason {
        "tool_calls" => "tool-calls".to_string(),
        "length" => "length".to_string(),
        "stop" => "stop".to_string(),
        other => other.to_string(),
    }
}

fn map_anthropic_finish(reason: &str) -> String {
    match reason {
        "tool_use" => "tool-calls".to_string(),
        "max_tokens" => "length".to_string(),
        "end_turn" | "stop_sequence" => "stop".to_string(),
        other => other.to_string(),
    }
}

// --- request bodies ---

fn build_openai_body(model: &str, req: &StreamTextRequest) -> serde_json::Value {
    let mut messages = vec![serde_json::json!({"role": "system", "content": req.system})];
    for message in &req.messages {
        match message {
            ChatMessage::User { text } => {
                messages.push(serde_json::json!({"role": "user", "content": text}));
            }
            ChatMessage::Assistant { text, tool_calls } => {
                let mut msg = serde_json::json!({"role": "assistant"});
                msg["content"] = if text.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::json!(text)
                };
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = serde_json::json!(
                        tool_calls
                            .iter()
                            .map(|call| {
                                serde_json::json!({
                                    "id": call.id,
                                    "type": "function",
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.input.to_string(),
                                    },
                                })
                            })
                            .collect::<Vec<_>>()
                    );
                }
                messages.push(msg);
            }
            ChatMessage::ToolResult {
                call_id, output, ..
            } => {
                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": output,
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if let Some(max) = req.max_tokens {
        body["max_tokens"] = serde_json::json!(max);
    }
    if !req.tools.is_empty() {
        body["tools"] = serde_json::json!(
            req.tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        },
                    })
                })
                .collect::<Vec<_>>()
        );
    }
    body
}

fn build_anthropic_body(model: &str, req: &StreamTextRequest) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::with_capacity(req.messages.len());
    for message in &req.messages {
        match message {
            ChatMessage::User { text } => {
                messages.push(serde_json::json!({"role": "user", "content": text}));
            }
            ChatMessage::Assistant { text, tool_calls } => {
                let mut content: Vec<serde_json::Value> = Vec::new();
                if !text.is_empty() {
                    content.push(serde_json::json!({"type": "text", "text": text}));
                }
                for call in tool_calls {
                    content.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.input,
                    }));
                }
                messages.push(serde_json::json!({"role": "assistant", "content": content}));
            }
            ChatMessage::ToolResult {
                call_id,
                output,
                attachment,
                ..
            } => {
                let mut result_content =
                    vec![serde_json::json!({"type": "text", "text": output})];
                if let Some(att) = attachment {
                    let source = serde_json::json!({
                        "type": "base64",
                        "media_type": att.media_type,
                        "data": att.base64,
                    });
                    let block_type = if att.media_type == "application/pdf" {
                        "document"
                    } else {
                        "image"
                    };
                    result_content
                        .push(serde_json::json!({"type": block_type, "source": source}));
                }
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": result_content,
                    }],
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": model,
        "system": req.system,
        "messages": messages,
        "stream": true,
        "max_tokens": req.max_tokens.unwrap_or(8192),
    });
    if !req.tools.is_empty() {
        body["tools"] = serde_json::json!(
            req.tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.input_schema,
                    })
                })
                .collect::<Vec<_>>()
        );
    }
    body
}

// --- wire chunk shapes ---

/// SSE streaming chunk from an OpenAI-compatible chat completions API.
#[derive(Deserialize)]
struct OaChunk {
    #[serde(default)]
    choices: Vec<OaChoice>,
    usage: Option<OaUsage>,
}

#[derive(Deserialize)]
struct OaChoice {
    #[serde(default)]
    delta: OaDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OaDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OaToolCallDelta>>,
}

#[derive(Deserialize)]
struct OaToolCallDelta {
    #[serde(default)]
    index: u64,
    id: Option<String>,
    function: Option<OaFunctionDelta>,
}

#[derive(Deserialize)]
struct OaFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct OaUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// SSE streaming event from the Anthropic Messages API.
#[derive(Deserialize)]
struct AnEvent {
    #[serde(rename = "type")]
    event_type: String,
    index: Option<u64>,
    content_block: Option<AnContentBlock>,
    delta: Option<AnDelta>,
    message: Option<AnMessage>,
    usage: Option<AnUsage>,
}

#[derive(Deserialize)]
struct AnContentBlock {
    #[serde(rename = "type")]
    block_type: Option<String>,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct AnDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnMessage {
    usage: Option<AnUsage>,
}

#[derive(Deserialize)]
struct AnUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}
