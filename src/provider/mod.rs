//! Language-model capability: an abstract streaming provider.
//!
//! The agent loop only knows [`LanguageModel::stream_text`]; the concrete
//! implementation speaks OpenAI-compatible chat completions or the Anthropic
//! Messages API over SSE. Credentials come from the environment — the
//! credential store is a black box queried by env var name.

pub mod http;

use std::sync::Arc;

use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::config::validate_model_name;
use crate::error::BtcaError;
use crate::tools::ToolAttachment;

/// Token accounting reported by the provider at the end of a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// One element of a provider stream for a single model turn.
#[derive(Debug, Clone)]
pub enum StreamPart {
    TextDelta {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Finish {
        reason: String,
        usage: Option<Usage>,
    },
    Error {
        message: String,
    },
}

/// A tool as advertised to the provider.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Conversation message for multi-turn tool use.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    User {
        text: String,
    },
    Assistant {
        text: String,
        tool_calls: Vec<ToolCallRecord>,
    },
    ToolResult {
        call_id: String,
        name: String,
        output: String,
        attachment: Option<ToolAttachment>,
    },
}

/// An assistant-issued tool call, kept verbatim for the next request.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// One model turn: system + history + tools, streamed back as parts.
pub struct StreamTextRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u64>,
    pub cancellation: CancellationToken,
}

pub trait LanguageModel: Send + Sync {
    fn provider_id(&self) -> &str;
    fn model_id(&self) -> &str;
    /// Stream one turn. The stream always ends with `Finish` or `Error`.
    fn stream_text(&self, req: StreamTextRequest) -> BoxStream<'static, StreamPart>;
}

/// Env var holding the API key for a known provider.
pub fn api_key_var(provider: &str) -> Option<&'static str> {
    match provider {
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        _ => None,
    }
}

/// Resolve a `(provider, model)` pair into a connected model.
pub fn get_model(provider: &str, model: &str) -> Result<Arc<dyn LanguageModel>, BtcaError> {
    validate_model_name("provider", provider)
        .map_err(|_| BtcaError::InvalidProvider(provider.to_string()))?;
    validate_model_name("model", model).map_err(|_| BtcaError::InvalidModel(model.to_string()))?;

    let (base_url, format) = match provider {
        "openrouter" => (
            "https://openrouter.ai/api/v1/chat/completions",
            http::ApiFormat::OpenAi,
        ),
        "openai" => (
            "https://api.openai.com/v1/chat/completions",
            http::ApiFormat::OpenAi,
        ),
        "anthropic" => (
            "https://api.anthropic.com/v1/messages",
            http::ApiFormat::Anthropic,
        ),
        _ => return Err(BtcaError::InvalidProvider(provider.to_string())),
    };

    let key_var = api_key_var(provider).expect("known provider has a key var");
    let api_key = std::env::var(key_var)
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| BtcaError::ProviderNotConnected(provider.to_string()))?;

    Ok(Arc::new(http::HttpModel::new(
        provider.to_string(),
        model.to_string(),
        base_url.to_string(),
        api_key,
        format,
    )))
}
