//! Agent loop: a tool-calling driver over an abstract language model.
//!
//! One run answers one question against one collection. Each step sends the
//! conversation to the provider, relays text deltas as they stream, executes
//! any tool calls against the sandboxed tool suite, and folds the results
//! back into the conversation. The loop stops when the model finishes
//! without calling tools or the step budget runs out.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::provider::{
    ChatMessage, LanguageModel, StreamPart, StreamTextRequest, ToolCallRecord, ToolDefinition,
    Usage,
};
use crate::search::Searcher;
use crate::tools::{self, ToolContext, ToolOutput};

pub const DEFAULT_MAX_STEPS: usize = 40;

/// Safety prelude prepended to every system prompt, ahead of the generated
/// per-resource instructions.
const SYSTEM_PRELUDE: &str = "\
You are a documentation assistant answering questions about the software \
resources listed below. You can only read: use the read, grep, glob and list \
tools to inspect files inside the collection directory. Cite the file paths \
your answer is based on. If the collection does not contain the answer, say \
so plainly instead of guessing.";

/// Typed event stream produced by a run. `Finish` or `Error` is terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        #[serde(rename = "toolName")]
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(rename = "toolName")]
        tool_name: String,
        output: String,
    },
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        error: String,
    },
}

pub struct AgentOptions {
    pub collection_path: std::path::PathBuf,
    pub agent_instructions: String,
    pub question: String,
    pub max_steps: usize,
}

impl AgentOptions {
    pub fn new(
        collection_path: std::path::PathBuf,
        agent_instructions: String,
        question: String,
    ) -> Self {
        Self {
            collection_path,
            agent_instructions,
            question,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

/// Buffered result of [`Agent::run`].
#[derive(Debug)]
pub struct AgentRun {
    pub answer: String,
    pub model: String,
    pub events: Vec<AgentEvent>,
}

pub struct Agent {
    model: Arc<dyn LanguageModel>,
    searcher: Arc<dyn Searcher>,
}

impl Agent {
    pub fn new(model: Arc<dyn LanguageModel>, searcher: Arc<dyn Searcher>) -> Self {
        Self { model, searcher }
    }

    /// Run to completion, buffering all events. The answer is the trimmed
    /// concatenation of the text deltas, in emission order.
    pub async fn run(&self, opts: AgentOptions) -> AgentRun {
        let model_id = self.model.model_id().to_string();
        let mut stream = self.stream(opts, CancellationToken::new());
        let mut events = Vec::new();
        let mut answer = String::new();
        while let Some(event) = stream.next().await {
            if let AgentEvent::TextDelta { ref text } = event {
                answer.push_str(text);
            }
            events.push(event);
        }
        AgentRun {
            answer: answer.trim().to_string(),
            model: model_id,
            events,
        }
    }

    /// Same events as [`Agent::run`], emitted as they arrive. Dropping the
    /// stream cancels the run.
    pub fn stream(
        &self,
        opts: AgentOptions,
        cancellation: CancellationToken,
    ) -> BoxStream<'static, AgentEvent> {
        let (tx, rx) = mpsc::channel::<AgentEvent>(64);
        let model = Arc::clone(&self.model);
        let searcher = Arc::clone(&self.searcher);
        tokio::spawn(async move {
            drive(model, searcher, opts, tx, cancellation).await;
        });
        ReceiverStream::new(rx).boxed()
    }
}

async fn drive(
    model: Arc<dyn LanguageModel>,
    searcher: Arc<dyn Searcher>,
    opts: AgentOptions,
    tx: mpsc::Sender<AgentEvent>,
    cancellation: CancellationToken,
) {
    let ctx = ToolContext {
        base_path: opts.collection_path.clone(),
    };

    let listing = match tools::list::run(
        serde_json::from_value(serde_json::json!({"path": "."}))
            .expect("static list params deserialize"),
        &ctx,
    )
    .await
    {
        Ok(out) => out.output,
        Err(e) => e.user_message(),
    };

    let system = format!("{SYSTEM_PRELUDE}\n\n{}", opts.agent_instructions);
    let mut messages = vec![ChatMessage::User {
        text: format!(
            "Collection contents:\n{listing}\n\nQuestion: {}",
            opts.question
        ),
    }];
    let tool_defs: Vec<ToolDefinition> = tools::specs()
        .into_iter()
        .map(|spec| ToolDefinition {
            name: spec.name.to_string(),
            description: spec.description.to_string(),
            input_schema: spec.input_schema,
        })
        .collect();

    let mut last_finish: Option<(String, Option<Usage>)> = None;

    for _step in 0..opts.max_steps.max(1) {
        if cancellation.is_cancelled() {
            return;
        }

        let mut turn = model.stream_text(StreamTextRequest {
            system: system.clone(),
            messages: messages.clone(),
            tools: tool_defs.clone(),
            max_tokens: None,
            cancellation: cancellation.child_token(),
        });

        let mut step_text = String::new();
        let mut calls: Vec<ToolCallRecord> = Vec::new();
        let mut finish: Option<(String, Option<Usage>)> = None;

        while let Some(part) = turn.next().await {
            match part {
                StreamPart::TextDelta { text } => {
                    step_text.push_str(&text);
                    if tx
                        .send(AgentEvent::TextDelta { text })
                        .await
                        .is_err()
                    {
                        cancellation.cancel();
                        return;
                    }
                }
                StreamPart::ToolCall { id, name, input } => {
                    if tx
                        .send(AgentEvent::ToolCall {
                            tool_name: name.clone(),
                            input: input.clone(),
                        })
                        .await
                        .is_err()
                    {
                        cancellation.cancel();
                        return;
                    }
                    calls.push(ToolCallRecord { id, name, input });
                }
                StreamPart::Finish { reason, usage } => {
                    finish = Some((reason, usage));
                }
                StreamPart::Error { message } => {
                    // Terminal: one error event, then the stream closes.
                    let _ = tx.send(AgentEvent::Error { error: message }).await;
                    return;
                }
            }
        }

        last_finish = finish.clone().or(last_finish);

        if calls.is_empty() {
            let (reason, usage) = finish.unwrap_or_else(|| ("stop".to_string(), None));
            let _ = tx
                .send(AgentEvent::Finish {
                    finish_reason: reason,
                    usage,
                })
                .await;
            return;
        }

        // Execute the step's tool calls sequentially; errors (including
        // sandbox escapes) become result text the model must handle.
        let mut result_messages: Vec<ChatMessage> = Vec::with_capacity(calls.len());
        for call in &calls {
            let output = match tools::execute(&call.name, call.input.clone(), &ctx, &searcher)
                .await
            {
                Ok(out) => out,
                Err(e) => ToolOutput::text(e.user_message()),
            };
            if tx
                .send(AgentEvent::ToolResult {
                    tool_name: call.name.clone(),
                    output: output.output.clone(),
                })
                .await
                .is_err()
            {
                cancellation.cancel();
                return;
            }
            result_messages.push(ChatMessage::ToolResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                output: output.output,
                attachment: output.attachment,
            });
        }

        messages.push(ChatMessage::Assistant {
            text: step_text,
            tool_calls: calls,
        });
        messages.extend(result_messages);
    }

    // Step budget exhausted while the model was still calling tools.
    let (reason, usage) = last_finish.unwrap_or_else(|| ("stop".to_string(), None));
    let _ = tx
        .send(AgentEvent::Finish {
            finish_reason: reason,
            usage,
        })
        .await;
}
