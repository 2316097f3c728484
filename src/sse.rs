//! SSE stream adapter: agent events → wire frames.
//!
//! Each frame is `event: <type>` + `data: <JSON>` per the SSE format. The
//! adapter synthesizes a `meta` frame first, tracks tool lifecycle under
//! synthetic call ids, and closes with exactly one `done` or `error` frame.
//! When the HTTP client disconnects the frame channel closes and the
//! upstream agent stream is dropped, cancelling the run.

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::agent::AgentEvent;

/// One SSE frame: the `event:` name and the `data:` JSON payload.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub event: &'static str,
    pub data: serde_json::Value,
}

/// First frame of every stream: what is being asked of which model, over
/// which collection.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMeta {
    pub model: ModelRef,
    pub resources: Vec<String>,
    pub collection: CollectionRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionRef {
    pub key: String,
    pub path: String,
}

/// Lifecycle of one tool call as shown to the client.
#[derive(Debug, Clone, Serialize)]
struct ToolState {
    #[serde(rename = "callID")]
    call_id: String,
    tool: String,
    status: String,
    input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

/// Adapt an agent event stream into SSE frames.
///
/// `question` is needed for the echo-strip pass on the final text: models
/// sometimes open their answer by restating the question verbatim.
pub fn sse_stream(
    meta: StreamMeta,
    mut events: BoxStream<'static, AgentEvent>,
    question: String,
) -> BoxStream<'static, WireFrame> {
    let (tx, rx) = mpsc::channel::<WireFrame>(64);

    tokio::spawn(async move {
        let meta_frame = WireFrame {
            event: "meta",
            data: serde_json::json!({
                "type": "meta",
                "model": meta.model,
                "resources": meta.resources,
                "collection": meta.collection,
            }),
        };
        if tx.send(meta_frame).await.is_err() {
            return;
        }

        let mut tools: Vec<ToolState> = Vec::new();
        let mut next_call = 0usize;
        let mut text = String::new();
        let mut terminal_sent = false;

        while let Some(event) = events.next().await {
            let outgoing = match event {
                AgentEvent::TextDelta { text: delta } => {
                    text.push_str(&delta);
                    WireFrame {
                        event: "text.delta",
                        data: serde_json::json!({"type": "text.delta", "delta": delta}),
                    }
                }
                AgentEvent::ToolCall { tool_name, input } => {
                    next_call += 1;
                    let state = ToolState {
                        call_id: format!("tool-{next_call}"),
                        tool: tool_name,
                        status: "running".to_string(),
                        input,
                        output: None,
                    };
                    let frame = tool_frame(&state);
                    tools.push(state);
                    frame
                }
                AgentEvent::ToolResult { tool_name, output } => {
                    // Pair with the most recent still-running call of the
                    // same tool.
                    let Some(state) = tools
                        .iter_mut()
                        .rev()
                        .find(|t| t.tool == tool_name && t.status == "running")
                    else {
                        continue;
                    };
                    state.status = "completed".to_string();
                    state.output = Some(output);
                    tool_frame(state)
                }
                AgentEvent::Finish { .. } => {
                    let frame = WireFrame {
                        event: "done",
                        data: serde_json::json!({
                            "type": "done",
                            "text": strip_question_echo(&text, &question),
                            "reasoning": "",
                            "tools": tools,
                        }),
                    };
                    terminal_sent = true;
                    let _ = tx.send(frame).await;
                    break;
                }
                AgentEvent::Error { error } => {
                    let frame = WireFrame {
                        event: "error",
                        data: serde_json::json!({
                            "type": "error",
                            "tag": "AgentError",
                            "message": error,
                        }),
                    };
                    terminal_sent = true;
                    let _ = tx.send(frame).await;
                    break;
                }
            };
            if tx.send(outgoing).await.is_err() {
                // Client disconnected; dropping `events` cancels upstream.
                return;
            }
        }

        if !terminal_sent {
            let frame = WireFrame {
                event: "error",
                data: serde_json::json!({
                    "type": "error",
                    "tag": "AgentError",
                    "message": "agent stream ended unexpectedly",
                }),
            };
            let _ = tx.send(frame).await;
        }
    });

    ReceiverStream::new(rx).boxed()
}

fn tool_frame(state: &ToolState) -> WireFrame {
    WireFrame {
        event: "tool.updated",
        data: serde_json::json!({
            "type": "tool.updated",
            "callID": state.call_id,
            "tool": state.tool,
            "state": {
                "status": state.status,
                "input": state.input,
                "output": state.output,
            },
        }),
    }
}

/// Strip a leading echo of the question from the answer, ignoring
/// whitespace differences. No echo → the trimmed answer unchanged.
pub fn strip_question_echo(text: &str, question: &str) -> String {
    let wanted: Vec<char> = question.chars().filter(|c| !c.is_whitespace()).collect();
    if wanted.is_empty() {
        return text.trim().to_string();
    }

    let mut matched = 0usize;
    let mut end_byte = 0usize;
    for (idx, c) in text.char_indices() {
        if c.is_whitespace() {
            continue;
        }
        if matched < wanted.len() && c == wanted[matched] {
            matched += 1;
            end_byte = idx + c.len_utf8();
            if matched == wanted.len() {
                break;
            }
        } else {
            break;
        }
    }

    if matched == wanted.len() {
        text[end_byte..].trim().to_string()
    } else {
        text.trim().to_string()
    }
}
