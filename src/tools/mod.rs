//! The sandboxed tool suite the agent drives: `read`, `grep`, `glob`, `list`.
//!
//! Every tool takes its parameters plus a [`ToolContext`] naming the sandbox
//! root, resolves any path through the sandbox, and returns plain text for
//! the model. Soft failures (missing files, no matches) come back as
//! human-visible output; only a sandbox escape aborts the call.

pub mod glob;
pub mod grep;
pub mod list;
pub mod read;

use std::path::PathBuf;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::error::BtcaError;
use crate::search::Searcher;

/// Execution context shared by all tools.
#[derive(Clone)]
pub struct ToolContext {
    /// Sandbox root — the collection directory for this request.
    pub base_path: PathBuf,
}

/// Binary payload accompanying a tool's text output (images, PDFs).
#[derive(Debug, Clone)]
pub struct ToolAttachment {
    pub media_type: &'static str,
    pub base64: String,
}

/// What a tool call produced: text for the model, optionally an attachment.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub output: String,
    pub attachment: Option<ToolAttachment>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            attachment: None,
        }
    }
}

/// Description + input schema handed to the language-model provider.
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: serde_json::Value,
}

fn schema_of<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| serde_json::json!({}))
}

/// The four tools, in the order they are advertised to the model.
pub fn specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "read",
            description: "Read a file from the collection. Returns numbered lines; use offset/limit to page through long files.",
            input_schema: schema_of::<read::ReadParams>(),
        },
        ToolSpec {
            name: "grep",
            description: "Search file contents with a regex pattern. Optionally restrict to a subdirectory and an include glob.",
            input_schema: schema_of::<grep::GrepParams>(),
        },
        ToolSpec {
            name: "glob",
            description: "Find files matching a glob pattern, newest first.",
            input_schema: schema_of::<glob::GlobParams>(),
        },
        ToolSpec {
            name: "list",
            description: "List a directory: subdirectories first, then files with sizes.",
            input_schema: schema_of::<list::ListParams>(),
        },
    ]
}

fn parse_params<T: for<'de> Deserialize<'de>>(input: serde_json::Value) -> Result<T, BtcaError> {
    serde_json::from_value(input).map_err(|e| BtcaError::Request(format!("invalid tool input: {e}")))
}

/// Dispatch one tool call by name. Unknown names come back as output text so
/// the model can correct itself rather than killing the request.
pub async fn execute(
    name: &str,
    input: serde_json::Value,
    ctx: &ToolContext,
    searcher: &Arc<dyn Searcher>,
) -> Result<ToolOutput, BtcaError> {
    match name {
        "read" => read::run(parse_params(input)?, ctx).await,
        "grep" => grep::run(parse_params(input)?, ctx, searcher).await,
        "glob" => glob::run(parse_params(input)?, ctx, searcher).await,
        "list" => list::run(parse_params(input)?, ctx).await,
        other => Ok(ToolOutput::text(format!(
            "Unknown tool: {other}. Available tools: read, grep, glob, list."
        ))),
    }
}
