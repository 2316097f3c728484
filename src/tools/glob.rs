//! `glob`: pattern-match files, newest first.

use std::sync::Arc;
use std::time::SystemTime;

use schemars::JsonSchema;
use serde::Deserialize;

use super::{ToolContext, ToolOutput};
use crate::error::BtcaError;
use crate::sandbox;
use crate::search::Searcher;

const MAX_FILES: usize = 100;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GlobParams {
    /// Glob pattern, e.g. `**/*.md`.
    pub pattern: String,
    /// Subdirectory to search in, relative to the collection root.
    #[serde(default)]
    pub path: Option<String>,
}

pub async fn run(
    params: GlobParams,
    ctx: &ToolContext,
    searcher: &Arc<dyn Searcher>,
) -> Result<ToolOutput, BtcaError> {
    let cwd = match params.path.as_deref() {
        Some(sub) => sandbox::resolve_with_symlinks(&ctx.base_path, sub)?,
        None => ctx.base_path.clone(),
    };

    let globs = [params.pattern.clone()];
    let names = searcher.files(&cwd, Some(&globs), false, MAX_FILES).await?;

    if names.is_empty() {
        return Ok(ToolOutput::text(format!(
            "No files found matching pattern: {}",
            params.pattern
        )));
    }

    let truncated = names.len() > MAX_FILES;
    let shown = &names[..names.len().min(MAX_FILES)];

    let mut annotated: Vec<(String, SystemTime)> = Vec::with_capacity(shown.len());
    for rel in shown {
        let mtime = tokio::fs::metadata(cwd.join(rel))
            .await
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        annotated.push((rel.clone(), mtime));
    }
    annotated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut out = annotated
        .iter()
        .map(|(rel, _)| rel.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    if truncated {
        out.push_str(&format!(
            "\n[Truncated: Results limited to {MAX_FILES} files. Narrow the pattern to see the rest.]"
        ));
    }

    Ok(ToolOutput::text(out))
}
