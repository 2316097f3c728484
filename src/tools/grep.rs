//! `grep`: regex content search across the collection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use schemars::JsonSchema;
use serde::Deserialize;

use super::{ToolContext, ToolOutput};
use crate::error::BtcaError;
use crate::sandbox;
use crate::search::{SearchHit, Searcher};

/// Display cap on matches; the driver returns one extra so truncation is
/// detectable.
const MAX_MATCHES: usize = 100;
/// Matched lines longer than this are cut with `...`.
const MAX_LINE_CHARS: usize = 200;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GrepParams {
    /// Regex pattern to search for.
    pub pattern: String,
    /// Subdirectory to search in, relative to the collection root.
    #[serde(default)]
    pub path: Option<String>,
    /// Glob restricting which files are searched, e.g. `*.md`.
    #[serde(default)]
    pub include: Option<String>,
}

pub async fn run(
    params: GrepParams,
    ctx: &ToolContext,
    searcher: &Arc<dyn Searcher>,
) -> Result<ToolOutput, BtcaError> {
    let cwd = match params.path.as_deref() {
        Some(sub) => sandbox::resolve_with_symlinks(&ctx.base_path, sub)?,
        None => ctx.base_path.clone(),
    };

    let hits = searcher
        .search(
            &cwd,
            &params.pattern,
            params.include.as_deref(),
            false,
            MAX_MATCHES,
        )
        .await?;

    if hits.is_empty() {
        return Ok(ToolOutput::text(format!(
            "No matches found for pattern: {}",
            params.pattern
        )));
    }

    let truncated = hits.len() > MAX_MATCHES;
    let shown = &hits[..hits.len().min(MAX_MATCHES)];

    // Group hits per file, keeping line order within a file.
    let mut by_file: BTreeMap<PathBuf, Vec<&SearchHit>> = BTreeMap::new();
    for hit in shown {
        by_file.entry(hit.path.clone()).or_default().push(hit);
    }

    // Most recently modified files first.
    let mut files: Vec<(PathBuf, SystemTime)> = Vec::with_capacity(by_file.len());
    for path in by_file.keys() {
        let mtime = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((path.clone(), mtime));
    }
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut out = String::new();
    for (path, _) in &files {
        let rel = relative_to(path, &cwd);
        out.push_str(&format!("{rel}:\n"));
        for hit in &by_file[path] {
            out.push_str(&format!("  {}: {}\n", hit.line_number, clip(&hit.line_text)));
        }
    }

    if truncated {
        out.push_str(&format!(
            "[Truncated: Results limited to {MAX_MATCHES} matches. Narrow the pattern or path to see the rest.]\n"
        ));
    }

    Ok(ToolOutput::text(out.trim_end().to_string()))
}

fn clip(line: &str) -> String {
    let trimmed = line.trim_end();
    if trimmed.chars().count() > MAX_LINE_CHARS {
        let cut: String = trimmed.chars().take(MAX_LINE_CHARS).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

fn relative_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
