//! `read`: numbered file contents with paging and budgets.

use std::path::Path;

use base64::Engine;
use schemars::JsonSchema;
use serde::Deserialize;

use super::{ToolAttachment, ToolContext, ToolOutput};
use crate::error::BtcaError;
use crate::sandbox;

/// Default number of lines returned per call.
const DEFAULT_LIMIT: usize = 2000;
/// Individual lines longer than this are cut with `...`.
const MAX_LINE_CHARS: usize = 2000;
/// Total text budget per call.
const MAX_OUTPUT_BYTES: usize = 50 * 1024;
/// Bytes sniffed for the binary check.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadParams {
    /// File to read, as a path inside the collection.
    pub path: String,
    /// 0-based line to start from.
    #[serde(default)]
    pub offset: Option<usize>,
    /// Maximum number of lines to return.
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn run(params: ReadParams, ctx: &ToolContext) -> Result<ToolOutput, BtcaError> {
    let resolved = sandbox::resolve_with_symlinks(&ctx.base_path, &params.path)?;

    let Ok(meta) = tokio::fs::metadata(&resolved).await else {
        return Ok(ToolOutput::text(
            not_found_message(&params.path, &resolved).await,
        ));
    };
    if meta.is_dir() {
        return Ok(ToolOutput::text(format!(
            "{} is a directory. Use the list tool instead.",
            params.path
        )));
    }

    let file_name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| params.path.clone());

    if let Some(media_type) = attachment_media_type(&resolved) {
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| BtcaError::Agent(format!("read failed: {e}")))?;
        let label = if media_type == "application/pdf" {
            format!("[PDF file: {file_name}]")
        } else {
            format!("[Image file: {file_name}]")
        };
        return Ok(ToolOutput {
            output: label,
            attachment: Some(ToolAttachment {
                media_type,
                base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            }),
        });
    }

    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|e| BtcaError::Agent(format!("read failed: {e}")))?;
    if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
        return Ok(ToolOutput::text(format!("[Binary file: {file_name}]")));
    }

    let content = String::from_utf8_lossy(&bytes);
    Ok(ToolOutput::text(render_lines(
        &content,
        params.offset.unwrap_or(0),
        params.limit.unwrap_or(DEFAULT_LIMIT),
    )))
}

/// Format `content` as `<5-col right-justified 1-based line#>\t<text>`,
/// honoring the line and byte budgets. Truncation from either budget appends
/// a continuation footer.
fn render_lines(content: &str, offset: usize, limit: usize) -> String {
    let all: Vec<&str> = content.lines().collect();
    let total = all.len();
    if offset >= total {
        return format!("[No lines to read: file has {total} lines, offset is {offset}]");
    }

    let mut out = String::new();
    let mut included = 0usize;
    for (idx, line) in all.iter().enumerate().skip(offset) {
        if included >= limit || out.len() >= MAX_OUTPUT_BYTES {
            break;
        }
        let text = if line.chars().count() > MAX_LINE_CHARS {
            let cut: String = line.chars().take(MAX_LINE_CHARS).collect();
            format!("{cut}...")
        } else {
            (*line).to_string()
        };
        if included > 0 {
            out.push('\n');
        }
        out.push_str(&format!("{:>5}\t{}", idx + 1, text));
        included += 1;
    }

    let next_offset = offset + included;
    let remaining = total - next_offset;
    if remaining > 0 {
        out.push_str(&format!(
            "\n\n[Truncated: {remaining} more lines. Use offset={next_offset} to continue reading.]"
        ));
    }
    out
}

/// "File not found" text with up to 5 prefix-similar names from the parent
/// directory. Never errors — the model reads this and retries.
async fn not_found_message(requested: &str, resolved: &Path) -> String {
    let mut message = format!("File not found: {requested}");

    let Some(parent) = resolved.parent() else {
        return message;
    };
    let Some(wanted) = resolved.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return message;
    };

    let mut candidates: Vec<(usize, String)> = Vec::new();
    if let Ok(mut dir) = tokio::fs::read_dir(parent).await {
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let score = common_prefix_len(&wanted, &name.to_lowercase());
            if score > 0 {
                candidates.push((score, name));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    candidates.truncate(5);

    if !candidates.is_empty() {
        message.push_str("\n\nDid you mean one of these?");
        for (_, name) in candidates {
            message.push_str(&format!("\n  {name}"));
        }
    }
    message
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

fn attachment_media_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "ico" => Some("image/x-icon"),
        "svg" => Some("image/svg+xml"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_numbered_right_justified() {
        let out = render_lines("hi\nthere", 0, 2000);
        assert_eq!(out, "    1\thi\n    2\tthere");
    }

    #[test]
    fn offset_is_zero_based() {
        let out = render_lines("a\nb\nc", 1, 2000);
        assert!(out.starts_with("    2\tb"));
    }

    #[test]
    fn limit_appends_continuation_footer() {
        let content = (0..10).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let out = render_lines(&content, 0, 3);
        assert!(out.contains("    3\tline2"));
        assert!(out.contains("[Truncated: 7 more lines. Use offset=3 to continue reading.]"));
    }

    #[test]
    fn long_lines_are_cut() {
        let content = "x".repeat(2500);
        let out = render_lines(&content, 0, 10);
        assert!(out.ends_with("..."));
        assert!(out.len() < 2100);
    }

    #[test]
    fn byte_budget_trips() {
        let content = (0..100)
            .map(|_| "y".repeat(1000))
            .collect::<Vec<_>>()
            .join("\n");
        let out = render_lines(&content, 0, 2000);
        assert!(out.contains("[Truncated:"));
        assert!(out.len() < MAX_OUTPUT_BYTES + 2200);
    }

    #[test]
    fn offset_past_end_reports_line_count() {
        let out = render_lines("a\nb", 10, 5);
        assert!(out.contains("file has 2 lines"));
    }

    #[test]
    fn media_types() {
        assert_eq!(attachment_media_type(Path::new("x.PNG")), Some("image/png"));
        assert_eq!(
            attachment_media_type(Path::new("doc.pdf")),
            Some("application/pdf")
        );
        assert_eq!(attachment_media_type(Path::new("a.rs")), None);
    }

    #[test]
    fn prefix_similarity() {
        assert_eq!(common_prefix_len("readme.md", "README.md".to_lowercase().as_str()), 9);
        assert_eq!(common_prefix_len("config", "conduct"), 3);
        assert_eq!(common_prefix_len("abc", "xyz"), 0);
    }
}
