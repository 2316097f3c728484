//! `list`: one-level directory listing with classification and sizes.

use schemars::JsonSchema;
use serde::Deserialize;

use super::{ToolContext, ToolOutput};
use crate::error::BtcaError;
use crate::sandbox;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListParams {
    /// Directory to list, relative to the collection root.
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    ".".to_string()
}

enum Entry {
    Dir(String),
    File(String, u64),
    Link(String),
}

pub async fn run(params: ListParams, ctx: &ToolContext) -> Result<ToolOutput, BtcaError> {
    let resolved = sandbox::resolve_with_symlinks(&ctx.base_path, &params.path)?;

    let mut dir = match tokio::fs::read_dir(&resolved).await {
        Ok(dir) => dir,
        Err(_) => {
            return Ok(ToolOutput::text(format!(
                "Directory not found: {}",
                params.path
            )));
        }
    };

    let mut dirs: Vec<String> = Vec::new();
    let mut files: Vec<(String, u64)> = Vec::new();
    let mut links: Vec<String> = Vec::new();

    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(file_type) = entry.file_type().await else {
            links.push(name);
            continue;
        };
        let classified = if file_type.is_symlink() {
            // Follow once: a collection entry is a symlink to a resource
            // directory and should read as a directory.
            match tokio::fs::metadata(entry.path()).await {
                Ok(meta) if meta.is_dir() => Entry::Dir(name),
                Ok(meta) if meta.is_file() => Entry::File(name, meta.len()),
                _ => Entry::Link(name),
            }
        } else if file_type.is_dir() {
            Entry::Dir(name)
        } else if file_type.is_file() {
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            Entry::File(name, size)
        } else {
            Entry::Link(name)
        };
        match classified {
            Entry::Dir(n) => dirs.push(n),
            Entry::File(n, s) => files.push((n, s)),
            Entry::Link(n) => links.push(n),
        }
    }

    dirs.sort();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    links.sort();

    let mut out = String::new();
    for name in &dirs {
        out.push_str(&format!("[DIR]  {name}/\n"));
    }
    for (name, size) in &files {
        out.push_str(&format!("[FILE] {name} ({})\n", human_size(*size)));
    }
    for name in &links {
        out.push_str(&format!("[LNK]  {name}\n"));
    }
    out.push_str(&format!(
        "Total: {} items ({} directories, {} files)",
        dirs.len() + files.len() + links.len(),
        dirs.len(),
        files.len()
    ));

    Ok(ToolOutput::text(out))
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_humanize() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
