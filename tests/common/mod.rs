//! Shared fixtures: an in-process searcher, a scripted language model, and
//! a filesystem-only resource loader. These stand in for ripgrep, the HTTP
//! provider, and git so the suites run hermetically.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use btca_server::error::BtcaError;
use btca_server::provider::{LanguageModel, StreamPart, StreamTextRequest};
use btca_server::resources::{FsResource, ResourceLoader};
use btca_server::search::{SearchHit, Searcher};

/// Searcher fake: `files` walks the directory tree in-process; `search`
/// scans file contents line by line with a plain substring match.
pub struct FakeSearcher;

impl FakeSearcher {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut entries: Vec<_> = entries.flatten().collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            // Follow symlinks the way the real driver does.
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            if meta.is_dir() {
                Self::walk(&path, out);
            } else {
                out.push(path);
            }
        }
    }
}

impl Searcher for FakeSearcher {
    fn files<'a>(
        &'a self,
        cwd: &'a Path,
        globs: Option<&'a [String]>,
        _include_hidden: bool,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<String>, BtcaError>> {
        Box::pin(async move {
            let mut paths = Vec::new();
            Self::walk(cwd, &mut paths);
            let mut names: Vec<String> = paths
                .iter()
                .filter_map(|p| p.strip_prefix(cwd).ok())
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            if let Some(globs) = globs {
                // Suffix matching is enough for the patterns the suites use.
                let suffixes: Vec<&str> = globs
                    .iter()
                    .map(|g| g.trim_start_matches("**/").trim_start_matches('*'))
                    .collect();
                names.retain(|n| suffixes.iter().any(|s| s.is_empty() || n.ends_with(s)));
            }
            names.truncate(max_results + 1);
            Ok(names)
        })
    }

    fn search<'a>(
        &'a self,
        cwd: &'a Path,
        pattern: &'a str,
        include: Option<&'a str>,
        _include_hidden: bool,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<SearchHit>, BtcaError>> {
        Box::pin(async move {
            let mut paths = Vec::new();
            Self::walk(cwd, &mut paths);
            if let Some(glob) = include {
                let suffix = glob.trim_start_matches("**/").trim_start_matches('*');
                paths.retain(|p| p.to_string_lossy().ends_with(suffix));
            }
            let mut hits = Vec::new();
            'outer: for path in paths {
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue;
                };
                for (idx, line) in content.lines().enumerate() {
                    if line.contains(pattern) {
                        hits.push(SearchHit {
                            path: path.clone(),
                            line_number: (idx + 1) as u64,
                            line_text: line.to_string(),
                        });
                        if hits.len() > max_results {
                            break 'outer;
                        }
                    }
                }
            }
            Ok(hits)
        })
    }
}

/// One scripted model turn.
pub type Turn = Vec<StreamPart>;

/// Language model that replays scripted turns and records every request it
/// receives.
pub struct StubModel {
    turns: Mutex<std::vec::IntoIter<Turn>>,
    pub seen: Mutex<Vec<Vec<String>>>,
}

impl StubModel {
    pub fn new(turns: Vec<Turn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into_iter()),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Crude rendering of each request's messages for assertions.
    fn record(&self, req: &StreamTextRequest) {
        let rendered = req
            .messages
            .iter()
            .map(|m| format!("{m:?}"))
            .collect::<Vec<_>>();
        self.seen.lock().unwrap().push(rendered);
    }
}

impl LanguageModel for StubModel {
    fn provider_id(&self) -> &str {
        "stub"
    }

    fn model_id(&self) -> &str {
        "stub-model"
    }

    fn stream_text(&self, req: StreamTextRequest) -> BoxStream<'static, StreamPart> {
        self.record(&req);
        let turn = self
            .turns
            .lock()
            .unwrap()
            .next()
            .unwrap_or_else(|| {
                vec![StreamPart::Error {
                    message: "stub model ran out of turns".to_string(),
                }]
            });
        futures_util::stream::iter(turn).boxed()
    }
}

/// Resource loader backed by plain directories, no git involved.
pub struct FakeLoader {
    pub root: PathBuf,
}

impl FakeLoader {
    /// Create a resource directory with the given files (path, contents).
    pub fn seed(&self, name: &str, files: &[(&str, &str)]) {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (rel, contents) in files {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, contents).unwrap();
        }
    }
}

impl ResourceLoader for FakeLoader {
    fn load<'a>(
        &'a self,
        name: &'a str,
        _quiet: bool,
    ) -> BoxFuture<'a, Result<FsResource, BtcaError>> {
        Box::pin(async move {
            let dir = self.root.join(name);
            if !dir.is_dir() {
                return Err(BtcaError::ResourceNotFound(name.to_string()));
            }
            Ok(FsResource::new(
                name.to_string(),
                dir.canonicalize().unwrap_or(dir),
                None,
                None,
            ))
        })
    }
}

pub fn text_delta(text: &str) -> StreamPart {
    StreamPart::TextDelta {
        text: text.to_string(),
    }
}

pub fn finish(reason: &str) -> StreamPart {
    StreamPart::Finish {
        reason: reason.to_string(),
        usage: None,
    }
}

pub fn tool_call(id: &str, name: &str, input: serde_json::Value) -> StreamPart {
    StreamPart::ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        input,
    }
}
