//! Resource cache: git repositories mirrored under `<resourcesDir>/<name>`.
//!
//! A resource with a `searchPath` is cloned blobless + sparse and checked
//! out to that path only; everything else is a `--depth 1` clone. Loads of
//! the same name are serialized through a per-name mutex so two requests
//! never run git against the same working tree concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::{ConfigStore, GitResource};
use crate::error::{BtcaError, ResourceErrorKind};

/// Wall-clock bound for one git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// How much stderr is kept for logging on failure.
const STDERR_TAIL_BYTES: usize = 2 * 1024;

/// A materialized resource, ready to be linked into a collection.
#[derive(Debug, Clone)]
pub struct FsResource {
    pub name: String,
    absolute_path: PathBuf,
    pub repo_sub_path: Option<String>,
    pub special_instructions: Option<String>,
}

impl FsResource {
    pub fn new(
        name: String,
        absolute_path: PathBuf,
        repo_sub_path: Option<String>,
        special_instructions: Option<String>,
    ) -> Self {
        Self {
            name,
            absolute_path,
            repo_sub_path,
            special_instructions,
        }
    }

    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }
}

/// Loader seam between the cache and the collection assembler; tests inject
/// a filesystem-only fake here instead of running git.
pub trait ResourceLoader: Send + Sync {
    fn load<'a>(
        &'a self,
        name: &'a str,
        quiet: bool,
    ) -> futures_util::future::BoxFuture<'a, Result<FsResource, BtcaError>>;
}

impl ResourceLoader for ResourceStore {
    fn load<'a>(
        &'a self,
        name: &'a str,
        quiet: bool,
    ) -> futures_util::future::BoxFuture<'a, Result<FsResource, BtcaError>> {
        Box::pin(self.load(name, quiet))
    }
}

pub struct ResourceStore {
    resources_dir: PathBuf,
    config: Arc<ConfigStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResourceStore {
    pub fn new(resources_dir: PathBuf, config: Arc<ConfigStore>) -> Self {
        Self {
            resources_dir,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn resources_dir(&self) -> &Path {
        &self.resources_dir
    }

    /// Materialize `name`: clone on first use, fetch + hard-reset after.
    pub async fn load(&self, name: &str, quiet: bool) -> Result<FsResource, BtcaError> {
        let def = self
            .config
            .snapshot()
            .await
            .find(name)
            .map(|d| d.as_git().clone())
            .ok_or_else(|| BtcaError::ResourceNotFound(name.to_string()))?;

        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        let local_path = self.resources_dir.join(name);
        let exists = tokio::fs::metadata(&local_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);

        if exists {
            if !quiet {
                tracing::info!(resource = name, "updating cached resource");
            }
            self.git_update(&local_path, &def).await?;
        } else {
            if !quiet {
                tracing::info!(resource = name, url = %def.url, "cloning resource");
            }
            tokio::fs::create_dir_all(&self.resources_dir)
                .await
                .map_err(|e| {
                    BtcaError::Config(format!("cannot create resources directory: {e}"))
                })?;
            self.git_clone(&local_path, &def).await?;
        }

        if let Some(ref sub) = def.search_path {
            let focus = local_path.join(sub);
            if !tokio::fs::try_exists(&focus).await.unwrap_or(false) {
                return Err(BtcaError::SearchPathMissing {
                    resource: name.to_string(),
                    path: sub.clone(),
                });
            }
        }

        let absolute_path = tokio::fs::canonicalize(&local_path)
            .await
            .unwrap_or(local_path);

        Ok(FsResource {
            name: name.to_string(),
            absolute_path,
            repo_sub_path: def.search_path,
            special_instructions: def.special_notes,
        })
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Clone into a temp sibling and rename into place, so a failed clone
    /// never leaves a half-populated cache entry.
    async fn git_clone(&self, local_path: &Path, def: &GitResource) -> Result<(), BtcaError> {
        let tmp = self
            .resources_dir
            .join(format!("{}.cloning-{}", def.name, std::process::id()));
        let _ = tokio::fs::remove_dir_all(&tmp).await;

        let result = self.git_clone_into(&tmp, def).await;
        if let Err(err) = result {
            let _ = tokio::fs::remove_dir_all(&tmp).await;
            return Err(err);
        }

        let _ = tokio::fs::remove_dir_all(local_path).await;
        tokio::fs::rename(&tmp, local_path).await.map_err(|e| {
            BtcaError::Resource {
                kind: ResourceErrorKind::Unknown,
                message: format!("cannot move cloned resource {} into place: {e}", def.name),
            }
        })
    }

    async fn git_clone_into(&self, dest: &Path, def: &GitResource) -> Result<(), BtcaError> {
        let dest_str = dest.to_string_lossy();
        if let Some(ref sub) = def.search_path {
            run_git(
                &def.name,
                None,
                &[
                    "clone",
                    "--filter=blob:none",
                    "--no-checkout",
                    "--sparse",
                    "-b",
                    &def.branch,
                    &def.url,
                    &dest_str,
                ],
            )
            .await?;
            run_git(&def.name, Some(dest), &["sparse-checkout", "set", sub]).await?;
            run_git(&def.name, Some(dest), &["checkout"]).await
        } else {
            run_git(
                &def.name,
                None,
                &["clone", "--depth", "1", "-b", &def.branch, &def.url, &dest_str],
            )
            .await
        }
    }

    /// Fetch + hard reset. The sparse state is re-asserted on every update so
    /// a `searchPath` changed in the config takes effect without a re-clone:
    /// a current path narrows the cone, an absent one disables sparse
    /// checkout entirely and re-materializes the full worktree.
    async fn git_update(&self, local_path: &Path, def: &GitResource) -> Result<(), BtcaError> {
        run_git(
            &def.name,
            Some(local_path),
            &["fetch", "--depth", "1", "origin", &def.branch],
        )
        .await?;
        let target = format!("origin/{}", def.branch);
        run_git(&def.name, Some(local_path), &["reset", "--hard", &target]).await?;
        match def.search_path {
            Some(ref sub) => {
                run_git(&def.name, Some(local_path), &["sparse-checkout", "set", sub]).await
            }
            None => run_git(&def.name, Some(local_path), &["sparse-checkout", "disable"]).await,
        }
    }
}

/// Run one git command, classifying stderr on failure. stderr stays in the
/// logs; the returned error carries only the resource name and class.
async fn run_git(resource: &str, cwd: Option<&Path>, args: &[&str]) -> Result<(), BtcaError> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = match tokio::time::timeout(GIT_TIMEOUT, async {
        cmd.spawn()
            .map_err(|e| BtcaError::Resource {
                kind: ResourceErrorKind::Unknown,
                message: format!("cannot run git for {resource}: {e}"),
            })?
            .wait_with_output()
            .await
            .map_err(|e| BtcaError::Resource {
                kind: ResourceErrorKind::Unknown,
                message: format!("git failed for {resource}: {e}"),
            })
    })
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            return Err(BtcaError::Resource {
                kind: ResourceErrorKind::NetworkError,
                message: format!("git timed out for {resource}"),
            });
        }
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail_start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    let tail = &stderr[floor_char_boundary(&stderr, tail_start)..];
    let kind = classify_git_stderr(&stderr);
    tracing::warn!(
        resource,
        ?kind,
        subcommand = args.first().copied().unwrap_or(""),
        stderr = tail,
        "git invocation failed"
    );

    Err(BtcaError::Resource {
        kind,
        message: format!(
            "git {} failed for {resource}",
            args.first().copied().unwrap_or("command")
        ),
    })
}

/// Map git stderr onto a failure class with a deterministic hint.
pub fn classify_git_stderr(stderr: &str) -> ResourceErrorKind {
    let patterns: [(&str, ResourceErrorKind); 6] = [
        (
            r"(?i)remote branch .* not found|couldn't find remote ref|unknown revision",
            ResourceErrorKind::BranchNotFound,
        ),
        (
            r"(?i)repository .* not found|does not appear to be a git repository",
            ResourceErrorKind::RepoNotFound,
        ),
        (
            r"(?i)authentication failed|could not read username|permission denied|403",
            ResourceErrorKind::AuthRequired,
        ),
        (
            r"(?i)rate limit|429",
            ResourceErrorKind::RateLimited,
        ),
        (
            r"(?i)could not resolve host|unable to access|connection (timed out|refused|reset)|network is unreachable",
            ResourceErrorKind::NetworkError,
        ),
        (r"(?i)fatal: .*not found", ResourceErrorKind::RepoNotFound),
    ];
    for (pattern, kind) in patterns {
        if regex::Regex::new(pattern)
            .map(|re| re.is_match(stderr))
            .unwrap_or(false)
        {
            return kind;
        }
    }
    ResourceErrorKind::Unknown
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
