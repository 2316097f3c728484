//! External search driver: a thin wrapper around ripgrep.
//!
//! The tool suite never walks directories itself — file listing and content
//! search both shell out to `rg`, which follows the collection's symlinks
//! into the resource cache. The driver is a trait so tests can substitute an
//! in-process fake instead of depending on a binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::BtcaError;

/// One content match: absolute path, 1-based line number, line text.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub path: PathBuf,
    pub line_number: u64,
    pub line_text: String,
}

/// Wall-clock bound for one searcher subprocess.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// File/content matcher the tools are written against.
///
/// Both operations return at most `max_results + 1` entries so callers can
/// detect truncation without the driver knowing the display limit.
pub trait Searcher: Send + Sync {
    fn files<'a>(
        &'a self,
        cwd: &'a Path,
        globs: Option<&'a [String]>,
        include_hidden: bool,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<String>, BtcaError>>;

    fn search<'a>(
        &'a self,
        cwd: &'a Path,
        pattern: &'a str,
        include: Option<&'a str>,
        include_hidden: bool,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<SearchHit>, BtcaError>>;
}

/// Production driver shelling out to a located `rg` binary.
pub struct Ripgrep {
    binary: PathBuf,
}

impl Ripgrep {
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Find `rg`: PATH first, then the per-user data directory, then a
    /// one-time platform download into that directory.
    pub async fn locate() -> Result<Self, BtcaError> {
        if let Some(on_path) = find_on_path("rg").await {
            return Ok(Self::with_binary(on_path));
        }

        let installed = installed_binary_path()?;
        if tokio::fs::try_exists(&installed).await.unwrap_or(false) {
            return Ok(Self::with_binary(installed));
        }

        install_ripgrep(&installed).await?;
        Ok(Self::with_binary(installed))
    }

    async fn spawn_capped(
        &self,
        cwd: &Path,
        args: &[String],
        max_lines: usize,
    ) -> Result<Vec<String>, BtcaError> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BtcaError::Agent(format!("cannot start search binary: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BtcaError::Agent("search binary produced no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut collected = Vec::new();

        let read = async {
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| BtcaError::Agent(format!("search output read failed: {e}")))?
            {
                collected.push(line);
                if collected.len() >= max_lines {
                    break;
                }
            }
            Ok::<_, BtcaError>(())
        };

        match tokio::time::timeout(SEARCH_TIMEOUT, read).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.start_kill();
                return Err(BtcaError::Agent("search timed out".to_string()));
            }
        }

        // Exit code 1 is "no matches" for rg; only treat spawn-level failures
        // as errors. The child may still be streaming when we hit the cap.
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(collected)
    }
}

impl Searcher for Ripgrep {
    fn files<'a>(
        &'a self,
        cwd: &'a Path,
        globs: Option<&'a [String]>,
        include_hidden: bool,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<String>, BtcaError>> {
        Box::pin(async move {
            let mut args = vec![
                "--files".to_string(),
                "--follow".to_string(),
                "--no-messages".to_string(),
            ];
            if include_hidden {
                args.push("--hidden".to_string());
            }
            if let Some(globs) = globs {
                for glob in globs {
                    args.push("--glob".to_string());
                    args.push(glob.clone());
                }
            }
            self.spawn_capped(cwd, &args, max_results.saturating_add(1)).await
        })
    }

    fn search<'a>(
        &'a self,
        cwd: &'a Path,
        pattern: &'a str,
        include: Option<&'a str>,
        include_hidden: bool,
        max_results: usize,
    ) -> BoxFuture<'a, Result<Vec<SearchHit>, BtcaError>> {
        Box::pin(async move {
            let mut args = vec![
                "--line-number".to_string(),
                "--with-filename".to_string(),
                "--no-heading".to_string(),
                "--follow".to_string(),
                "--no-messages".to_string(),
                "--regexp".to_string(),
                pattern.to_string(),
            ];
            if include_hidden {
                args.push("--hidden".to_string());
            }
            if let Some(glob) = include {
                args.push("--glob".to_string());
                args.push(glob.to_string());
            }
            args.push("./".to_string());

            let lines = self
                .spawn_capped(cwd, &args, max_results.saturating_add(1))
                .await?;
            Ok(lines
                .iter()
                .filter_map(|line| parse_match_line(cwd, line))
                .collect())
        })
    }
}

/// Parse one `path:line:text` output line into a hit with an absolute path.
fn parse_match_line(cwd: &Path, line: &str) -> Option<SearchHit> {
    let mut parts = line.splitn(3, ':');
    let path = parts.next()?;
    let line_number: u64 = parts.next()?.parse().ok()?;
    let text = parts.next()?;
    let rel = path.strip_prefix("./").unwrap_or(path);
    Some(SearchHit {
        path: cwd.join(rel),
        line_number,
        line_text: text.to_string(),
    })
}

async fn find_on_path(name: &str) -> Option<PathBuf> {
    let output = Command::new("which")
        .arg(name)
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

fn installed_binary_path() -> Result<PathBuf, BtcaError> {
    let base = dirs::data_dir()
        .ok_or_else(|| BtcaError::Config("no user data directory".to_string()))?;
    let name = if cfg!(windows) { "rg.exe" } else { "rg" };
    Ok(base.join("btca").join("bin").join(name))
}

const RIPGREP_VERSION: &str = "14.1.1";

fn release_target() -> Result<&'static str, BtcaError> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => Ok("x86_64-unknown-linux-musl"),
        ("linux", "aarch64") => Ok("aarch64-unknown-linux-gnu"),
        ("macos", "x86_64") => Ok("x86_64-apple-darwin"),
        ("macos", "aarch64") => Ok("aarch64-apple-darwin"),
        (os, arch) => Err(BtcaError::Config(format!(
            "no bundled ripgrep build for {os}/{arch}; install rg on PATH"
        ))),
    }
}

/// Fetch the ripgrep release tarball for this platform and unpack the `rg`
/// binary into `dest`, setting the executable bit on Unix.
async fn install_ripgrep(dest: &Path) -> Result<(), BtcaError> {
    let target = release_target()?;
    let url = format!(
        "https://github.com/BurntSushi/ripgrep/releases/download/{RIPGREP_VERSION}/ripgrep-{RIPGREP_VERSION}-{target}.tar.gz"
    );
    tracing::info!(%url, "downloading search binary");

    let bytes = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(120))
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| BtcaError::Config(format!("search binary download failed: {e}")))?
        .bytes()
        .await
        .map_err(|e| BtcaError::Config(format!("search binary download failed: {e}")))?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BtcaError::Config(format!("cannot create data dir: {e}")))?;
    }

    // Archive extraction is synchronous; keep it off the async workers.
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_rg(&bytes, &dest))
        .await
        .map_err(|e| BtcaError::Config(format!("install task failed: {e}")))??;
    Ok(())
}

fn unpack_rg(tarball: &[u8], dest: &Path) -> Result<(), BtcaError> {
    let gz = flate2::read::GzDecoder::new(tarball);
    let mut archive = tar::Archive::new(gz);
    let entries = archive
        .entries()
        .map_err(|e| BtcaError::Config(format!("bad search binary archive: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| BtcaError::Config(format!("bad archive entry: {e}")))?;
        let is_rg = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .is_some_and(|n| n == "rg" || n == "rg.exe");
        if !is_rg {
            continue;
        }
        entry
            .unpack(dest)
            .map_err(|e| BtcaError::Config(format!("cannot unpack search binary: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| BtcaError::Config(format!("cannot mark binary executable: {e}")))?;
        }
        return Ok(());
    }
    Err(BtcaError::Config(
        "search binary archive did not contain rg".to_string(),
    ))
}
