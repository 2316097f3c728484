//! Path sandbox for tool calls.
//!
//! Every path a model names must resolve to the collection directory or a
//! descendant of it. Containment is checked on the *requested* path after
//! lexical normalization; symlink targets may legitimately live outside the
//! base (collections are directories of symlinks into the resource cache).

use std::path::{Component, Path, PathBuf};

use crate::error::BtcaError;

/// Resolve `requested` against `base` and verify containment.
///
/// `requested` is taken as-is when absolute, otherwise joined onto `base`.
/// `.` and `..` components are resolved lexically before the check, so
/// `a/../../etc/passwd` fails even though no filesystem access happens here.
pub fn resolve(base: &Path, requested: &str) -> Result<PathBuf, BtcaError> {
    let requested_path = Path::new(requested);
    let joined = if requested_path.is_absolute() {
        requested_path.to_path_buf()
    } else {
        base.join(requested_path)
    };

    let normalized = normalize(&joined);
    let normalized_base = normalize(base);

    if !normalized.starts_with(&normalized_base) {
        return Err(BtcaError::PathEscape(requested.to_string()));
    }

    Ok(normalized)
}

/// As [`resolve`], then follow symlinks to the real path.
///
/// Collection entries are symlinks into the resource cache, so the returned
/// path is usually *outside* `base` — the security boundary is the name the
/// caller used, not where the bytes live.
pub fn resolve_with_symlinks(base: &Path, requested: &str) -> Result<PathBuf, BtcaError> {
    let contained = resolve(base, requested)?;
    match std::fs::canonicalize(&contained) {
        Ok(real) => Ok(real),
        // Nonexistent paths keep the normalized form; tools surface their own
        // "not found" text rather than failing the sandbox check.
        Err(_) => Ok(contained),
    }
}

/// Resolve `.` and `..` lexically, without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                match parts.last() {
                    Some(Component::Normal(_)) => {
                        parts.pop();
                    }
                    Some(Component::RootDir) | Some(Component::Prefix(_)) => {
                        // `/..` stays at the root
                    }
                    _ => parts.push(component),
                }
            }
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}
