//! Configuration: the `btca.config.jsonc` file, its schema, and the
//! in-process store the HTTP surface reads and mutates.
//!
//! The file is JSON-with-comments. A project-local `./btca.config.jsonc` is
//! preferred; otherwise the per-user config directory is used and a default
//! file is created on first run. Unknown fields reject the whole file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::BtcaError;

pub const PROJECT_CONFIG_FILE: &str = "btca.config.jsonc";

const DEFAULT_PROVIDER: &str = "openrouter";
const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";

/// A named git repository definition, as written in the config file and
/// accepted by `POST /config/resources`. The `type` tag discriminates;
/// unknown tags reject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ResourceDefinition {
    Git(GitResource),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitResource {
    pub name: String,
    pub url: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_notes: Option<String>,
}

impl ResourceDefinition {
    pub fn as_git(&self) -> &GitResource {
        match self {
            Self::Git(git) => git,
        }
    }

    pub fn name(&self) -> &str {
        &self.as_git().name
    }

    /// Enforce the field invariants. A single violation rejects the
    /// definition (and, at load time, the whole config).
    pub fn validate(&self) -> Result<(), BtcaError> {
        let git = self.as_git();
        validate_name(&git.name)?;
        validate_url(&git.name, &git.url)?;
        validate_branch(&git.name, &git.branch)?;
        if let Some(ref sp) = git.search_path {
            validate_search_path(&git.name, sp)?;
        }
        if let Some(ref notes) = git.special_notes {
            validate_special_notes(&git.name, notes)?;
        }
        Ok(())
    }
}

/// On-disk schema of `btca.config.jsonc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub resources: Vec<ResourceDefinition>,
    pub model: String,
    pub provider: String,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            schema: None,
            resources: Vec::new(),
            model: DEFAULT_MODEL.to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
        }
    }
}

impl ConfigFile {
    /// Parse JSONC text and validate every resource definition.
    pub fn parse(text: &str) -> Result<Self, BtcaError> {
        let stripped = strip_jsonc_comments(text);
        let file: ConfigFile = serde_json::from_str(&stripped)
            .map_err(|e| BtcaError::Config(format!("invalid config file: {e}")))?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), BtcaError> {
        // Model-name violations are request errors at the HTTP surface, but
        // in the file they poison the whole config.
        validate_model_name("provider", &self.provider)
            .map_err(|e| BtcaError::Config(e.user_message()))?;
        validate_model_name("model", &self.model)
            .map_err(|e| BtcaError::Config(e.user_message()))?;
        let mut seen = std::collections::HashSet::new();
        for def in &self.resources {
            def.validate()?;
            if !seen.insert(def.name().to_string()) {
                return Err(BtcaError::Config(format!(
                    "duplicate resource name: {}",
                    def.name()
                )));
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.name() == name)
    }
}

/// Mutable config guarded for concurrent HTTP handlers. Reads take a cloned
/// snapshot; writes hold the lock across the file persist so two mutations
/// cannot interleave their saves.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<ConfigFile>,
}

impl ConfigStore {
    pub fn new(path: PathBuf, file: ConfigFile) -> Self {
        Self {
            path,
            inner: RwLock::new(file),
        }
    }

    /// Locate and load the config: project-local file first, then the
    /// per-user file, creating the latter with defaults when absent.
    pub async fn load() -> Result<Self, BtcaError> {
        let local = PathBuf::from(PROJECT_CONFIG_FILE);
        if tokio::fs::try_exists(&local).await.unwrap_or(false) {
            return Self::load_from(local).await;
        }

        let global = global_config_path()?;
        if !tokio::fs::try_exists(&global).await.unwrap_or(false) {
            let defaults = ConfigFile::default();
            if let Some(parent) = global.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BtcaError::Config(format!("cannot create config dir: {e}")))?;
            }
            write_config(&global, &defaults).await?;
            tracing::info!(path = %global.display(), "created default config");
            return Ok(Self::new(global, defaults));
        }
        Self::load_from(global).await
    }

    pub async fn load_from(path: PathBuf) -> Result<Self, BtcaError> {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BtcaError::Config(format!("cannot read {}: {e}", path.display())))?;
        let file = ConfigFile::parse(&text)?;
        Ok(Self::new(path, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> ConfigFile {
        self.inner.read().await.clone()
    }

    pub async fn add_resource(&self, def: ResourceDefinition) -> Result<ResourceDefinition, BtcaError> {
        def.validate()?;
        let mut guard = self.inner.write().await;
        if guard.find(def.name()).is_some() {
            return Err(BtcaError::Request(format!(
                "resource already exists: {}",
                def.name()
            )));
        }
        guard.resources.push(def.clone());
        write_config(&self.path, &guard).await?;
        Ok(def)
    }

    pub async fn remove_resource(&self, name: &str) -> Result<(), BtcaError> {
        let mut guard = self.inner.write().await;
        let before = guard.resources.len();
        guard.resources.retain(|r| r.name() != name);
        if guard.resources.len() == before {
            return Err(BtcaError::ResourceNotFound(name.to_string()));
        }
        write_config(&self.path, &guard).await
    }

    pub async fn update_model(&self, provider: &str, model: &str) -> Result<(), BtcaError> {
        validate_model_name("provider", provider)?;
        validate_model_name("model", model)?;
        let mut guard = self.inner.write().await;
        guard.provider = provider.to_string();
        guard.model = model.to_string();
        write_config(&self.path, &guard).await
    }
}

fn global_config_path() -> Result<PathBuf, BtcaError> {
    let base = dirs::config_dir()
        .ok_or_else(|| BtcaError::Config("no user config directory".to_string()))?;
    Ok(base.join("btca").join(PROJECT_CONFIG_FILE))
}

async fn write_config(path: &Path, file: &ConfigFile) -> Result<(), BtcaError> {
    let json = serde_json::to_string_pretty(file)
        .map_err(|e| BtcaError::Config(format!("cannot serialize config: {e}")))?;
    tokio::fs::write(path, json + "\n")
        .await
        .map_err(|e| BtcaError::Config(format!("cannot write {}: {e}", path.display())))
}

/// Remove `//` line comments and `/* */` block comments, preserving string
/// literals. Comment bytes are replaced with spaces so serde_json error
/// offsets still point at the right line.
pub fn strip_jsonc_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if b == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if b == b'"' {
                in_string = false;
            }
            i += 1;
        } else if b == b'"' {
            in_string = true;
            out.push(b);
            i += 1;
        } else if b == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            while i < bytes.len() && bytes[i] != b'\n' {
                out.push(b' ');
                i += 1;
            }
        } else if b == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            let mut closed = false;
            while i < bytes.len() {
                if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                    out.push(b' ');
                    out.push(b' ');
                    i += 2;
                    closed = true;
                    break;
                }
                out.push(if bytes[i] == b'\n' { b'\n' } else { b' ' });
                i += 1;
            }
            if !closed {
                break;
            }
        } else {
            out.push(b);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

// --- field validation ---

pub fn validate_name(name: &str) -> Result<(), BtcaError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {
            name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
        }
        _ => false,
    };
    if !valid {
        return Err(BtcaError::Config(format!(
            "invalid resource name: {name:?} (letters, digits and dashes, starting with a letter, at most 64 chars)"
        )));
    }
    Ok(())
}

fn validate_url(name: &str, url: &str) -> Result<(), BtcaError> {
    let reject = |why: &str| {
        Err(BtcaError::Config(format!(
            "resource {name}: invalid url ({why})"
        )))
    };

    let Some(rest) = url.strip_prefix("https://") else {
        return reject("only https:// URLs are allowed");
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    if authority.is_empty() {
        return reject("missing host");
    }
    if authority.contains('@') {
        return reject("embedded credentials are not allowed");
    }
    let host = authority.split(':').next().unwrap_or("");
    if is_local_or_private_host(host) {
        return reject("localhost and private addresses are not allowed");
    }
    Ok(())
}

fn is_local_or_private_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") || host == "::1" || host == "0.0.0.0" {
        return true;
    }
    let octets: Vec<u8> = host
        .split('.')
        .map(|p| p.parse::<u8>())
        .collect::<Result<_, _>>()
        .unwrap_or_default();
    match octets.as_slice() {
        [127, ..] | [10, ..] | [192, 168, ..] | [169, 254, ..] => true,
        [172, second, ..] => (16..=31).contains(second),
        _ => false,
    }
}

fn validate_branch(name: &str, branch: &str) -> Result<(), BtcaError> {
    let valid = !branch.is_empty()
        && branch.len() <= 128
        && !branch.starts_with('-')
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-'));
    if !valid {
        return Err(BtcaError::Config(format!(
            "resource {name}: invalid branch {branch:?}"
        )));
    }
    Ok(())
}

fn validate_search_path(name: &str, path: &str) -> Result<(), BtcaError> {
    let valid = !path.is_empty()
        && path.len() <= 256
        && !path.contains('\n')
        && !path.starts_with('/')
        && !path.split('/').any(|seg| seg == "..");
    if !valid {
        return Err(BtcaError::Config(format!(
            "resource {name}: invalid searchPath {path:?}"
        )));
    }
    Ok(())
}

fn validate_special_notes(name: &str, notes: &str) -> Result<(), BtcaError> {
    let valid = notes.len() <= 500
        && notes
            .chars()
            .all(|c| !c.is_control() || c == '\n' || c == '\t');
    if !valid {
        return Err(BtcaError::Config(format!(
            "resource {name}: invalid specialNotes (at most 500 chars, no control characters)"
        )));
    }
    Ok(())
}

/// Shared with `PUT /config/model` request validation: `^[A-Za-z0-9._+\-/:]+$`,
/// at most 100 chars.
pub fn validate_model_name(field: &str, value: &str) -> Result<(), BtcaError> {
    let valid = !value.is_empty()
        && value.len() <= 100
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-' | '/' | ':'));
    if !valid {
        return Err(BtcaError::Request(format!("invalid {field} name: {value:?}")));
    }
    Ok(())
}
