use thiserror::Error;

/// Classification of a failed git invocation, derived from its stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceErrorKind {
    BranchNotFound,
    RepoNotFound,
    AuthRequired,
    NetworkError,
    RateLimited,
    Unknown,
}

impl ResourceErrorKind {
    /// Deterministic user hint per failure class.
    pub fn hint(self) -> &'static str {
        match self {
            Self::BranchNotFound => "verify the branch exists on the remote",
            Self::RepoNotFound => "verify the repository URL is correct and public",
            Self::AuthRequired => "private repo, check credentials",
            Self::NetworkError => "check connectivity and try again",
            Self::RateLimited => "the git host is rate limiting, try again shortly",
            Self::Unknown => "check the resource URL and branch",
        }
    }
}

#[derive(Debug, Error)]
pub enum BtcaError {
    #[error("{0}")]
    Request(String),

    #[error("{0}")]
    Config(String),

    #[error("{message}")]
    Resource {
        kind: ResourceErrorKind,
        message: String,
    },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("search path {path} does not exist in {resource}")]
    SearchPathMissing { resource: String, path: String },

    #[error("{0}")]
    Collection(String),

    #[error("path escapes the collection sandbox: {0}")]
    PathEscape(String),

    #[error("{0}")]
    Agent(String),

    #[error("unknown provider: {0}")]
    InvalidProvider(String),

    #[error("invalid model name: {0}")]
    InvalidModel(String),

    #[error("provider {0} is not connected")]
    ProviderNotConnected(String),
}

impl BtcaError {
    /// Wire tag for `{error, tag, hint?}` payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Request(_) => "RequestError",
            Self::Config(_) => "ConfigError",
            Self::Resource { .. } | Self::ResourceNotFound(_) | Self::SearchPathMissing { .. } => {
                "ResourceError"
            }
            Self::Collection(_) => "CollectionError",
            Self::PathEscape(_) => "PathEscape",
            Self::Agent(_) => "AgentError",
            Self::InvalidProvider(_) => "InvalidProvider",
            Self::InvalidModel(_) => "InvalidModel",
            Self::ProviderNotConnected(_) => "ProviderNotConnected",
        }
    }

    /// Actionable hint for the wire, when one exists.
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Resource { kind, .. } => Some(kind.hint().to_string()),
            Self::ResourceNotFound(_) => {
                Some("list configured resources with GET /resources".to_string())
            }
            Self::SearchPathMissing { .. } => {
                Some("verify searchPath exists on the configured branch".to_string())
            }
            Self::InvalidProvider(_) => {
                Some("supported providers: openrouter, openai, anthropic".to_string())
            }
            Self::InvalidModel(_) => Some(
                "model names use letters, digits and . _ + - / : only, at most 100 chars"
                    .to_string(),
            ),
            Self::ProviderNotConnected(p) => Some(format!(
                "set {} in the environment",
                crate::provider::api_key_var(p).unwrap_or("the provider API key")
            )),
            _ => None,
        }
    }

    /// HTTP status for the request pipeline. Validation classes surface 400;
    /// only provider/stream failures and unwritable config are 500.
    pub fn status(&self) -> u16 {
        match self {
            Self::Agent(_) | Self::Config(_) => 500,
            _ => 400,
        }
    }

    /// Message safe for HTTP bodies and SSE error events. Never carries
    /// stack traces, internal paths outside the sandbox, or subprocess stderr.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}
