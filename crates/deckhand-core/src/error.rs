use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DeckhandError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("deployment '{0}' not found")]
    NotFound(String),

    #[error("deployment '{0}' already exists")]
    AlreadyExists(String),

    #[error("another operation is in progress for deployment '{0}'")]
    Conflict(String),

    #[error("no port range available: {0}")]
    ResourceExhausted(String),

    #[error("deployment quota reached for '{owner}' ({limit} max)")]
    QuotaExceeded { owner: String, limit: usize },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("git operation failed: {0}")]
    Git(String),

    #[error("transient external failure: {0}")]
    TransientExternal(String),

    #[error("external command failed: {0}")]
    NonTransientExternal(String),

    #[error("proxy config validation failed: {0}")]
    ProxyValidation(String),

    #[error("proxy operation failed: {0}")]
    Proxy(String),

    #[error("container runtime operation failed: {0}")]
    Runtime(String),

    #[error("state persistence failed: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl DeckhandError {
    /// Whether the automatic retry policy may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeckhandError::TransientExternal(_))
    }
}

pub type Result<T> = std::result::Result<T, DeckhandError>;
