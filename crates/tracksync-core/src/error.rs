use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("cannot parse action name '{0}': expected 'tracker/method'")]
    MethodParseFailed(String),

    #[error("tracker not registered: {0}")]
    TrackerNotRegistered(String),

    #[error("tracker '{tracker}' does not support method '{method}'")]
    UnsupportedMethod { tracker: String, method: String },

    #[error("action not supported: {0}")]
    ActionNotSupported(String),

    #[error("template error in '{key}': {message}")]
    Template { key: String, message: String },

    #[error("if condition '{condition}' did not evaluate to a boolean (got {got})")]
    IfCondition { condition: String, got: String },

    #[error("unexpected remote status: {0}")]
    UnexpectedRemoteStatus(String),

    #[error("transport connection is shut down")]
    TransportShutdown,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
