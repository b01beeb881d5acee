use thiserror::Error;

/// Startup configuration problems. Never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("{key}={value:?} is not a valid SQL identifier")]
    InvalidIdentifier { key: String, value: String },

    #[error("invalid {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("env file error: {0}")]
    EnvFile(String),
}

/// Row-to-message conversion failures.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("row has {values} value(s) for {columns} column(s)")]
    LengthMismatch { columns: usize, values: usize },

    #[error("message body is not a JSON object")]
    NotAnObject,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Skip the current message; the session keeps running.
    Message,
    /// Tear down the consumer session and reconnect after the backoff.
    Session,
    /// Abort the current invocation (startup or producer job).
    Invocation,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    /// The configuration store could not be read while resolving a job.
    #[error("configuration store error: {0}")]
    JobStore(String),

    #[error("publish failed after {published} message(s): {reason}")]
    Publish { published: u64, reason: String },

    #[error("procedure error: {0}")]
    Procedure(String),

    #[error("connection error: {0}")]
    Connection(String),
}

impl RelayError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            Self::Procedure(_) => ErrorScope::Message,
            Self::Connection(_) => ErrorScope::Session,
            Self::Configuration(_)
            | Self::JobNotFound(_)
            | Self::JobStore(_)
            | Self::Publish { .. } => ErrorScope::Invocation,
        }
    }
}
