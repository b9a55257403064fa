/// Shared error type used across all Agently crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("policy denied tool {0}")]
    PolicyDenied(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("canceled")]
    Canceled,

    #[error("elicitation {0}")]
    Elicitation(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a retry with backoff may succeed. Only transport-level
    /// failures qualify; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(Error::Transport("connection reset".into()).is_retryable());
        assert!(!Error::Timeout("tool".into()).is_retryable());
        assert!(!Error::PolicyDenied("system:exec".into()).is_retryable());
        assert!(!Error::Canceled.is_retryable());
    }
}
