use thiserror::Error;

/// Errors raised by an automation backend.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("No such element: {0}")]
    NoSuchElement(String),

    #[error("Stale element reference: {0}")]
    StaleElement(String),

    #[error("Driver timeout: {0}")]
    Timeout(String),

    #[error("Invalid or expired session: {0}")]
    InvalidSession(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transient UI error: {0}")]
    TransientUi(String),

    #[error("Verification timed out: {0}")]
    VerificationTimeout(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Fatal session error: {0}")]
    FatalSession(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    /// Errors that must reach the operator instead of being absorbed by the
    /// strategy chain or the processor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Auth(_) | AgentError::FatalSession(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::TransientUi(_) => true,
            AgentError::VerificationTimeout(_) => true,
            AgentError::Http(_) => true,
            AgentError::Io(_) => true,
            AgentError::Extraction(_) => true,
            AgentError::Auth(_) => false,
            AgentError::FatalSession(_) => false,
            AgentError::Cancelled => false,
            AgentError::Config(_) => false,
            AgentError::Storage(_) => false,
            AgentError::Serde(_) => false,
        }
    }
}

impl From<DriverError> for AgentError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::InvalidSession(msg) => AgentError::FatalSession(msg),
            other => AgentError::TransientUi(other.to_string()),
        }
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_session_becomes_fatal() {
        let err: AgentError = DriverError::InvalidSession("gone".into()).into();
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_element_is_transient() {
        let err: AgentError = DriverError::NoSuchElement("send".into()).into();
        assert!(matches!(err, AgentError::TransientUi(_)));
        assert!(err.is_retryable());
    }
}
