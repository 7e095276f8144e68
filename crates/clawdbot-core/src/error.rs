use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClawdbotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClawdbotError {
    /// Wire error code sent to clients — one of the closed protocol enum.
    pub fn code(&self) -> &'static str {
        match self {
            ClawdbotError::Config(_) => "INVALID_REQUEST",
            ClawdbotError::InvalidRequest(_) => "INVALID_REQUEST",
            ClawdbotError::Unauthorized(_) => "UNAUTHORIZED",
            ClawdbotError::NotFound(_) => "NOT_FOUND",
            ClawdbotError::Conflict(_) => "CONFLICT",
            ClawdbotError::Unavailable(_) => "UNAVAILABLE",
            ClawdbotError::Timeout { .. } => "TIMEOUT",
            ClawdbotError::Serialization(_) => "INTERNAL",
            ClawdbotError::Io(_) => "INTERNAL",
            ClawdbotError::Internal(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, ClawdbotError>;
