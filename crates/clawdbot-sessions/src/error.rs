use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session key: {0}")]
    InvalidKey(String),

    #[error("session not found: {key}")]
    NotFound { key: String },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("label already in use: {label}")]
    DuplicateLabel { label: String },

    #[error("refusing to delete the main session")]
    DeleteMain,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] clawdbot_core::ClawdbotError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Wire error code for the gateway response.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidKey(_) => "INVALID_REQUEST",
            SessionError::NotFound { .. } => "NOT_FOUND",
            SessionError::InvalidPatch(_) => "INVALID_REQUEST",
            SessionError::DuplicateLabel { .. } => "CONFLICT",
            SessionError::DeleteMain => "INVALID_REQUEST",
            SessionError::Serialization(_) => "INTERNAL",
            SessionError::Store(e) => e.code(),
            SessionError::Io(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
