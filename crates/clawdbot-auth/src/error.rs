use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("profile not found: {id}")]
    ProfileNotFound { id: String },

    #[error("invalid profile {id}: {reason}")]
    InvalidProfile { id: String, reason: String },

    #[error("no usable credentials for provider {provider}")]
    NoCredentials { provider: String },

    #[error("store error: {0}")]
    Store(#[from] clawdbot_core::ClawdbotError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
