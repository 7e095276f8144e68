use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel {channel} is not linked")]
    NotLinked { channel: String },

    #[error("send failed on {channel}: {reason}")]
    SendFailed { channel: String, reason: String },

    #[error("recipient not allowed: {to}")]
    NotAllowed { to: String },
}

pub type Result<T> = std::result::Result<T, ChannelError>;
