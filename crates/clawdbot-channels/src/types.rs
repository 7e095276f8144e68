use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// One deliverable produced by an agent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundPayload {
    Text {
        text: String,
    },
    Media {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Poll {
        question: String,
        options: Vec<String>,
    },
}

impl OutboundPayload {
    pub fn text(text: impl Into<String>) -> Self {
        OutboundPayload::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutboundPayload::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// What a channel driver must expose to the core. The drivers themselves
/// (socket clients, HTTP bots, CLI bridges) live outside this workspace;
/// the orchestrator only ever sees this trait.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Channel id this transport serves (matches a dock id).
    fn channel(&self) -> &str;

    /// Whether the account is linked and the listener is running.
    fn is_linked(&self) -> bool;

    async fn send_text(&self, to: &str, text: &str, thread_id: Option<&str>)
        -> Result<(), ChannelError>;

    async fn send_media(
        &self,
        to: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError>;

    async fn send_poll(
        &self,
        to: &str,
        question: &str,
        options: &[String],
    ) -> Result<(), ChannelError>;

    /// Ack reaction on an inbound message; channels without reactions no-op.
    async fn react(&self, _to: &str, _message_id: &str, _emoji: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Typing indicator pulse; channels without typing support no-op.
    async fn typing(&self, _to: &str) -> Result<(), ChannelError> {
        Ok(())
    }
}
