use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of chat a message arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
    Thread,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Direct => "direct",
            ChatKind::Group => "group",
            ChatKind::Thread => "thread",
        }
    }
}

/// Wrapper around inbound text carrying routing metadata.
///
/// Built by channel drivers before a message enters the gateway; the
/// orchestrator reads it to pick the session key and delivery target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Originating channel id (e.g. "whatsapp", "telegram").
    pub provider: String,
    pub chat_type: ChatKind,
    /// Delivery target — chat id, phone number, channel id.
    pub to: String,
    /// Sender identity as the channel reports it.
    pub from: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Channel account the message arrived on (multi-account setups).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// True when the sender is the configured owner of the channel.
    #[serde(default)]
    pub owner: bool,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Prefix `text` with the envelope header the model sees.
    ///
    /// Timestamps render at minute precision — second-level noise would
    /// defeat prompt caching on consecutive turns.
    pub fn render(&self, text: &str) -> String {
        format!(
            "[{} {} {}] {}",
            self.provider,
            self.chat_type.as_str(),
            self.timestamp.format("%Y-%m-%d %H:%M UTC"),
            text
        )
    }
}
