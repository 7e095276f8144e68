use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Structured session key.
///
/// Sessions are agent-scoped. Wire formats:
///   `agent:<agentId>:main`                          — the per-agent main slot
///   `agent:<agentId>:subagent:<id>`                 — a spawned child
///   `agent:<agentId>:<channel>:<chatKind>:<chatId>` — a chat-scoped session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SessionKey {
    Main {
        agent_id: String,
    },
    Subagent {
        agent_id: String,
        id: String,
    },
    Chat {
        agent_id: String,
        channel: String,
        chat_kind: String,
        chat_id: String,
    },
}

impl SessionKey {
    pub fn main(agent_id: impl Into<String>) -> Self {
        SessionKey::Main {
            agent_id: agent_id.into(),
        }
    }

    pub fn subagent(agent_id: impl Into<String>, id: impl Into<String>) -> Self {
        SessionKey::Subagent {
            agent_id: agent_id.into(),
            id: id.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            SessionKey::Main { agent_id }
            | SessionKey::Subagent { agent_id, .. }
            | SessionKey::Chat { agent_id, .. } => agent_id,
        }
    }

    pub fn is_main(&self) -> bool {
        matches!(self, SessionKey::Main { .. })
    }

    pub fn is_subagent(&self) -> bool {
        matches!(self, SessionKey::Subagent { .. })
    }

    /// Canonical wire-format string.
    pub fn format(&self) -> String {
        match self {
            SessionKey::Main { agent_id } => format!("agent:{agent_id}:main"),
            SessionKey::Subagent { agent_id, id } => {
                format!("agent:{agent_id}:subagent:{id}")
            }
            SessionKey::Chat {
                agent_id,
                channel,
                chat_kind,
                chat_id,
            } => format!("agent:{agent_id}:{channel}:{chat_kind}:{chat_id}"),
        }
    }

    /// Parse a wire-format key. `chat_id` may itself contain colons.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("agent:")
            .ok_or_else(|| SessionError::InvalidKey(format!("missing 'agent:' prefix: {s}")))?;

        let (agent_id, scope) = rest
            .split_once(':')
            .ok_or_else(|| SessionError::InvalidKey(format!("missing scope segment: {s}")))?;
        if agent_id.is_empty() || scope.is_empty() {
            return Err(SessionError::InvalidKey(format!(
                "key components must not be empty: {s}"
            )));
        }

        if scope == "main" {
            return Ok(SessionKey::main(agent_id));
        }
        if let Some(id) = scope.strip_prefix("subagent:") {
            if id.is_empty() {
                return Err(SessionError::InvalidKey(format!("empty subagent id: {s}")));
            }
            return Ok(SessionKey::subagent(agent_id, id));
        }

        let (channel, rest) = scope
            .split_once(':')
            .ok_or_else(|| SessionError::InvalidKey(format!("missing chat kind: {s}")))?;
        let (chat_kind, chat_id) = rest
            .split_once(':')
            .ok_or_else(|| SessionError::InvalidKey(format!("missing chat id: {s}")))?;
        if channel.is_empty() || chat_kind.is_empty() || chat_id.is_empty() {
            return Err(SessionError::InvalidKey(format!(
                "key components must not be empty: {s}"
            )));
        }

        Ok(SessionKey::Chat {
            agent_id: agent_id.to_string(),
            channel: channel.to_string(),
            chat_kind: chat_kind.to_string(),
            chat_id: chat_id.to_string(),
        })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.format()
    }
}

impl TryFrom<String> for SessionKey {
    type Error = SessionError;
    fn try_from(s: String) -> Result<Self> {
        SessionKey::parse(&s)
    }
}

/// Assistant reasoning/verbosity levels shared by several override fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Some(ThinkingLevel::Off),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            "xhigh" => Some(ThinkingLevel::Xhigh),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::Xhigh => "xhigh",
        }
    }
}

/// One persisted conversation record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionEntry {
    /// Transcript identity; regenerated on reset.
    pub session_id: String,
    /// RFC3339 timestamp of the last mutation.
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkingLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose_level: Option<ThinkingLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_level: Option<ThinkingLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevated_level: Option<ThinkingLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_activation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_account_id: Option<String>,
    /// Globally unique alias; usable anywhere a key is accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Requester session key; set once, only on subagent keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawned_by: Option<String>,
    pub compaction_count: u32,
}

impl SessionEntry {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::now_v7().to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    /// Effective model spec "<provider>/<model>", when overridden.
    pub fn model_spec(&self) -> Option<String> {
        match (&self.provider_override, &self.model_override) {
            (Some(p), Some(m)) => Some(format!("{p}/{m}")),
            _ => None,
        }
    }
}
