use thiserror::Error;

/// Per-turn failure taxonomy. The orchestrator recovers locally from the
/// kinds that have a recovery column in the run policy; everything else
/// surfaces to the caller.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Try the next credential profile (bounded).
    #[error("credential failed for {provider}/{model} (profile {profile_id}): {message}")]
    CredentialFailover {
        provider: String,
        model: String,
        profile_id: String,
        billing: bool,
        message: String,
    },

    /// Reset the session and retry exactly once.
    #[error("context overflow: {0}")]
    ContextOverflow(String),

    /// Reset the session, retry once, and note it to the user.
    #[error("corrupt history: {0}")]
    CorruptHistory(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("run timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("run aborted")]
    Aborted,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RunError {
    pub fn is_credential(&self) -> bool {
        matches!(self, RunError::CredentialFailover { .. })
    }

    pub fn triggers_reset(&self) -> bool {
        matches!(
            self,
            RunError::ContextOverflow(_) | RunError::CorruptHistory(_)
        )
    }
}

/// Provider payload markers that mean the conversation no longer fits the
/// context window.
const OVERFLOW_MARKERS: &[&str] = &[
    "Context overflow: Summarization failed: 400",
    "prompt is too long",
    "input length and `max_tokens` exceed context limit",
];

/// Markers for a structurally corrupt transcript the provider refuses.
const CORRUPT_MARKERS: &[&str] = &[
    "function call turn comes immediately after",
    "unexpected `tool_use_id` found",
    "tool_result block(s) provided when previous message does not contain",
];

/// Map a raw provider error string onto the taxonomy. Returns `None` for
/// messages with no special handling.
pub fn classify_provider_message(message: &str) -> Option<RunError> {
    if OVERFLOW_MARKERS.iter().any(|m| message.contains(m)) {
        return Some(RunError::ContextOverflow(message.to_string()));
    }
    if CORRUPT_MARKERS.iter().any(|m| message.contains(m)) {
        return Some(RunError::CorruptHistory(message.to_string()));
    }
    None
}

/// Rewrite runtime socket noise into the user-facing connection message.
pub fn friendly_transport_message(message: &str) -> String {
    const SOCKET_MARKERS: &[&str] = &[
        "ECONNREFUSED",
        "ECONNRESET",
        "ETIMEDOUT",
        "socket hang up",
        "fetch failed",
        "Unable to connect",
    ];
    if SOCKET_MARKERS.iter().any(|m| message.contains(m)) {
        format!("LLM connection failed: {message}")
    } else {
        message.to_string()
    }
}

/// Errors from the agent-level subsystems (registry, heartbeat, RPC glue).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("spawn refused: {0}")]
    SpawnRefused(String),

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("rpc error {code}: {message}")]
    Rpc { code: String, message: String },

    #[error(transparent)]
    Session(#[from] clawdbot_sessions::SessionError),

    #[error(transparent)]
    Auth(#[from] clawdbot_auth::AuthError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
