//! Method names routed by the gateway. One constant per method so handlers
//! and the hello envelope can never drift apart.

pub const AGENT: &str = "agent";
pub const AGENT_WAIT: &str = "agent.wait";
pub const SESSIONS_LIST: &str = "sessions.list";
pub const SESSIONS_RESOLVE: &str = "sessions.resolve";
pub const SESSIONS_PATCH: &str = "sessions.patch";
pub const SESSIONS_RESET: &str = "sessions.reset";
pub const SESSIONS_DELETE: &str = "sessions.delete";
pub const SESSIONS_COMPACT: &str = "sessions.compact";
pub const CHAT_HISTORY: &str = "chat.history";
pub const SEND: &str = "send";
pub const CONFIG_GET: &str = "config.get";
pub const CONFIG_SCHEMA: &str = "config.schema";
pub const CONFIG_SET: &str = "config.set";
pub const CONFIG_APPLY: &str = "config.apply";
pub const CHANNELS_STATUS: &str = "channels.status";
pub const HEALTH: &str = "health";
pub const PING: &str = "ping";

/// Everything the server advertises in the hello envelope.
pub fn all() -> Vec<String> {
    [
        AGENT,
        AGENT_WAIT,
        SESSIONS_LIST,
        SESSIONS_RESOLVE,
        SESSIONS_PATCH,
        SESSIONS_RESET,
        SESSIONS_DELETE,
        SESSIONS_COMPACT,
        CHAT_HISTORY,
        SEND,
        CONFIG_GET,
        CONFIG_SCHEMA,
        CONFIG_SET,
        CONFIG_APPLY,
        CHANNELS_STATUS,
        HEALTH,
        PING,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
