use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{ClawdbotError, Result};
use crate::fsio;

// Protocol / server constants.
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 18760;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024; // hard cap per WS frame
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const TICK_INTERVAL_SECS: u64 = 30;

/// Maximum `$include` nesting before the loader refuses.
const MAX_INCLUDE_DEPTH: usize = 10;

/// Name of the sentinel written by `config.apply` to request a restart.
pub const RESTART_SENTINEL: &str = "restart.pending";

/// Top-level config (clawdbot.json, JSON5 with `$include`, plus
/// CLAWDBOT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClawdbotConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub auth: AuthOrderConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub subagents: SubagentsConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: GatewayAuthConfig,
    /// Idempotency cache window for repeated request keys.
    #[serde(default = "default_idempotency_window_secs")]
    pub idempotency_window_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            auth: GatewayAuthConfig::default(),
            idempotency_window_secs: default_idempotency_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    #[serde(default)]
    pub mode: GatewayAuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth — only permitted on loopback binds.
    #[default]
    Off,
    Token,
    Password,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default = "default_agent_id")]
    pub default_agent: String,
    #[serde(default)]
    pub defaults: AgentDefaults,
    /// Per-agent overrides keyed by agent id.
    #[serde(default)]
    pub overrides: HashMap<String, AgentDefaults>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_agent: default_agent_id(),
            defaults: AgentDefaults::default(),
            overrides: HashMap::new(),
        }
    }
}

impl AgentsConfig {
    /// Effective defaults for `agent_id`: per-agent override or global.
    pub fn for_agent(&self, agent_id: &str) -> &AgentDefaults {
        self.overrides.get(agent_id).unwrap_or(&self.defaults)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    pub provider: Option<String>,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Typing indicator mode for this agent's runs.
    #[serde(default)]
    pub typing_mode: TypingModeConfig,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            provider: None,
            heartbeat: HeartbeatConfig::default(),
            typing_mode: TypingModeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TypingModeConfig {
    Instant,
    #[default]
    Message,
    Thinking,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    /// Interval like "30m", "1h", "90s". "0" disables the runner.
    #[serde(default = "default_heartbeat_every")]
    pub every: String,
    /// Prompt override; the built-in heartbeat prompt is used when unset.
    pub prompt: Option<String>,
    /// Delivery target: "none", "last", or "<channel>:<to>".
    pub target: Option<String>,
    #[serde(default)]
    pub include_reasoning: bool,
    /// 0 disables the final acknowledgement entirely.
    #[serde(default = "default_ack_max_chars")]
    pub ack_max_chars: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            every: default_heartbeat_every(),
            prompt: None,
            target: None,
            include_reasoning: false,
            ack_max_chars: default_ack_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthOrderConfig {
    /// Explicit per-provider profile ordering (store-level order wins).
    #[serde(default)]
    pub order: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub cooldowns: CooldownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownConfig {
    /// Billing failures disable a profile for this many hours by default.
    #[serde(default = "default_billing_backoff_hours")]
    pub billing_backoff_hours: f64,
    /// Hard cap on billing backoff, including per-provider overrides.
    #[serde(default = "default_billing_max_hours")]
    pub billing_max_hours: f64,
    #[serde(default)]
    pub billing_backoff_hours_by_provider: HashMap<String, f64>,
    /// Failure counters older than this window reset before incrementing.
    #[serde(default = "default_failure_window_hours")]
    pub failure_window_hours: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            billing_backoff_hours: default_billing_backoff_hours(),
            billing_max_hours: default_billing_max_hours(),
            billing_backoff_hours_by_provider: HashMap::new(),
            failure_window_hours: default_failure_window_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// A new inbound message aborts the in-flight run on that session.
    Interrupt,
    /// New messages append; the lane drains in FIFO order.
    #[default]
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub queue_mode: QueueMode,
    /// Name of the per-agent main session slot.
    #[serde(default = "default_main_key")]
    pub main_key: Option<String>,
}

impl SessionConfig {
    pub fn main_key(&self) -> &str {
        self.main_key.as_deref().unwrap_or("main")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentsConfig {
    /// `["*"]` allows spawning under any agent; otherwise an explicit list.
    #[serde(default = "default_allow_agents")]
    pub allow_agents: Vec<String>,
    /// Default model for subagent runs; falls back to the parent's model.
    pub model: Option<String>,
    /// Per-agent subagent model overrides.
    #[serde(default)]
    pub model_by_agent: HashMap<String, String>,
    /// Minutes a kept subagent session survives before the sweeper archives it.
    pub archive_after_min: Option<u64>,
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            allow_agents: default_allow_agents(),
            model: None,
            model_by_agent: HashMap::new(),
            archive_after_min: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsConfig {
    /// "<provider>/<model>" entries a session may select. Empty = allow all
    /// catalog entries.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Catalog of known models; merged with `models.json` overrides on load.
    #[serde(default = "default_catalog")]
    pub catalog: Vec<ModelEntry>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            catalog: default_catalog(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub provider: String,
    pub model: String,
    /// Whether the model accepts the `xhigh` thinking level.
    #[serde(default)]
    pub supports_xhigh: bool,
}

impl ModelsConfig {
    /// Look up "<provider>/<model>"; `None` when absent from the catalog.
    pub fn find(&self, spec: &str) -> Option<&ModelEntry> {
        let (provider, model) = spec.split_once('/')?;
        self.catalog
            .iter()
            .find(|e| e.provider == provider && e.model == model)
    }

    /// A model is selectable when it is in the catalog and the allowlist
    /// (an empty allowlist allows the whole catalog).
    pub fn is_allowed(&self, spec: &str) -> bool {
        if self.find(spec).is_none() {
            return false;
        }
        self.allowlist.is_empty() || self.allowlist.iter().any(|a| a == spec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: ChannelEntryConfig,
    #[serde(default)]
    pub telegram: ChannelEntryConfig,
    #[serde(default)]
    pub discord: ChannelEntryConfig,
    #[serde(default)]
    pub slack: ChannelEntryConfig,
    #[serde(default)]
    pub signal: ChannelEntryConfig,
    #[serde(default)]
    pub imessage: ChannelEntryConfig,
    #[serde(default)]
    pub msteams: ChannelEntryConfig,
}

impl ChannelsConfig {
    pub fn entry(&self, channel: &str) -> Option<&ChannelEntryConfig> {
        match channel {
            "whatsapp" => Some(&self.whatsapp),
            "telegram" => Some(&self.telegram),
            "discord" => Some(&self.discord),
            "slack" => Some(&self.slack),
            "signal" => Some(&self.signal),
            "imessage" => Some(&self.imessage),
            "msteams" => Some(&self.msteams),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntryConfig {
    /// Senders the agent may talk to. Empty = everyone.
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Per-account allow lists, keyed by account id.
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
    /// Group messages require an explicit bot mention when true.
    #[serde(default)]
    pub require_mention: Option<bool>,
    /// Owner identity for owner-gated commands.
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    #[serde(default)]
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    #[serde(default = "bool_true")]
    pub block_streaming: bool,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default)]
    pub enforce_final_tag: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            block_streaming: true,
            min_chars: default_min_chars(),
            idle_ms: default_idle_ms(),
            enforce_final_tag: false,
        }
    }
}

impl ClawdbotConfig {
    /// Load config from `<state_dir>/clawdbot.json` (JSON5, `$include`
    /// resolved with deep merge) with CLAWDBOT_* env overrides on top.
    ///
    /// A missing file yields the defaults — first boot is config-free.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("clawdbot.json");
        if !path.exists() {
            return Ok(apply_env_overrides(ClawdbotConfig::default()));
        }

        let mut seen = HashSet::new();
        let mut value = load_value(&path, 0, &mut seen)?;
        normalize_legacy_keys(&mut value);
        merge_models_overlay(state_dir, &mut value);

        let config: ClawdbotConfig = serde_json::from_value(value)
            .map_err(|e| ClawdbotError::Config(format!("{}: {e}", path.display())))?;
        Ok(apply_env_overrides(config))
    }

    /// Persist to `<state_dir>/clawdbot.json` atomically (`.bak` sibling).
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = state_dir.join("clawdbot.json");
        fsio::write_json_atomic(&path, self, 0o600)
    }

    /// Write the restart sentinel consumed by the process supervisor.
    pub fn write_restart_sentinel(state_dir: &Path) -> Result<()> {
        let path = state_dir.join(RESTART_SENTINEL);
        let stamp = chrono::Utc::now().to_rfc3339();
        fsio::write_atomic(&path, stamp.as_bytes(), 0o600)
    }
}

/// Parse one JSON5 file and resolve its `$include` directives.
///
/// `$include` accepts a path string or an array of them, relative to the
/// including file. Included objects merge first (in order); the including
/// object's own keys win. Depth is capped and cycles are rejected.
fn load_value(path: &Path, depth: usize, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ClawdbotError::Config(format!(
            "$include depth exceeds {MAX_INCLUDE_DEPTH}: {}",
            path.display()
        )));
    }
    let canonical = path
        .canonicalize()
        .map_err(|e| ClawdbotError::Config(format!("{}: {e}", path.display())))?;
    if !seen.insert(canonical.clone()) {
        return Err(ClawdbotError::Config(format!(
            "circular $include: {}",
            path.display()
        )));
    }

    let text = std::fs::read_to_string(path)?;
    let mut value: Value = json5::from_str(&text)
        .map_err(|e| ClawdbotError::Config(format!("{}: {e}", path.display())))?;

    if let Value::Object(ref mut map) = value {
        if let Some(include) = map.remove("$include") {
            let includes: Vec<String> = match include {
                Value::String(s) => vec![s],
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                other => {
                    return Err(ClawdbotError::Config(format!(
                        "$include must be a path or array of paths, got {other}"
                    )))
                }
            };
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            let mut merged = Value::Object(Default::default());
            for inc in includes {
                let inc_path = base.join(&inc);
                let inc_value = load_value(&inc_path, depth + 1, seen)?;
                deep_merge(&mut merged, inc_value);
            }
            deep_merge(&mut merged, Value::Object(std::mem::take(map)));
            seen.remove(&canonical);
            return Ok(merged);
        }
    }

    seen.remove(&canonical);
    Ok(value)
}

/// Recursive object merge; arrays and scalars in `overlay` replace.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(slot) => deep_merge(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, overlay) => *slot = overlay,
    }
}

/// Move legacy flat keys to their current location, warning once each.
fn normalize_legacy_keys(value: &mut Value) {
    let Value::Object(root) = value else { return };
    if let Some(Value::Object(gateway)) = root.get_mut("gateway") {
        if let Some(token) = gateway.remove("token") {
            warn!("config: legacy key gateway.token — use gateway.auth.token");
            gateway
                .entry("auth")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(Value::Object(auth)) = gateway.get_mut("auth") {
                auth.entry("token").or_insert(token);
            }
        }
    }
    let mut drop_messages = false;
    if let Some(Value::Object(messages)) = root.get_mut("messages") {
        if messages.remove("ackReaction").is_some() {
            warn!("config: legacy key messages.ackReaction ignored");
        }
        drop_messages = messages.is_empty();
    }
    if drop_messages {
        root.remove("messages");
    }
}

/// Merge `<state_dir>/models.json` catalog overrides into the config value.
fn merge_models_overlay(state_dir: &Path, value: &mut Value) {
    let path = state_dir.join("models.json");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return;
    };
    match json5::from_str::<Value>(&text) {
        Ok(overlay) => {
            let models = value
                .as_object_mut()
                .map(|m| m.entry("models").or_insert_with(|| Value::Object(Default::default())));
            if let Some(models) = models {
                deep_merge(models, overlay);
            }
        }
        Err(e) => warn!(path = %path.display(), error = %e, "ignoring malformed models.json"),
    }
}

/// Environment overrides applied last, after file + includes.
fn apply_env_overrides(mut config: ClawdbotConfig) -> ClawdbotConfig {
    if let Ok(token) = std::env::var("CLAWDBOT_GATEWAY_TOKEN") {
        if !token.trim().is_empty() {
            config.gateway.auth.token = Some(token);
            // an env token on an unconfigured gateway implies token mode
            if config.gateway.auth.mode == GatewayAuthMode::Off {
                config.gateway.auth.mode = GatewayAuthMode::Token;
            }
        }
    }
    if let Ok(password) = std::env::var("CLAWDBOT_GATEWAY_PASSWORD") {
        if !password.trim().is_empty() {
            config.gateway.auth.password = Some(password);
        }
    }
    if let Ok(port) = std::env::var("CLAWDBOT_GATEWAY_PORT") {
        if let Ok(p) = port.parse() {
            config.gateway.port = p;
        }
    }
    if let Ok(bind) = std::env::var("CLAWDBOT_GATEWAY_BIND") {
        if !bind.trim().is_empty() {
            config.gateway.bind = bind;
        }
    }
    config
}

/// Parse a human interval like "30m", "2h", "45s", or bare minutes.
/// Returns `None` for zero, negatives, or garbage (callers treat as disabled).
pub fn parse_interval(spec: &str) -> Option<std::time::Duration> {
    let spec = spec.trim();
    if spec.is_empty() || spec == "0" {
        return None;
    }
    let (num, unit) = match spec.char_indices().find(|(_, c)| c.is_alphabetic()) {
        Some((idx, _)) => spec.split_at(idx),
        None => (spec, "m"),
    };
    let n: f64 = num.trim().parse().ok()?;
    if n <= 0.0 {
        return None;
    }
    let secs = match unit.trim() {
        "s" | "sec" | "secs" => n,
        "m" | "min" | "mins" => n * 60.0,
        "h" | "hr" | "hrs" => n * 3600.0,
        "d" => n * 86_400.0,
        _ => return None,
    };
    Some(std::time::Duration::from_secs_f64(secs))
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_idempotency_window_secs() -> u64 {
    300
}
fn default_agent_id() -> String {
    "main".to_string()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}
fn default_heartbeat_every() -> String {
    "30m".to_string()
}
fn default_ack_max_chars() -> usize {
    300
}
fn default_billing_backoff_hours() -> f64 {
    5.0
}
fn default_billing_max_hours() -> f64 {
    24.0
}
fn default_failure_window_hours() -> f64 {
    24.0
}
fn default_main_key() -> Option<String> {
    Some("main".to_string())
}
fn default_allow_agents() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_min_chars() -> usize {
    1500
}
fn default_idle_ms() -> u64 {
    1000
}
fn default_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            provider: "anthropic".into(),
            model: "claude-sonnet-4".into(),
            supports_xhigh: false,
        },
        ModelEntry {
            provider: "anthropic".into(),
            model: "claude-opus-4".into(),
            supports_xhigh: true,
        },
        ModelEntry {
            provider: "openai".into(),
            model: "gpt-5".into(),
            supports_xhigh: true,
        },
        ModelEntry {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            supports_xhigh: false,
        },
        ModelEntry {
            provider: "zai".into(),
            model: "glm-4.7".into(),
            supports_xhigh: false,
        },
        ModelEntry {
            provider: "openrouter".into(),
            model: "auto".into(),
            supports_xhigh: false,
        },
    ]
}
