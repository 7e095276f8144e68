//! Method routing: every named method call lands here, whether it arrived
//! over a WebSocket frame, the OpenAI-compat endpoint, or the in-process
//! RPC boundary (subagent and heartbeat flows).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use clawdbot_agent::error::AgentError;
use clawdbot_agent::orchestrator::AgentProgress;
use clawdbot_agent::rpc::GatewayRpc;
use clawdbot_agent::AgentRunRequest;
use clawdbot_channels::dock::dock;
use clawdbot_channels::{outbound, OutboundPayload};
use clawdbot_core::config::ClawdbotConfig;
use clawdbot_core::envelope::{ChatKind, MessageEnvelope};
use clawdbot_protocol::frames::ErrorCode;
use clawdbot_protocol::methods;
use clawdbot_sessions::transcript;
use clawdbot_sessions::SessionPatch;

use crate::app::AppState;

pub type DispatchResult = Result<Value, (ErrorCode, String)>;

/// Route one method call. `progress` (when given) receives streaming
/// events for `agent` runs.
pub async fn route(
    app: &Arc<AppState>,
    method: &str,
    params: Option<&Value>,
    progress: Option<mpsc::Sender<AgentProgress>>,
) -> DispatchResult {
    match method {
        methods::PING => Ok(json!({ "pong": true })),
        methods::AGENT => handle_agent(app, params, progress).await,
        methods::AGENT_WAIT => handle_agent_wait(app, params).await,
        methods::SESSIONS_LIST => handle_sessions_list(app),
        methods::SESSIONS_RESOLVE => handle_sessions_resolve(app, params),
        methods::SESSIONS_PATCH => handle_sessions_patch(app, params),
        methods::SESSIONS_RESET => handle_sessions_reset(app, params),
        methods::SESSIONS_DELETE => handle_sessions_delete(app, params).await,
        methods::SESSIONS_COMPACT => handle_sessions_compact(app, params),
        methods::CHAT_HISTORY => handle_chat_history(app, params),
        methods::SEND => handle_send(app, params).await,
        methods::CONFIG_GET => handle_config_get(app),
        methods::CONFIG_SCHEMA => handle_config_schema(),
        methods::CONFIG_SET => handle_config_set(app, params),
        methods::CONFIG_APPLY => handle_config_apply(app, params),
        methods::CHANNELS_STATUS => handle_channels_status(app),
        methods::HEALTH => Ok(crate::http::health::snapshot(app)),
        _ => Err((
            ErrorCode::NotFound,
            format!("unknown method '{method}'"),
        )),
    }
}

fn str_param<'a>(params: Option<&'a Value>, field: &str) -> Result<&'a str, (ErrorCode, String)> {
    params
        .and_then(|p| p.get(field))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            (
                ErrorCode::InvalidRequest,
                format!("missing '{field}' field"),
            )
        })
}

// ---------------------------------------------------------------------------
// agent / agent.wait
// ---------------------------------------------------------------------------

async fn handle_agent(
    app: &Arc<AppState>,
    params: Option<&Value>,
    progress: Option<mpsc::Sender<AgentProgress>>,
) -> DispatchResult {
    let session_key = str_param(params, "sessionKey")?;
    let message = str_param(params, "message")?;

    let mut req = AgentRunRequest::new(session_key, message);
    if let Some(params) = params {
        req.run_id = params
            .get("runId")
            .and_then(Value::as_str)
            .map(String::from);
        req.extra_system_prompt = params
            .get("extraSystemPrompt")
            .and_then(Value::as_str)
            .map(String::from);
        req.deliver = params
            .get("deliver")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        req.lane = params.get("lane").and_then(Value::as_str).map(String::from);
        req.is_heartbeat = params
            .get("isHeartbeat")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        req.timeout_ms = params.get("timeoutMs").and_then(Value::as_u64);
        req.preferred_profile = params
            .get("preferredProfile")
            .and_then(Value::as_str)
            .map(String::from);
        req.envelope = parse_envelope(params.get("channel"));
    }

    match app.orchestrator.run(req, progress).await {
        Ok(result) => serde_json::to_value(&result)
            .map_err(|e| (ErrorCode::Internal, e.to_string())),
        Err(e) => Err(map_agent_error(e)),
    }
}

/// Inbound channel context → message envelope.
fn parse_envelope(channel: Option<&Value>) -> Option<MessageEnvelope> {
    let channel = channel?;
    let provider = channel.get("provider").and_then(Value::as_str)?;
    let to = channel.get("to").and_then(Value::as_str)?;
    let chat_type = match channel.get("chatType").and_then(Value::as_str) {
        Some("group") => ChatKind::Group,
        Some("thread") => ChatKind::Thread,
        _ => ChatKind::Direct,
    };
    Some(MessageEnvelope {
        provider: provider.to_string(),
        chat_type,
        to: to.to_string(),
        from: channel
            .get("from")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        message_id: channel
            .get("messageId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        thread_id: channel
            .get("threadId")
            .and_then(Value::as_str)
            .map(String::from),
        account_id: channel
            .get("accountId")
            .and_then(Value::as_str)
            .map(String::from),
        attachments: Vec::new(),
        owner: channel
            .get("owner")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        timestamp: chrono::Utc::now(),
    })
}

async fn handle_agent_wait(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    let run_id = str_param(params, "runId")?;
    let timeout_ms = params
        .and_then(|p| p.get("timeoutMs"))
        .and_then(Value::as_u64)
        .unwrap_or(30_000);
    match app.orchestrator.wait(run_id, timeout_ms).await {
        Ok(status) => Ok(json!({ "runId": run_id, "status": status })),
        Err(e) => Err(map_agent_error(e)),
    }
}

fn map_agent_error(e: AgentError) -> (ErrorCode, String) {
    let message = e.to_string();
    let code = match &e {
        AgentError::RunNotFound { .. } => ErrorCode::NotFound,
        AgentError::SpawnRefused(_) => ErrorCode::InvalidRequest,
        AgentError::Session(se) => ErrorCode::from_code_str(se.code()),
        AgentError::Run(re) => match re {
            clawdbot_agent::RunError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            clawdbot_agent::RunError::Timeout { .. } => ErrorCode::Timeout,
            _ => ErrorCode::Internal,
        },
        AgentError::Rpc { code, .. } => ErrorCode::from_code_str(code),
        _ => ErrorCode::Internal,
    };
    (code, message)
}

// ---------------------------------------------------------------------------
// sessions.*
// ---------------------------------------------------------------------------

fn entry_json(key: &str, entry: &clawdbot_sessions::SessionEntry) -> Value {
    let mut value = serde_json::to_value(entry).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = value {
        map.insert("key".to_string(), Value::String(key.to_string()));
    }
    value
}

fn handle_sessions_list(app: &Arc<AppState>) -> DispatchResult {
    let sessions: Vec<Value> = app
        .orchestrator
        .sessions()
        .list()
        .iter()
        .map(|(key, entry)| entry_json(key, entry))
        .collect();
    Ok(json!({ "sessions": sessions }))
}

fn handle_sessions_resolve(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    let key = str_param(params, "key")?;
    match app.orchestrator.sessions().resolve(key) {
        Ok(resolved) => Ok(json!({ "key": resolved.format() })),
        Err(e) => Err((ErrorCode::from_code_str(e.code()), e.to_string())),
    }
}

fn handle_sessions_patch(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    let key = str_param(params, "key")?;
    let patch_value = params
        .and_then(|p| p.get("patch"))
        .cloned()
        .ok_or_else(|| (ErrorCode::InvalidRequest, "missing 'patch' field".into()))?;
    let patch: SessionPatch = serde_json::from_value(patch_value)
        .map_err(|e| (ErrorCode::InvalidRequest, format!("bad patch: {e}")))?;

    let sessions = app.orchestrator.sessions();
    let resolved = sessions
        .resolve(key)
        .map_err(|e| (ErrorCode::from_code_str(e.code()), e.to_string()))?;
    // patch may target a session that does not exist yet (subagent spawn
    // sets the model override before the first run)
    sessions
        .get_or_create(&resolved)
        .map_err(|e| (ErrorCode::from_code_str(e.code()), e.to_string()))?;

    let (models, default_model) = {
        let config = app.config.read().unwrap();
        let defaults = config.agents.for_agent(resolved.agent_id());
        (config.models.clone(), defaults.model.clone())
    };
    match sessions.patch(&resolved, &patch, &models, &default_model) {
        Ok(entry) => Ok(entry_json(&resolved.format(), &entry)),
        Err(e) => Err((ErrorCode::from_code_str(e.code()), e.to_string())),
    }
}

fn handle_sessions_reset(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    let key = str_param(params, "key")?;
    let sessions = app.orchestrator.sessions();
    let resolved = sessions
        .resolve(key)
        .map_err(|e| (ErrorCode::from_code_str(e.code()), e.to_string()))?;
    match sessions.reset(&resolved) {
        Ok(entry) => Ok(entry_json(&resolved.format(), &entry)),
        Err(e) => Err((ErrorCode::from_code_str(e.code()), e.to_string())),
    }
}

async fn handle_sessions_delete(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    let key = str_param(params, "key")?;
    let sessions = app.orchestrator.sessions();
    let resolved = sessions
        .resolve(key)
        .map_err(|e| (ErrorCode::from_code_str(e.code()), e.to_string()))?;
    match sessions.delete(&resolved).await {
        Ok(()) => Ok(json!({ "deleted": resolved.format() })),
        Err(e) => Err((ErrorCode::from_code_str(e.code()), e.to_string())),
    }
}

fn handle_sessions_compact(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    let key = str_param(params, "key")?;
    let max_lines = params
        .and_then(|p| p.get("maxLines"))
        .and_then(Value::as_u64)
        .unwrap_or(200) as usize;
    let sessions = app.orchestrator.sessions();
    let resolved = sessions
        .resolve(key)
        .map_err(|e| (ErrorCode::from_code_str(e.code()), e.to_string()))?;
    match sessions.compact(&resolved, max_lines) {
        Ok(entry) => Ok(entry_json(&resolved.format(), &entry)),
        Err(e) => Err((ErrorCode::from_code_str(e.code()), e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// chat.history / send
// ---------------------------------------------------------------------------

fn handle_chat_history(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    let key = str_param(params, "sessionKey")?;
    let limit = params
        .and_then(|p| p.get("limit"))
        .and_then(Value::as_u64)
        .unwrap_or(50) as usize;
    let sessions = app.orchestrator.sessions();
    let resolved = sessions
        .resolve(key)
        .map_err(|e| (ErrorCode::from_code_str(e.code()), e.to_string()))?;
    let entry = sessions.get(&resolved).ok_or_else(|| {
        (
            ErrorCode::NotFound,
            format!("session not found: {key}"),
        )
    })?;
    let lines = transcript::tail(sessions.sessions_dir(), &entry.session_id, limit)
        .map_err(|e| (ErrorCode::Internal, e.to_string()))?;
    Ok(json!({ "sessionId": entry.session_id, "messages": lines }))
}

async fn handle_send(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    let channel = str_param(params, "channel")?;
    let to = str_param(params, "to")?;
    let text = str_param(params, "text")?;
    let thread_id = params
        .and_then(|p| p.get("threadId"))
        .and_then(Value::as_str);

    let target_dock = dock(channel).ok_or_else(|| {
        (
            ErrorCode::InvalidRequest,
            format!("unknown channel: {channel}"),
        )
    })?;
    let transport = app.orchestrator.transport(channel).ok_or_else(|| {
        (
            ErrorCode::Unavailable,
            format!("channel not connected: {channel}"),
        )
    })?;

    match outbound::deliver(
        target_dock,
        transport.as_ref(),
        to,
        &OutboundPayload::text(text),
        thread_id,
    )
    .await
    {
        Ok(()) => Ok(json!({ "sent": true, "channel": channel, "to": to })),
        Err(e) => Err((ErrorCode::Unavailable, e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// config.*
// ---------------------------------------------------------------------------

fn handle_config_get(app: &Arc<AppState>) -> DispatchResult {
    let config = app.config.read().unwrap();
    serde_json::to_value(&*config).map_err(|e| (ErrorCode::Internal, e.to_string()))
}

fn handle_config_schema() -> DispatchResult {
    Ok(json!({
        "sections": [
            "gateway", "agents", "auth", "session",
            "subagents", "models", "channels", "stream",
        ]
    }))
}

fn handle_config_set(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    let value = params
        .and_then(|p| p.get("config"))
        .cloned()
        .ok_or_else(|| (ErrorCode::InvalidRequest, "missing 'config' field".into()))?;
    let parsed: ClawdbotConfig = serde_json::from_value(value)
        .map_err(|e| (ErrorCode::InvalidRequest, format!("invalid config: {e}")))?;
    parsed
        .save(&app.state_dir)
        .map_err(|e| (ErrorCode::Internal, e.to_string()))?;
    *app.config.write().unwrap() = parsed;
    Ok(json!({ "saved": true }))
}

/// `config.apply` persists (optionally replacing the config first) and
/// schedules a restart via the sentinel file.
fn handle_config_apply(app: &Arc<AppState>, params: Option<&Value>) -> DispatchResult {
    if params.map(|p| p.get("config").is_some()).unwrap_or(false) {
        handle_config_set(app, params)?;
    } else {
        let config = app.config.read().unwrap();
        config
            .save(&app.state_dir)
            .map_err(|e| (ErrorCode::Internal, e.to_string()))?;
    }
    ClawdbotConfig::write_restart_sentinel(&app.state_dir)
        .map_err(|e| (ErrorCode::Internal, e.to_string()))?;
    Ok(json!({ "saved": true, "restartScheduled": true }))
}

// ---------------------------------------------------------------------------
// channels.status
// ---------------------------------------------------------------------------

fn handle_channels_status(app: &Arc<AppState>) -> DispatchResult {
    let channels: Vec<Value> = clawdbot_channels::docks()
        .iter()
        .map(|d| {
            let transport = app.orchestrator.transport(d.id);
            json!({
                "channel": d.id,
                "connected": transport.is_some(),
                "linked": transport.map(|t| t.is_linked()).unwrap_or(false),
                "textChunkLimit": d.text_chunk_limit,
            })
        })
        .collect();
    Ok(json!({ "channels": channels }))
}

// ---------------------------------------------------------------------------
// In-process RPC boundary (subagent + heartbeat re-entry)
// ---------------------------------------------------------------------------

pub struct AppRpc(pub Arc<AppState>);

#[async_trait]
impl GatewayRpc for AppRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        match route(&self.0, method, Some(&params), None).await {
            Ok(value) => Ok(value),
            Err((code, message)) => {
                if method == methods::AGENT_WAIT && code == ErrorCode::NotFound {
                    // the subagent watcher retries on this until the child
                    // run registers
                    let run_id = params
                        .get("runId")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    return Err(AgentError::RunNotFound { run_id });
                }
                warn!(method, %message, "in-process rpc failed");
                Err(AgentError::Rpc {
                    code: code.as_str().to_string(),
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex, RwLock};

    use clawdbot_auth::AuthProfileStore;
    use clawdbot_sessions::SessionStore;

    use crate::runner::DevEchoRunner;

    fn test_app() -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(RwLock::new(ClawdbotConfig::default()));
        let sessions = Arc::new(SessionStore::open(dir.path(), "main").unwrap());
        let home = dir.path().join("home");
        std::fs::create_dir_all(&home).unwrap();
        let mut auth =
            AuthProfileStore::ensure_with_home(&dir.path().join("agent"), &home).unwrap();
        auth.upsert(
            "anthropic:default",
            clawdbot_auth::CredentialProfile {
                provider: "anthropic".into(),
                credential: clawdbot_auth::Credential::ApiKey { key: "sk".into() },
            },
        )
        .unwrap();

        let orchestrator = Arc::new(clawdbot_agent::Orchestrator::new(
            Arc::clone(&config),
            sessions,
            Arc::new(StdMutex::new(auth)),
            Arc::new(DevEchoRunner),
        ));
        let app = AppState::new(dir.path().to_path_buf(), config, orchestrator);
        (dir, app)
    }

    #[tokio::test]
    async fn ping_pongs() {
        let (_dir, app) = test_app();
        let result = route(&app, methods::PING, None, None).await.unwrap();
        assert_eq!(result, json!({ "pong": true }));
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let (_dir, app) = test_app();
        let err = route(&app, "nope.nope", None, None).await.unwrap_err();
        assert_eq!(err.0, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn agent_runs_end_to_end_with_echo_runner() {
        let (_dir, app) = test_app();
        let params = json!({ "sessionKey": "agent:main:main", "message": "hello" });
        let result = route(&app, methods::AGENT, Some(&params), None)
            .await
            .unwrap();
        let text = result["payloads"][0]["text"].as_str().unwrap();
        assert!(text.contains("hello"));
        assert!(result["runId"].is_string());
    }

    #[tokio::test]
    async fn duplicate_label_yields_conflict() {
        let (_dir, app) = test_app();
        let sessions = app.orchestrator.sessions();
        let a = clawdbot_sessions::SessionKey::parse("agent:main:telegram:direct:1").unwrap();
        let b = clawdbot_sessions::SessionKey::parse("agent:main:telegram:direct:2").unwrap();
        sessions.get_or_create(&a).unwrap();
        sessions.get_or_create(&b).unwrap();

        let patch = json!({ "key": a.format(), "patch": { "label": "travel" } });
        route(&app, methods::SESSIONS_PATCH, Some(&patch), None)
            .await
            .unwrap();

        let patch = json!({ "key": b.format(), "patch": { "label": "travel" } });
        let err = route(&app, methods::SESSIONS_PATCH, Some(&patch), None)
            .await
            .unwrap_err();
        assert_eq!(err.0, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn delete_main_is_invalid() {
        let (_dir, app) = test_app();
        app.orchestrator
            .sessions()
            .get_or_create(&clawdbot_sessions::SessionKey::main("main"))
            .unwrap();
        let params = json!({ "key": "main" });
        let err = route(&app, methods::SESSIONS_DELETE, Some(&params), None)
            .await
            .unwrap_err();
        assert_eq!(err.0, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn chat_history_returns_transcript_tail() {
        let (_dir, app) = test_app();
        let params = json!({ "sessionKey": "agent:main:main", "message": "remember me" });
        route(&app, methods::AGENT, Some(&params), None)
            .await
            .unwrap();

        let params = json!({ "sessionKey": "agent:main:main", "limit": 10 });
        let history = route(&app, methods::CHAT_HISTORY, Some(&params), None)
            .await
            .unwrap();
        let messages = history["messages"].as_array().unwrap();
        assert!(messages.len() >= 2, "user + assistant lines expected");
        assert_eq!(messages[0]["role"], "user");
    }

    #[tokio::test]
    async fn config_set_rejects_invalid_and_applies_valid() {
        let (dir, app) = test_app();
        let bad = json!({ "config": { "gatewya": {} } });
        let err = route(&app, methods::CONFIG_SET, Some(&bad), None)
            .await
            .unwrap_err();
        assert_eq!(err.0, ErrorCode::InvalidRequest);

        let good = json!({ "config": { "gateway": { "port": 9999 } } });
        route(&app, methods::CONFIG_SET, Some(&good), None)
            .await
            .unwrap();
        assert_eq!(app.config.read().unwrap().gateway.port, 9999);
        assert!(dir.path().join("clawdbot.json").exists());

        route(&app, methods::CONFIG_APPLY, None, None).await.unwrap();
        assert!(dir.path().join("restart.pending").exists());
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let (_dir, app) = test_app();
        app.orchestrator
            .sessions()
            .get_or_create(&clawdbot_sessions::SessionKey::main("main"))
            .unwrap();
        let health = route(&app, methods::HEALTH, None, None).await.unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["sessions"], 1);
    }
}
