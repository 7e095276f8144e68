//! Subagent lifecycle: spawn a child session under its parent, detect
//! completion (in-process lifecycle events, with a cross-process
//! `agent.wait` fallback), announce the result back to the requester, and
//! clean up.
//!
//! The registry is an explicit, injected struct — the process lifecycle
//! owns `start_sweeper`/`stop_sweeper`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use clawdbot_core::config::ClawdbotConfig;
use clawdbot_sessions::SessionKey;

use crate::error::{AgentError, Result};
use crate::orchestrator::{RunLifecycleEvent, RunStatus};
use crate::rpc::GatewayRpc;

/// Sweeper cadence for archived subagent sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Grace for `agent.wait` issued before the child run registered.
const WAIT_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cleanup {
    Delete,
    Keep,
}

#[derive(Debug, Clone)]
pub struct SpawnParams {
    pub requester_session_key: String,
    /// Label or key shown in the announce message.
    pub requester_display_key: String,
    /// Agent to spawn under; defaults to the requester's agent.
    pub target_agent: Option<String>,
    pub task: String,
    pub model: Option<String>,
    pub cleanup: Cleanup,
    pub label: Option<String>,
    pub run_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpawnResult {
    pub run_id: String,
    pub child_session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// In-memory record of one spawned child run.
pub struct SubagentRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_display_key: String,
    pub task: String,
    pub cleanup: Cleanup,
    pub label: Option<String>,
    pub created_at_ms: i64,
    pub archive_at_ms: Option<i64>,
    announce_handled: AtomicBool,
    ended: AtomicBool,
}

pub struct SubagentRegistry {
    rpc: Arc<dyn GatewayRpc>,
    config: Arc<RwLock<ClawdbotConfig>>,
    lifecycle: broadcast::Sender<RunLifecycleEvent>,
    runs: Arc<DashMap<String, Arc<SubagentRun>>>,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SubagentRegistry {
    pub fn new(
        rpc: Arc<dyn GatewayRpc>,
        config: Arc<RwLock<ClawdbotConfig>>,
        lifecycle: broadcast::Sender<RunLifecycleEvent>,
    ) -> Self {
        Self {
            rpc,
            config,
            lifecycle,
            runs: Arc::new(DashMap::new()),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    pub fn run(&self, run_id: &str) -> Option<Arc<SubagentRun>> {
        self.runs.get(run_id).map(|r| Arc::clone(&r))
    }

    /// Atomically claim the announce step; each run announces at most once.
    pub fn begin_announce(&self, run_id: &str) -> bool {
        self.runs
            .get(run_id)
            .map(|r| !r.announce_handled.swap(true, Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Spawn a child run. Returns after the child is dispatched — the
    /// completion watcher and announce flow run in the background.
    #[instrument(skip(self, params), fields(requester = %params.requester_session_key))]
    pub async fn spawn(self: &Arc<Self>, params: SpawnParams) -> Result<SpawnResult> {
        let requester_key = SessionKey::parse(&params.requester_session_key)?;
        let parent_agent = requester_key.agent_id().to_string();
        let target_agent = params
            .target_agent
            .clone()
            .unwrap_or_else(|| parent_agent.clone());

        // Spawning policy: wildcard, explicit listing, or same agent.
        {
            let config = self.config.read().unwrap();
            let allow = &config.subagents.allow_agents;
            let allowed = allow.iter().any(|a| a == "*")
                || allow.iter().any(|a| a == &target_agent)
                || target_agent == parent_agent;
            if !allowed {
                return Err(AgentError::SpawnRefused(format!(
                    "agent '{target_agent}' is not in subagents.allowAgents"
                )));
            }
        }

        let child_id = uuid::Uuid::new_v4().simple().to_string();
        let child_key = SessionKey::subagent(&target_agent, &child_id[..8]).format();
        let run_id = uuid::Uuid::new_v4().to_string();

        // Per-session model override: explicit > per-agent > subagent default.
        let model = {
            let config = self.config.read().unwrap();
            params
                .model
                .clone()
                .or_else(|| config.subagents.model_by_agent.get(&target_agent).cloned())
                .or_else(|| config.subagents.model.clone())
        };
        let mut warning = None;
        if let Some(model) = model {
            let patch = json!({ "key": child_key, "patch": { "model": model } });
            if let Err(e) = self.rpc.call("sessions.patch", patch).await {
                warning = Some(format!("subagent model override rejected: {e}"));
                warn!(%child_key, error = %e, "model override rejected, using defaults");
            }
        }

        // Mark lineage before the run starts.
        let lineage = json!({
            "key": child_key,
            "patch": { "spawnedBy": params.requester_session_key }
        });
        if let Err(e) = self.rpc.call("sessions.patch", lineage).await {
            debug!(error = %e, "spawnedBy patch failed");
        }

        let archive_at_ms = {
            let config = self.config.read().unwrap();
            match params.cleanup {
                Cleanup::Keep => config.subagents.archive_after_min.map(|min| {
                    chrono::Utc::now().timestamp_millis() + (min as i64) * 60_000
                }),
                Cleanup::Delete => None,
            }
        };

        let record = Arc::new(SubagentRun {
            run_id: run_id.clone(),
            child_session_key: child_key.clone(),
            requester_session_key: params.requester_session_key.clone(),
            requester_display_key: params.requester_display_key.clone(),
            task: params.task.clone(),
            cleanup: params.cleanup,
            label: params.label.clone(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            archive_at_ms,
            announce_handled: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        });
        self.runs.insert(run_id.clone(), Arc::clone(&record));

        // Dispatch the child run (fire-and-forget; completion is watched
        // separately).
        let rpc = Arc::clone(&self.rpc);
        let mut child_params = json!({
            "sessionKey": child_key,
            "message": params.task,
            "lane": "subagent",
            "deliver": false,
            "runId": run_id,
        });
        if let Some(secs) = params.run_timeout_seconds {
            child_params["timeoutMs"] = json!(secs * 1000);
        }
        tokio::spawn({
            let run_id = run_id.clone();
            async move {
                if let Err(e) = rpc.call("agent", child_params).await {
                    warn!(%run_id, error = %e, "subagent child run failed to dispatch");
                }
            }
        });

        // Completion watcher: first signal wins, announce claim is atomic.
        let registry = Arc::clone(self);
        let timeout_ms = params.run_timeout_seconds.unwrap_or(600) * 1000;
        tokio::spawn({
            let run_id = run_id.clone();
            async move {
                registry.watch_completion(&run_id, timeout_ms).await;
            }
        });

        info!(%run_id, %record.child_session_key, "subagent spawned");
        Ok(SpawnResult {
            run_id,
            child_session_key: record.child_session_key.clone(),
            warning,
        })
    }

    /// Wait for either an in-process lifecycle event or the `agent.wait`
    /// RPC (cross-process fallback), then run the announce flow once.
    async fn watch_completion(self: &Arc<Self>, run_id: &str, timeout_ms: u64) {
        let mut events = self.lifecycle.subscribe();
        let event_wait = async {
            loop {
                match events.recv().await {
                    Ok(evt) if evt.run_id == run_id && evt.status != RunStatus::Running => {
                        return;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        // no more in-process events; rely on agent.wait
                        std::future::pending::<()>().await;
                    }
                }
            }
        };

        let rpc_wait = async {
            let deadline =
                tokio::time::Instant::now() + Duration::from_millis(timeout_ms + 5_000);
            loop {
                let params = json!({ "runId": run_id, "timeoutMs": timeout_ms });
                match self.rpc.call("agent.wait", params).await {
                    Ok(_) => return,
                    Err(AgentError::RunNotFound { .. }) if tokio::time::Instant::now() < deadline => {
                        tokio::time::sleep(WAIT_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        debug!(%run_id, error = %e, "agent.wait fallback errored");
                        return;
                    }
                }
            }
        };

        tokio::select! {
            _ = event_wait => debug!(%run_id, "completion via lifecycle event"),
            _ = rpc_wait => debug!(%run_id, "completion via agent.wait"),
        }

        if let Some(record) = self.run(run_id) {
            record.ended.store(true, Ordering::SeqCst);
        }
        if self.begin_announce(run_id) {
            if let Err(e) = self.announce(run_id).await {
                warn!(%run_id, error = %e, "announce flow failed");
            }
        }
    }

    /// Summarize the child's result with a nested agent step and deliver
    /// one message to the requester's last-known target.
    #[instrument(skip(self))]
    async fn announce(self: &Arc<Self>, run_id: &str) -> Result<()> {
        let record = self.run(run_id).ok_or_else(|| AgentError::RunNotFound {
            run_id: run_id.to_string(),
        })?;

        // Nested announce step: a short summarization run on the child
        // session (it holds the full context of the task).
        let announce_prompt = format!(
            "Summarize the outcome of your task in one short chat message \
             for the requester. Task was: {}",
            record.task
        );
        let announce_params = json!({
            "sessionKey": record.child_session_key,
            "message": announce_prompt,
            "lane": "subagent",
            "deliver": false,
        });
        let summary = match self.rpc.call("agent", announce_params).await {
            Ok(value) => extract_final_text(&value)
                .unwrap_or_else(|| format!("Subagent task finished: {}", record.task)),
            Err(e) => {
                warn!(error = %e, "announce step failed, falling back to plain notice");
                format!("Subagent task finished: {}", record.task)
            }
        };

        // Requester delivery route from the session registry; the child's
        // usage stats ride along in the announce text.
        let sessions = self.rpc.call("sessions.list", json!({})).await?;
        let requester = find_entry(&sessions, &record.requester_session_key);
        let child = find_entry(&sessions, &record.child_session_key);

        let usage_note = child
            .and_then(|e| {
                let input = e.get("inputTokens").and_then(Value::as_u64)?;
                let output = e.get("outputTokens").and_then(Value::as_u64)?;
                Some(format!(" (tokens: {input} in / {output} out)"))
            })
            .unwrap_or_default();

        let Some((channel, to)) = requester.and_then(|e| {
            let channel = e.get("lastChannel").and_then(Value::as_str)?;
            let to = e.get("lastTo").and_then(Value::as_str)?;
            Some((channel.to_string(), to.to_string()))
        }) else {
            info!(%run_id, "requester has no delivery route; announce dropped");
            self.cleanup(&record).await;
            return Ok(());
        };
        let account_id = requester
            .and_then(|e| e.get("lastAccountId"))
            .and_then(Value::as_str);

        let text = format!(
            "[{}] {summary}{usage_note}",
            record.requester_display_key
        );
        let send_params = json!({
            "channel": channel,
            "to": to,
            "accountId": account_id,
            "text": text,
        });
        if let Err(e) = self.rpc.call("send", send_params).await {
            warn!(error = %e, "announce delivery failed");
        }

        self.cleanup(&record).await;
        Ok(())
    }

    async fn cleanup(&self, record: &SubagentRun) {
        match record.cleanup {
            Cleanup::Delete => {
                let params = json!({ "key": record.child_session_key });
                if let Err(e) = self.rpc.call("sessions.delete", params).await {
                    warn!(error = %e, "subagent session delete failed");
                }
                self.runs.remove(&record.run_id);
            }
            Cleanup::Keep => {
                // archive sweeper (if configured) removes it later
            }
        }
    }

    /// Start the 1-minute archive sweeper. Idempotent.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut guard = self.sweeper.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                registry.sweep_archived().await;
            }
        }));
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Delete kept subagent sessions past their archive deadline.
    async fn sweep_archived(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let due: Vec<Arc<SubagentRun>> = self
            .runs
            .iter()
            .filter(|r| {
                r.cleanup == Cleanup::Keep
                    && r.ended.load(Ordering::SeqCst)
                    && r.archive_at_ms.is_some_and(|at| at <= now)
            })
            .map(|r| Arc::clone(&r))
            .collect();
        for record in due {
            info!(run_id = %record.run_id, "archiving subagent session");
            let params = json!({ "key": record.child_session_key });
            if let Err(e) = self.rpc.call("sessions.delete", params).await {
                warn!(error = %e, "archive delete failed");
            }
            self.runs.remove(&record.run_id);
        }
    }
}

/// Pull the final assistant text out of an `agent` RPC payload.
fn extract_final_text(value: &Value) -> Option<String> {
    let payloads = value.get("payloads")?.as_array()?;
    payloads
        .iter()
        .rev()
        .find_map(|p| p.get("text").and_then(Value::as_str))
        .map(String::from)
}

fn find_entry<'a>(sessions: &'a Value, key: &str) -> Option<&'a Value> {
    sessions
        .get("sessions")?
        .as_array()?
        .iter()
        .find(|e| e.get("key").and_then(Value::as_str) == Some(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call; responds from a small script keyed by method.
    struct FakeRpc {
        calls: Mutex<Vec<(String, Value)>>,
        sessions_payload: Value,
    }

    impl FakeRpc {
        fn new(sessions_payload: Value) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                sessions_payload,
            }
        }

        fn methods(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl GatewayRpc for FakeRpc {
        async fn call(&self, method: &str, params: Value) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params));
            match method {
                "agent" => Ok(json!({
                    "payloads": [{ "kind": "text", "text": "Task done: summarized." }],
                    "runId": "x",
                })),
                "agent.wait" => Ok(json!({ "status": "ok" })),
                "sessions.list" => Ok(self.sessions_payload.clone()),
                _ => Ok(json!({})),
            }
        }
    }

    fn sessions_with_requester_route() -> Value {
        json!({
            "sessions": [
                {
                    "key": "agent:main:main",
                    "lastChannel": "whatsapp",
                    "lastTo": "+1555",
                    "lastAccountId": "default",
                },
            ]
        })
    }

    fn registry(rpc: Arc<FakeRpc>) -> Arc<SubagentRegistry> {
        let config = Arc::new(RwLock::new(ClawdbotConfig::default()));
        let (lifecycle, _) = broadcast::channel(16);
        Arc::new(SubagentRegistry::new(rpc, config, lifecycle))
    }

    #[tokio::test]
    async fn spawn_runs_child_waits_announces_and_cleans_up() {
        let rpc = Arc::new(FakeRpc::new(sessions_with_requester_route()));
        let registry = registry(Arc::clone(&rpc));

        let result = registry
            .spawn(SpawnParams {
                requester_session_key: "agent:main:main".into(),
                requester_display_key: "main".into(),
                target_agent: None,
                task: "collect the weather".into(),
                model: None,
                cleanup: Cleanup::Delete,
                label: None,
                run_timeout_seconds: Some(1),
            })
            .await
            .unwrap();
        assert!(result.child_session_key.contains(":subagent:"));

        // let the watcher finish (agent.wait resolves immediately)
        tokio::time::sleep(Duration::from_millis(200)).await;

        let methods = rpc.methods();
        // two agent calls: the child run and the nested announce step
        assert_eq!(methods.iter().filter(|m| *m == "agent").count(), 2);
        assert!(methods.iter().any(|m| m == "agent.wait"));
        assert!(methods.iter().any(|m| m == "send"));
        assert!(methods.iter().any(|m| m == "sessions.delete"));

        // the send targeted the requester's last-known route
        let calls = rpc.calls.lock().unwrap();
        let send = calls.iter().find(|(m, _)| m == "send").unwrap();
        assert_eq!(send.1["channel"], "whatsapp");
        assert_eq!(send.1["to"], "+1555");
        assert!(send.1["text"].as_str().unwrap().contains("Task done"));
    }

    #[tokio::test]
    async fn announce_claim_is_idempotent() {
        let rpc = Arc::new(FakeRpc::new(sessions_with_requester_route()));
        let registry = registry(Arc::clone(&rpc));

        let result = registry
            .spawn(SpawnParams {
                requester_session_key: "agent:main:main".into(),
                requester_display_key: "main".into(),
                target_agent: None,
                task: "t".into(),
                model: None,
                cleanup: Cleanup::Keep,
                label: None,
                run_timeout_seconds: Some(1),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // watcher already claimed it; direct claims must fail
        assert!(!registry.begin_announce(&result.run_id));
        assert!(!registry.begin_announce(&result.run_id));

        // exactly one send despite wait + any events
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sends = rpc.methods().iter().filter(|m| *m == "send").count();
        assert_eq!(sends, 1);
    }

    #[tokio::test]
    async fn spawn_policy_rejects_unlisted_agent() {
        let rpc = Arc::new(FakeRpc::new(json!({ "sessions": [] })));
        let config = Arc::new(RwLock::new(ClawdbotConfig::default()));
        config.write().unwrap().subagents.allow_agents = vec!["research".into()];
        let (lifecycle, _) = broadcast::channel(16);
        let registry = Arc::new(SubagentRegistry::new(rpc, config, lifecycle));

        let err = registry
            .spawn(SpawnParams {
                requester_session_key: "agent:main:main".into(),
                requester_display_key: "main".into(),
                target_agent: Some("ops".into()),
                task: "t".into(),
                model: None,
                cleanup: Cleanup::Delete,
                label: None,
                run_timeout_seconds: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SpawnRefused(_)));

        // same-agent spawns stay allowed even when unlisted
        let ok = registry
            .spawn(SpawnParams {
                requester_session_key: "agent:main:main".into(),
                requester_display_key: "main".into(),
                target_agent: Some("main".into()),
                task: "t".into(),
                model: None,
                cleanup: Cleanup::Delete,
                label: None,
                run_timeout_seconds: None,
            })
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn invalid_model_override_warns_and_continues() {
        struct PatchRejectingRpc(FakeRpc);

        #[async_trait::async_trait]
        impl GatewayRpc for PatchRejectingRpc {
            async fn call(&self, method: &str, params: Value) -> Result<Value> {
                if method == "sessions.patch" && params["patch"].get("model").is_some() {
                    return Err(AgentError::Rpc {
                        code: "INVALID_REQUEST".into(),
                        message: "model not in catalog".into(),
                    });
                }
                self.0.call(method, params).await
            }
        }

        let rpc = Arc::new(PatchRejectingRpc(FakeRpc::new(
            sessions_with_requester_route(),
        )));
        let config = Arc::new(RwLock::new(ClawdbotConfig::default()));
        let (lifecycle, _) = broadcast::channel(16);
        let registry = Arc::new(SubagentRegistry::new(rpc, config, lifecycle));

        let result = registry
            .spawn(SpawnParams {
                requester_session_key: "agent:main:main".into(),
                requester_display_key: "main".into(),
                target_agent: None,
                task: "t".into(),
                model: Some("bogus/model".into()),
                cleanup: Cleanup::Delete,
                label: None,
                run_timeout_seconds: Some(1),
            })
            .await
            .unwrap();
        assert!(result.warning.is_some());
    }

    #[tokio::test]
    async fn sweeper_deletes_archived_sessions() {
        let rpc = Arc::new(FakeRpc::new(sessions_with_requester_route()));
        let config = Arc::new(RwLock::new(ClawdbotConfig::default()));
        config.write().unwrap().subagents.archive_after_min = Some(0);
        let (lifecycle, _) = broadcast::channel(16);
        let registry = Arc::new(SubagentRegistry::new(
            Arc::clone(&rpc) as Arc<dyn GatewayRpc>,
            config,
            lifecycle,
        ));

        let result = registry
            .spawn(SpawnParams {
                requester_session_key: "agent:main:main".into(),
                requester_display_key: "main".into(),
                target_agent: None,
                task: "t".into(),
                model: None,
                cleanup: Cleanup::Keep,
                label: None,
                run_timeout_seconds: Some(1),
            })
            .await
            .unwrap();

        // wait for the watcher to mark the run ended
        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.sweep_archived().await;

        assert!(registry.run(&result.run_id).is_none());
        let deletes = rpc
            .methods()
            .iter()
            .filter(|m| *m == "sessions.delete")
            .count();
        assert_eq!(deletes, 1);
    }
}
