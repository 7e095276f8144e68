//! The agent run orchestrator: executes one conversational turn.
//!
//! Pre-flight resolves the session, the effective model, and the credential
//! try-order; the run itself streams through [`RunHooks`] driving typing
//! and block streaming; failures recover per the turn taxonomy (credential
//! failover, context-overflow/corrupt-history reset-and-retry-once); and
//! post-run bookkeeping updates the session entry and the credential store.

use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use clawdbot_auth::store::UsageDelta;
use clawdbot_auth::{AuthProfileStore, FailureReason};
use clawdbot_channels::dock::{dock, ChannelDock};
use clawdbot_channels::{outbound, ChannelTransport, OutboundPayload};
use clawdbot_core::config::ClawdbotConfig;
use clawdbot_core::envelope::MessageEnvelope;
use clawdbot_sessions::transcript::{self, TranscriptLine};
use clawdbot_sessions::{SessionKey, SessionStore};

use crate::blocks::{BlockAccumulator, BlockConfig};
use crate::error::{friendly_transport_message, AgentError, Result, RunError};
use crate::lanes::SessionLanes;
use crate::provider::{ProviderRunner, RunHooks, RunOutcome, RunRequest, RunUsage};
use crate::typing::{TypingDriver, TypingSignal, TypingState};

/// Sentinel suppressing any delivery and typing for a turn.
pub const NO_REPLY: &str = "NO_REPLY";

/// Credential candidates tried per turn before giving up.
const MAX_AUTH_ATTEMPTS: usize = 4;

/// Transparent retries for transport-level errors on one profile.
const MAX_TRANSPORT_RETRIES: usize = 2;

/// Cadence of the block-streaming idle check.
const IDLE_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct AgentRunRequest {
    /// Raw key, `"main"` shorthand, or a session label.
    pub session_key: String,
    pub run_id: Option<String>,
    pub prompt: String,
    pub extra_system_prompt: Option<String>,
    pub envelope: Option<MessageEnvelope>,
    /// Deliver payloads on the originating channel after the run.
    pub deliver: bool,
    /// Informational lane tag ("subagent", …) for logs and events.
    pub lane: Option<String>,
    pub is_heartbeat: bool,
    pub timeout_ms: Option<u64>,
    pub preferred_profile: Option<String>,
}

impl AgentRunRequest {
    pub fn new(session_key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            run_id: None,
            prompt: prompt.into(),
            extra_system_prompt: None,
            envelope: None,
            deliver: true,
            lane: None,
            is_heartbeat: false,
            timeout_ms: None,
            preferred_profile: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunResult {
    pub run_id: String,
    pub session_id: String,
    pub payloads: Vec<OutboundPayload>,
    pub usage: RunUsage,
    pub duration_ms: u64,
    pub aborted: bool,
}

/// Progress events forwarded to the requesting connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentProgress {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    BlockReply { text: String },
    ToolStart { name: String },
    AgentEvent { event: String, payload: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    Aborted,
    Failed,
}

/// Lifecycle broadcast for run observers (subagent registry, WS pushes).
#[derive(Debug, Clone, Serialize)]
pub struct RunLifecycleEvent {
    pub run_id: String,
    pub session_key: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
}

struct RunRecord {
    status_rx: watch::Receiver<RunStatus>,
}

/// How the provider loop ended; drives the shared post-processing.
enum TurnEnd {
    Outcome(RunOutcome),
    /// User-visible failure text (`Agent failed before reply: …`).
    Failed(String),
    Timeout(u64),
    Aborted,
}

pub struct Orchestrator {
    config: Arc<RwLock<ClawdbotConfig>>,
    sessions: Arc<SessionStore>,
    auth: Arc<StdMutex<AuthProfileStore>>,
    runner: Arc<dyn ProviderRunner>,
    transports: DashMap<String, Arc<dyn ChannelTransport>>,
    lanes: SessionLanes,
    events: broadcast::Sender<RunLifecycleEvent>,
    runs: DashMap<String, RunRecord>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<RwLock<ClawdbotConfig>>,
        sessions: Arc<SessionStore>,
        auth: Arc<StdMutex<AuthProfileStore>>,
        runner: Arc<dyn ProviderRunner>,
    ) -> Self {
        let queue_mode = config.read().unwrap().session.queue_mode;
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            sessions,
            auth,
            runner,
            transports: DashMap::new(),
            lanes: SessionLanes::new(queue_mode),
            events,
            runs: DashMap::new(),
        }
    }

    pub fn register_transport(&self, transport: Arc<dyn ChannelTransport>) {
        self.transports
            .insert(transport.channel().to_string(), transport);
    }

    pub fn transport(&self, channel: &str) -> Option<Arc<dyn ChannelTransport>> {
        self.transports.get(channel).map(|t| Arc::clone(&t))
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn config(&self) -> &Arc<RwLock<ClawdbotConfig>> {
        &self.config
    }

    pub fn auth(&self) -> &Arc<StdMutex<AuthProfileStore>> {
        &self.auth
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<RunLifecycleEvent> {
        self.events.subscribe()
    }

    /// The lifecycle bus itself, for components that subscribe lazily.
    pub fn lifecycle_sender(&self) -> broadcast::Sender<RunLifecycleEvent> {
        self.events.clone()
    }

    /// Cross-process completion wait: resolves when the run leaves
    /// `Running` or the timeout lapses (returning the last seen status).
    pub async fn wait(&self, run_id: &str, timeout_ms: u64) -> Result<RunStatus> {
        let mut rx = {
            let record = self
                .runs
                .get(run_id)
                .ok_or_else(|| AgentError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;
            record.status_rx.clone()
        };
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let status = rx.borrow().clone();
            if status != RunStatus::Running {
                return Ok(status);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(rx.borrow().clone());
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(rx.borrow().clone());
                }
            }
        }
    }

    /// Execute one turn. Optionally forwards progress events to `progress`.
    #[instrument(skip(self, req, progress), fields(session = %req.session_key, heartbeat = req.is_heartbeat))]
    pub async fn run(
        &self,
        req: AgentRunRequest,
        progress: Option<mpsc::Sender<AgentProgress>>,
    ) -> Result<AgentRunResult> {
        let started = Instant::now();
        let run_id = req
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let key = self.sessions.resolve(&req.session_key)?;
        let key_str = key.format();

        // Per-session serialization; interrupt mode cancels the holder.
        let (lane_guard, cancel) = self.lanes.acquire(&key_str).await;
        let run_guard = self.sessions.register_run(&key, cancel.clone());

        let (status_tx, status_rx) = watch::channel(RunStatus::Running);
        self.runs.insert(run_id.clone(), RunRecord { status_rx });
        self.emit(&run_id, &key_str, RunStatus::Running, req.lane.clone());

        let result = self.run_inner(&req, &run_id, &key, &cancel, progress).await;

        let final_status = match &result {
            Ok(r) if r.aborted => RunStatus::Aborted,
            Ok(_) => RunStatus::Ok,
            Err(_) => RunStatus::Failed,
        };
        let _ = status_tx.send(final_status.clone());
        self.emit(&run_id, &key_str, final_status, req.lane.clone());

        drop(run_guard);
        self.lanes.finish(&key_str);
        drop(lane_guard);

        result.map(|mut r| {
            r.duration_ms = started.elapsed().as_millis() as u64;
            r
        })
    }

    async fn run_inner(
        &self,
        req: &AgentRunRequest,
        run_id: &str,
        key: &SessionKey,
        cancel: &CancellationToken,
        progress: Option<mpsc::Sender<AgentProgress>>,
    ) -> Result<AgentRunResult> {
        let entry = self.sessions.get_or_create(key)?;

        // Effective model: session override → agent default → global default.
        let (provider, model, model_spec, thinking, typing_mode) = {
            let config = self.config.read().unwrap();
            let defaults = config.agents.for_agent(key.agent_id());
            let spec = entry
                .model_spec()
                .unwrap_or_else(|| defaults.model.clone());
            if !config.models.is_allowed(&spec) {
                return Err(AgentError::Run(RunError::InvalidRequest(format!(
                    "model not allowed: {spec}"
                ))));
            }
            let (provider, model) = spec
                .split_once('/')
                .map(|(p, m)| (p.to_string(), m.to_string()))
                .ok_or_else(|| {
                    AgentError::Run(RunError::InvalidRequest(format!("bad model spec: {spec}")))
                })?;
            let thinking =
                SessionStore::effective_thinking_level(&entry, &config.models, &defaults.model);
            (provider, model, spec, thinking, defaults.typing_mode)
        };

        // Credential try-order for the effective provider.
        let candidates = {
            let config = self.config.read().unwrap();
            let auth = self.auth.lock().unwrap();
            auth.resolve(
                Some(&config.auth),
                &provider,
                req.preferred_profile.as_deref(),
            )
        };

        let hooks = Arc::new(TurnHooks::new(
            typing_mode,
            req.is_heartbeat,
            self.delivery_target(req),
            self.block_config(req),
            progress,
        ));
        let _ticker = hooks.clone().spawn_idle_ticker();

        let system_prompt = self.build_system_prompt(req, &model_spec, entry.compaction_count);
        let mut run_req = RunRequest {
            session_key: key.format(),
            session_id: entry.session_id.clone(),
            provider: provider.clone(),
            model,
            profile_id: String::new(),
            system_prompt,
            prompt: match &req.envelope {
                Some(envelope) => envelope.render(&req.prompt),
                None => req.prompt.clone(),
            },
            thinking,
            tools: req
                .envelope
                .as_ref()
                .and_then(|e| dock(&e.provider))
                .map(crate::tools::channel_tools)
                .unwrap_or_default(),
            timeout_ms: req.timeout_ms,
        };

        let mut reset_done = false;
        let mut corrupt_note = false;
        let mut attempts = 0usize;
        let mut candidate_idx = 0usize;
        let mut transport_retries = 0usize;

        let end: TurnEnd = if candidates.is_empty() {
            warn!(%provider, "no usable credentials");
            TurnEnd::Failed(format!(
                "Agent failed before reply: no usable credentials for {provider}"
            ))
        } else {
            loop {
                if candidate_idx >= candidates.len() || attempts >= MAX_AUTH_ATTEMPTS {
                    break TurnEnd::Failed(
                        "Agent failed before reply: all credentials exhausted".to_string(),
                    );
                }
                let profile_id = candidates[candidate_idx].clone();
                run_req.profile_id = profile_id.clone();
                attempts += 1;

                let attempt = match req.timeout_ms {
                    Some(ms) => match tokio::time::timeout(
                        Duration::from_millis(ms),
                        self.runner.run(&run_req, hooks.as_ref(), cancel),
                    )
                    .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(RunError::Timeout { ms }),
                    },
                    None => self.runner.run(&run_req, hooks.as_ref(), cancel).await,
                };

                match attempt {
                    Ok(outcome) => {
                        let delta = UsageDelta {
                            input_tokens: outcome.usage.input_tokens,
                            output_tokens: outcome.usage.output_tokens,
                        };
                        if let Err(e) = self.auth.lock().unwrap().mark_success(&profile_id, delta)
                        {
                            warn!(error = %e, "mark_success failed");
                        }
                        break TurnEnd::Outcome(outcome);
                    }
                    Err(RunError::CredentialFailover {
                        billing, message, ..
                    }) => {
                        info!(profile = %profile_id, billing, %message, "credential failed, trying next");
                        let reason = if billing {
                            FailureReason::Billing
                        } else {
                            FailureReason::Unauthorized
                        };
                        let cooldowns = self.config.read().unwrap().auth.cooldowns.clone();
                        if let Err(e) = self.auth.lock().unwrap().mark_failure(
                            &profile_id,
                            reason,
                            Some(&cooldowns),
                        ) {
                            warn!(error = %e, "mark_failure failed");
                        }
                        candidate_idx += 1;
                        transport_retries = 0;
                    }
                    Err(err @ (RunError::ContextOverflow(_) | RunError::CorruptHistory(_))) => {
                        if reset_done {
                            break TurnEnd::Failed(
                                "Agent failed before reply: context overflow persisted after reset"
                                    .to_string(),
                            );
                        }
                        let corrupt = matches!(err, RunError::CorruptHistory(_));
                        warn!(corrupt, "resetting session and retrying turn once");
                        let fresh = self.sessions.reset(key)?;
                        run_req.session_id = fresh.session_id;
                        reset_done = true;
                        corrupt_note = corrupt;
                        // same profile, one clean retry
                    }
                    Err(RunError::Transport(message)) => {
                        transport_retries += 1;
                        if transport_retries <= MAX_TRANSPORT_RETRIES {
                            debug!(%message, retry = transport_retries, "transport error, retrying");
                            continue;
                        }
                        break TurnEnd::Failed(format!(
                            "Agent failed before reply: {}",
                            friendly_transport_message(&message)
                        ));
                    }
                    Err(RunError::Timeout { ms }) => {
                        warn!(ms, "run timed out");
                        break TurnEnd::Timeout(ms);
                    }
                    Err(RunError::Aborted) => {
                        info!("run aborted");
                        break TurnEnd::Aborted;
                    }
                    Err(RunError::InvalidRequest(message)) => {
                        hooks.finish().await;
                        return Err(AgentError::Run(RunError::InvalidRequest(message)));
                    }
                    Err(other) => {
                        let message = friendly_transport_message(&other.to_string());
                        break TurnEnd::Failed(format!("Agent failed before reply: {message}"));
                    }
                }
            }
        };

        // Flush block streaming and stop typing on every exit path.
        hooks.finish().await;

        let session_id = run_req.session_id.clone();
        let (mut payloads, usage, aborted, succeeded) = match end {
            TurnEnd::Outcome(outcome) => {
                (outcome.payloads, outcome.usage, false, true)
            }
            TurnEnd::Failed(message) => {
                (vec![OutboundPayload::text(message)], RunUsage::default(), false, false)
            }
            TurnEnd::Timeout(ms) => (
                vec![OutboundPayload::text(format!(
                    "Agent timed out after {}s.",
                    ms / 1000
                ))],
                RunUsage::default(),
                true,
                false,
            ),
            TurnEnd::Aborted => (Vec::new(), RunUsage::default(), true, false),
        };

        if corrupt_note && succeeded {
            payloads.insert(
                0,
                OutboundPayload::text(
                    "Note: conversation history was reset because the transcript was corrupted.",
                ),
            );
        }

        // NO_REPLY suppresses delivery entirely.
        let had_payloads = !payloads.is_empty();
        payloads.retain(|p| p.as_text().map(|t| t.trim() != NO_REPLY).unwrap_or(true));
        let no_reply = had_payloads && payloads.is_empty();

        if succeeded {
            // Persist transcript lines for the turn.
            let now = chrono::Utc::now().to_rfc3339();
            let _ = transcript::append(
                self.sessions.sessions_dir(),
                &session_id,
                &TranscriptLine {
                    role: "user".into(),
                    content: req.prompt.clone(),
                    timestamp: now.clone(),
                },
            );
            for payload in &payloads {
                if let Some(text) = payload.as_text() {
                    let _ = transcript::append(
                        self.sessions.sessions_dir(),
                        &session_id,
                        &TranscriptLine {
                            role: "assistant".into(),
                            content: text.to_string(),
                            timestamp: now.clone(),
                        },
                    );
                }
            }

            // Session bookkeeping: usage counters and last delivery route.
            let (last_channel, last_to, last_account) = match &req.envelope {
                Some(envelope) => (
                    Some(envelope.provider.as_str()),
                    Some(envelope.to.as_str()),
                    envelope.account_id.as_deref(),
                ),
                None => (None, None, None),
            };
            let _ = self.sessions.record_run(
                key,
                usage.input_tokens,
                usage.output_tokens,
                last_channel,
                last_to,
                last_account,
            );
        }

        // Outbound delivery. Block streaming already delivered text; only
        // the remaining payload kinds go through here in that case.
        if req.deliver && !no_reply && !aborted {
            if let Some(target) = self.delivery_target(req) {
                let already_streamed = succeeded && hooks.streamed_text();
                for payload in &payloads {
                    if already_streamed && matches!(payload, OutboundPayload::Text { .. }) {
                        continue;
                    }
                    if let Err(e) = outbound::deliver(
                        target.dock,
                        target.transport.as_ref(),
                        &target.to,
                        payload,
                        target.thread_id.as_deref(),
                    )
                    .await
                    {
                        warn!(error = %e, channel = target.dock.id, "outbound delivery failed");
                    }
                }
            }
        }

        Ok(AgentRunResult {
            run_id: run_id.to_string(),
            session_id,
            payloads,
            usage,
            duration_ms: 0,
            aborted,
        })
    }

    fn delivery_target(&self, req: &AgentRunRequest) -> Option<DeliveryTarget> {
        if !req.deliver {
            return None;
        }
        let envelope = req.envelope.as_ref()?;
        let dock = dock(&envelope.provider)?;
        let transport = self.transport(&envelope.provider)?;
        Some(DeliveryTarget {
            dock,
            transport,
            to: envelope.to.clone(),
            thread_id: envelope.thread_id.clone(),
        })
    }

    fn block_config(&self, req: &AgentRunRequest) -> Option<BlockConfig> {
        let config = self.config.read().unwrap();
        if !config.stream.block_streaming || req.is_heartbeat {
            return None;
        }
        let coalesce = req
            .envelope
            .as_ref()
            .and_then(|e| dock(&e.provider))
            .filter(|d| d.capabilities.block_streaming)
            .map(|d| d.coalesce);
        Some(BlockConfig {
            min_chars: coalesce
                .map(|c| c.min_chars)
                .unwrap_or(config.stream.min_chars),
            idle_ms: coalesce.map(|c| c.idle_ms).unwrap_or(config.stream.idle_ms),
            enforce_final_tag: config.stream.enforce_final_tag,
        })
    }

    fn build_system_prompt(
        &self,
        req: &AgentRunRequest,
        model_spec: &str,
        compaction_count: u32,
    ) -> String {
        let mut prompt = String::from(
            "You are a personal assistant reachable over chat channels. \
             Keep replies conversational and channel-appropriate.",
        );
        prompt.push_str(&format!("\n\nModel: {model_spec}"));
        prompt.push_str(&format!(
            "\nTime: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")
        ));
        if let Some(envelope) = &req.envelope {
            prompt.push_str(&format!(
                "\nChannel: {} ({})",
                envelope.provider,
                envelope.chat_type.as_str()
            ));
        }
        if compaction_count > 0 {
            prompt.push_str(&format!(
                "\nHistory has been compacted {compaction_count} time(s)."
            ));
        }
        if req.is_heartbeat {
            prompt.push_str("\nThis is a scheduled heartbeat turn, not a user message.");
        }
        if let Some(extra) = &req.extra_system_prompt {
            prompt.push_str("\n\n");
            prompt.push_str(extra);
        }
        prompt
    }

    fn emit(&self, run_id: &str, key: &str, status: RunStatus, lane: Option<String>) {
        let _ = self.events.send(RunLifecycleEvent {
            run_id: run_id.to_string(),
            session_key: key.to_string(),
            status,
            lane,
        });
    }
}

struct DeliveryTarget {
    dock: &'static ChannelDock,
    transport: Arc<dyn ChannelTransport>,
    to: String,
    thread_id: Option<String>,
}

/// Per-turn hook implementation: typing, block streaming, progress.
///
/// All state sits behind sync mutexes; the provider contract guarantees a
/// single consumer, and the idle ticker is the only other toucher.
struct TurnHooks {
    typing: StdMutex<TypingState>,
    typing_driver: StdMutex<Option<TypingDriver>>,
    delivery: Option<DeliveryTarget>,
    blocks: Option<StdMutex<BlockAccumulator>>,
    progress: Option<mpsc::Sender<AgentProgress>>,
    finished: StdMutex<bool>,
    streamed: StdMutex<bool>,
}

impl TurnHooks {
    fn new(
        typing_mode: clawdbot_core::config::TypingModeConfig,
        is_heartbeat: bool,
        delivery: Option<DeliveryTarget>,
        block_config: Option<BlockConfig>,
        progress: Option<mpsc::Sender<AgentProgress>>,
    ) -> Self {
        Self {
            typing: StdMutex::new(TypingState::new(typing_mode, is_heartbeat)),
            typing_driver: StdMutex::new(None),
            delivery,
            blocks: block_config.map(|cfg| StdMutex::new(BlockAccumulator::new(cfg))),
            progress,
            finished: StdMutex::new(false),
            streamed: StdMutex::new(false),
        }
    }

    /// Background idle check for the char-budget break.
    fn spawn_idle_ticker(self: Arc<Self>) -> IdleTicker {
        let hooks = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if *hooks.finished.lock().unwrap() {
                    break;
                }
                let chunk = hooks
                    .blocks
                    .as_ref()
                    .and_then(|b| b.lock().unwrap().check_idle(Instant::now()))
                    .map(|(text, _)| text);
                if let Some(text) = chunk {
                    hooks.emit_block(text).await;
                }
            }
        });
        IdleTicker { handle }
    }

    async fn emit_block(&self, text: String) {
        *self.streamed.lock().unwrap() = true;
        if let Some(target) = &self.delivery {
            let payload = OutboundPayload::text(text.clone());
            if let Err(e) = outbound::deliver(
                target.dock,
                target.transport.as_ref(),
                &target.to,
                &payload,
                target.thread_id.as_deref(),
            )
            .await
            {
                warn!(error = %e, "partial delivery failed");
            }
        }
        if let Some(progress) = &self.progress {
            let _ = progress.try_send(AgentProgress::BlockReply { text });
        }
    }

    /// True when block streaming delivered text chunks during the run.
    fn streamed_text(&self) -> bool {
        *self.streamed.lock().unwrap()
    }

    fn apply_typing(&self, signal: TypingSignal) {
        match signal {
            TypingSignal::Start => {
                if let Some(target) = &self.delivery {
                    let mut driver = self.typing_driver.lock().unwrap();
                    match driver.as_ref() {
                        None => {
                            *driver = Some(TypingDriver::start(
                                Arc::clone(&target.transport),
                                target.to.clone(),
                            ));
                        }
                        Some(d) => d.refresh(),
                    }
                }
            }
            TypingSignal::Refresh => {
                if let Some(d) = self.typing_driver.lock().unwrap().as_ref() {
                    d.refresh();
                }
            }
            TypingSignal::None => {}
        }
    }

    /// Flush block streaming and stop the typing indicator.
    async fn finish(&self) {
        *self.finished.lock().unwrap() = true;
        let chunk = self
            .blocks
            .as_ref()
            .and_then(|b| b.lock().unwrap().finish())
            .map(|(text, _)| text);
        if let Some(text) = chunk {
            self.emit_block(text).await;
        }
        if let Some(driver) = self.typing_driver.lock().unwrap().take() {
            driver.stop();
        }
    }
}

struct IdleTicker {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for IdleTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[async_trait::async_trait]
impl RunHooks for TurnHooks {
    async fn on_run_start(&self) {
        let signal = self.typing.lock().unwrap().on_run_start();
        self.apply_typing(signal);
    }

    async fn on_assistant_message_start(&self) {
        let signal = self.typing.lock().unwrap().on_assistant_message_start();
        self.apply_typing(signal);
        // previous message's buffered text becomes deliverable
        let chunk = self
            .blocks
            .as_ref()
            .and_then(|b| b.lock().unwrap().on_message_end())
            .map(|(text, _)| text);
        if let Some(text) = chunk {
            self.emit_block(text).await;
        }
    }

    async fn on_text_delta(&self, text: &str) {
        let signal = self.typing.lock().unwrap().on_text_delta();
        self.apply_typing(signal);
        if let Some(progress) = &self.progress {
            let _ = progress.try_send(AgentProgress::TextDelta {
                text: text.to_string(),
            });
        }
        let chunks: Vec<String> = self
            .blocks
            .as_ref()
            .map(|b| {
                b.lock()
                    .unwrap()
                    .push_delta(text, Instant::now())
                    .into_iter()
                    .map(|(t, _)| t)
                    .collect()
            })
            .unwrap_or_default();
        for chunk in chunks {
            self.emit_block(chunk).await;
        }
    }

    async fn on_reasoning_delta(&self, text: &str) {
        let signal = self.typing.lock().unwrap().on_reasoning_delta();
        self.apply_typing(signal);
        if let Some(progress) = &self.progress {
            let _ = progress.try_send(AgentProgress::ReasoningDelta {
                text: text.to_string(),
            });
        }
    }

    async fn on_tool_start(&self, name: &str, _args: &Value) {
        let signal = self.typing.lock().unwrap().on_tool_activity();
        self.apply_typing(signal);
        if let Some(progress) = &self.progress {
            let _ = progress.try_send(AgentProgress::ToolStart {
                name: name.to_string(),
            });
        }
    }

    async fn on_tool_result(&self, _result: &Value) {
        let signal = self.typing.lock().unwrap().on_tool_activity();
        self.apply_typing(signal);
    }

    async fn on_block_reply(&self, payload: &OutboundPayload) {
        // providers that chunk on their own side pass through here
        if let Some(text) = payload.as_text() {
            self.emit_block(text.to_string()).await;
        }
    }

    async fn on_agent_event(&self, event: &str, payload: &Value) {
        if let Some(progress) = &self.progress {
            let _ = progress.try_send(AgentProgress::AgentEvent {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
    }
}
