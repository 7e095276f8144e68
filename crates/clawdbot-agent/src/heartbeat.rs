//! Heartbeat runner: a periodic probe turn against the default agent's
//! main session, delivered over the last-known (or configured) channel.
//!
//! Replies equal to the `HEARTBEAT_OK` sentinel — including markup-wrapped
//! variants — are suppressed; everything else is truncated to the
//! configured ack length and delivered.

use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use clawdbot_channels::dock::dock;
use clawdbot_channels::{outbound, OutboundPayload};
use clawdbot_core::config::{parse_interval, ClawdbotConfig};
use clawdbot_sessions::{SessionEntry, SessionKey};

use crate::orchestrator::{AgentProgress, AgentRunRequest, Orchestrator};

/// Sentinel reply meaning "nothing needs attention".
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

const DEFAULT_PROMPT: &str = "Scheduled heartbeat. Review anything pending \
    (reminders, follow-ups, unfinished tasks). If nothing needs the user's \
    attention, reply with exactly HEARTBEAT_OK.";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TickStatus {
    Delivered { channel: String, to: String },
    Suppressed,
    Skipped { reason: String },
    Failed { error: String },
}

/// Where a heartbeat reply should go.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatTarget {
    pub channel: String,
    pub to: String,
    /// Why the target differs from the requested one, when it does.
    pub reason: Option<String>,
}

/// Resolve the delivery target from config and session state.
///
/// Order: explicit `target` config ("none" disables, "<channel>:<to>"
/// pins), then the session's last channel/to. Webchat targets are skipped.
/// On WhatsApp, a `to` outside the allow list is replaced by the first
/// allow-list entry — except group JIDs, which pass through.
pub fn resolve_delivery_target(
    cfg_target: Option<&str>,
    whatsapp_allow_from: &[String],
    entry: Option<&SessionEntry>,
) -> Result<HeartbeatTarget, String> {
    let explicit = match cfg_target.map(str::trim) {
        Some("none") => return Err("disabled".to_string()),
        Some("last") | Some("") | None => None,
        Some(spec) => {
            let (channel, to) = spec
                .split_once(':')
                .ok_or_else(|| format!("bad-target:{spec}"))?;
            Some((channel.trim().to_ascii_lowercase(), to.trim().to_string()))
        }
    };

    let (channel, to) = match explicit {
        Some(pair) => pair,
        None => {
            let entry = entry.ok_or_else(|| "no-target".to_string())?;
            match (&entry.last_channel, &entry.last_to) {
                (Some(channel), Some(to)) => (channel.clone(), to.clone()),
                _ => return Err("no-target".to_string()),
            }
        }
    };

    if channel == "webchat" {
        return Err("webchat".to_string());
    }

    let mut target = HeartbeatTarget {
        channel,
        to,
        reason: None,
    };
    if target.channel == "whatsapp"
        && !whatsapp_allow_from.is_empty()
        && !target.to.ends_with("@g.us")
        && !whatsapp_allow_from
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&target.to))
    {
        target.to = whatsapp_allow_from[0].clone();
        target.reason = Some("allowFrom-fallback".to_string());
    }
    Ok(target)
}

/// `HEARTBEAT_OK`, tolerant of markup wrappers (`<b>…</b>`, `**…**`).
pub fn is_heartbeat_ok(text: &str) -> bool {
    let mut stripped = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if in_tag => {}
            '*' | '_' | '`' | '~' => {}
            _ => stripped.push(ch),
        }
    }
    stripped.trim() == HEARTBEAT_OK
}

pub struct HeartbeatRunner {
    config: Arc<RwLock<ClawdbotConfig>>,
    orchestrator: Arc<Orchestrator>,
    last_status: std::sync::Mutex<Option<TickStatus>>,
}

impl HeartbeatRunner {
    pub fn new(config: Arc<RwLock<ClawdbotConfig>>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
            last_status: std::sync::Mutex::new(None),
        }
    }

    pub fn last_status(&self) -> Option<TickStatus> {
        self.last_status.lock().unwrap().clone()
    }

    /// Main loop. Interval comes from `agents.defaults.heartbeat.every`
    /// (re-read every cycle); `0` or garbage disables the runner.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("heartbeat runner started");
        loop {
            let every = {
                let config = self.config.read().unwrap();
                let agent_id = config.agents.default_agent.clone();
                parse_interval(&config.agents.for_agent(&agent_id).heartbeat.every)
            };
            let Some(every) = every else {
                info!("heartbeat disabled");
                return;
            };

            tokio::select! {
                _ = tokio::time::sleep(every) => {
                    let status = self.tick().await;
                    debug!(?status, "heartbeat tick");
                    *self.last_status.lock().unwrap() = Some(status);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat runner shutting down");
                        return;
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickStatus {
        let (agent_id, heartbeat, allow_from) = {
            let config = self.config.read().unwrap();
            let agent_id = config.agents.default_agent.clone();
            let heartbeat = config.agents.for_agent(&agent_id).heartbeat.clone();
            let allow_from = dock("whatsapp")
                .map(|d| d.resolve_allow_from(&config.channels, None))
                .unwrap_or_default();
            (agent_id, heartbeat, allow_from)
        };

        let main_key = SessionKey::main(&agent_id);
        let entry = self.orchestrator.sessions().get(&main_key);

        let target = match resolve_delivery_target(
            heartbeat.target.as_deref(),
            &allow_from,
            entry.as_ref(),
        ) {
            Ok(target) => target,
            Err(reason) => {
                debug!(%reason, "heartbeat skipped");
                return TickStatus::Skipped { reason };
            }
        };

        // WhatsApp delivery needs a linked account with a live listener.
        let transport = self.orchestrator.transport(&target.channel);
        if target.channel == "whatsapp" {
            match &transport {
                Some(t) if t.is_linked() => {}
                _ => {
                    return TickStatus::Skipped {
                        reason: "not-linked".to_string(),
                    }
                }
            }
        }
        let Some(transport) = transport else {
            return TickStatus::Skipped {
                reason: format!("no-transport:{}", target.channel),
            };
        };
        let Some(target_dock) = dock(&target.channel) else {
            return TickStatus::Skipped {
                reason: format!("no-dock:{}", target.channel),
            };
        };

        // Heartbeat turns never show typing and deliver manually below.
        let mut req = AgentRunRequest::new(
            main_key.format(),
            heartbeat
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
        );
        req.is_heartbeat = true;
        req.deliver = false;
        req.lane = Some("heartbeat".to_string());

        let (progress_tx, mut progress_rx) = mpsc::channel(256);
        let collector = tokio::spawn(async move {
            let mut reasoning = String::new();
            while let Some(event) = progress_rx.recv().await {
                if let AgentProgress::ReasoningDelta { text } = event {
                    reasoning.push_str(&text);
                }
            }
            reasoning
        });

        let result = self
            .orchestrator
            .run(req, heartbeat.include_reasoning.then(|| progress_tx.clone()))
            .await;
        drop(progress_tx);
        let reasoning = collector.await.unwrap_or_default();

        let result = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "heartbeat run failed");
                return TickStatus::Failed {
                    error: e.to_string(),
                };
            }
        };

        if heartbeat.include_reasoning && !reasoning.trim().is_empty() {
            let payload = OutboundPayload::text(format!("Reasoning:\n{}", reasoning.trim()));
            if let Err(e) = outbound::deliver(
                target_dock,
                transport.as_ref(),
                &target.to,
                &payload,
                None,
            )
            .await
            {
                warn!(error = %e, "heartbeat reasoning delivery failed");
            }
        }

        let final_text = result
            .payloads
            .iter()
            .rev()
            .find_map(|p| p.as_text())
            .unwrap_or_default()
            .to_string();

        if final_text.is_empty() || is_heartbeat_ok(&final_text) {
            debug!("heartbeat OK, ack suppressed");
            return TickStatus::Suppressed;
        }
        if heartbeat.ack_max_chars == 0 {
            return TickStatus::Suppressed;
        }

        let ack = truncate_chars(&final_text, heartbeat.ack_max_chars);
        match outbound::deliver(
            target_dock,
            transport.as_ref(),
            &target.to,
            &OutboundPayload::text(ack),
            None,
        )
        .await
        {
            Ok(()) => TickStatus::Delivered {
                channel: target.channel,
                to: target.to,
            },
            Err(e) => TickStatus::Failed {
                error: e.to_string(),
            },
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Spawn the runner in the teacher-loop shape: a handle plus a shutdown
/// sender the process lifecycle owns.
pub fn spawn(
    config: Arc<RwLock<ClawdbotConfig>>,
    orchestrator: Arc<Orchestrator>,
) -> (Arc<HeartbeatRunner>, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let runner = Arc::new(HeartbeatRunner::new(config, orchestrator));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&runner).run(shutdown_rx));
    (runner, shutdown_tx, handle)
}
