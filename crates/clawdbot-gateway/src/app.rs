use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::broadcast;

use clawdbot_agent::heartbeat::HeartbeatRunner;
use clawdbot_agent::{Orchestrator, SubagentRegistry};
use clawdbot_core::config::ClawdbotConfig;
use clawdbot_protocol::frames::EventFrame;

use crate::idempotency::IdempotencyCache;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub state_dir: PathBuf,
    pub config: Arc<RwLock<ClawdbotConfig>>,
    pub orchestrator: Arc<Orchestrator>,
    pub subagents: OnceLock<Arc<SubagentRegistry>>,
    pub heartbeat: OnceLock<Arc<HeartbeatRunner>>,
    pub idempotency: IdempotencyCache,
    /// Serialized event frames fanned out to every authenticated socket.
    pub broadcaster: broadcast::Sender<String>,
    pub event_seq: AtomicU64,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        state_dir: PathBuf,
        config: Arc<RwLock<ClawdbotConfig>>,
        orchestrator: Arc<Orchestrator>,
    ) -> Arc<Self> {
        let window = {
            let config = config.read().unwrap();
            Duration::from_secs(config.gateway.idempotency_window_secs)
        };
        let (broadcaster, _) = broadcast::channel(256);
        let app = Arc::new(Self {
            state_dir,
            config,
            orchestrator,
            subagents: OnceLock::new(),
            heartbeat: OnceLock::new(),
            idempotency: IdempotencyCache::new(window),
            broadcaster,
            event_seq: AtomicU64::new(0),
            started_at: Instant::now(),
        });
        app.spawn_event_bridge();
        app
    }

    /// Monotonically increasing sequence for broadcast events.
    pub fn next_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Fan a named event out to all connected clients.
    pub fn broadcast_event(&self, event: &str, payload: impl serde::Serialize) {
        let frame = EventFrame::broadcast(event, payload).with_seq(self.next_seq());
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = self.broadcaster.send(json);
        }
    }

    /// Bridge session and run lifecycle events onto the WS broadcast bus.
    fn spawn_event_bridge(self: &Arc<Self>) {
        let app = Arc::clone(self);
        let mut sessions = self.orchestrator.sessions().subscribe();
        tokio::spawn(async move {
            while let Ok(event) = sessions.recv().await {
                app.broadcast_event(event.kind.event_name(), &event);
            }
        });

        let app = Arc::clone(self);
        let mut runs = self.orchestrator.subscribe_lifecycle();
        tokio::spawn(async move {
            while let Ok(event) = runs.recv().await {
                app.broadcast_event("agent.run", &event);
            }
        });
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .route(
            "/v1/chat/completions",
            post(crate::http::openai_compat::chat_completions),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
