use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// Health snapshot shared by `GET /health` and the `health` WS method.
pub fn snapshot(app: &Arc<AppState>) -> Value {
    let sessions = app.orchestrator.sessions().list();
    let channels: Vec<Value> = clawdbot_channels::docks()
        .iter()
        .filter_map(|d| {
            app.orchestrator.transport(d.id).map(|t| {
                json!({
                    "channel": d.id,
                    "linked": t.is_linked(),
                })
            })
        })
        .collect();
    let heartbeat = app
        .heartbeat
        .get()
        .and_then(|h| h.last_status())
        .map(|s| serde_json::to_value(&s).unwrap_or(Value::Null));

    json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": app.started_at.elapsed().as_secs(),
        "sessions": sessions.len(),
        "channels": channels,
        "heartbeat": heartbeat,
    })
}

/// GET /health — unauthenticated liveness endpoint.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(snapshot(&state))
}
