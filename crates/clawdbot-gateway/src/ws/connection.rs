//! Per-connection WebSocket plumbing.
//!
//! Auth resolves before the upgrade completes. The first server frame is
//! the hello envelope; after that a writer task owns the sink, request
//! handlers run concurrently and push frames (progress events before the
//! final response) through the outbound queue, and broadcast events fan in
//! from the shared bus.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use clawdbot_core::config::{MAX_PAYLOAD_BYTES, TICK_INTERVAL_SECS};
use clawdbot_protocol::frames::{EventFrame, InboundFrame, ReqFrame, ResFrame};
use clawdbot_protocol::{methods, Hello};

use crate::app::AppState;
use crate::auth;
use crate::ws::dispatch;

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
/// Authentication happens here, before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let auth_config = state.config.read().unwrap().gateway.auth.clone();
    let presented = auth::presented_secret(
        &headers,
        query
            .get("token")
            .map(|t| format!("token={t}"))
            .as_deref(),
    );
    if let Err(reason) = auth::authorize(&auth_config, presented.as_deref()) {
        warn!(%reason, "ws upgrade rejected");
        return (StatusCode::UNAUTHORIZED, reason).into_response();
    }
    ws.on_upgrade(|socket| handle_connection(socket, state))
        .into_response()
}

/// Per-connection task — lives for the entire WS session lifetime.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "new WS connection");

    let (mut sink, mut stream) = socket.split();
    let mut broadcast_rx = state.broadcaster.subscribe();

    // hello envelope first; clients wait for it before issuing requests
    let hello = Hello::new(env!("CARGO_PKG_VERSION"), methods::all());
    let hello_json = serde_json::to_string(&hello).unwrap_or_default();
    if sink.send(Message::Text(hello_json.into())).await.is_err() {
        return;
    }

    // single writer task; handlers enqueue frames
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        while let Some(json) = out_rx.recv().await {
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut tick =
        tokio::time::interval(std::time::Duration::from_secs(TICK_INTERVAL_SECS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text: &str = &text;
                        if text.len() > MAX_PAYLOAD_BYTES {
                            warn!(conn_id, size = text.len(), "payload too large, closing");
                            break;
                        }
                        handle_frame(&state, text, &out_tx, &conn_id);
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // axum answers pings at the protocol layer
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id, error = %e, "ws read error");
                        break;
                    }
                    _ => {}
                }
            }

            event = broadcast_rx.recv() => {
                match event {
                    Ok(json) => {
                        if out_tx.send(json).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(conn_id, missed = n, "slow consumer dropped events");
                    }
                    Err(_) => break,
                }
            }

            _ = tick.tick() => {
                let frame = EventFrame::broadcast(
                    "tick",
                    serde_json::json!({ "ts": chrono::Utc::now().timestamp_millis() }),
                )
                .with_seq(state.next_seq());
                let json = serde_json::to_string(&frame).unwrap_or_default();
                if out_tx.send(json).await.is_err() {
                    break;
                }
            }
        }
    }

    writer.abort();
    info!(conn_id, "WS connection closed");
}

/// Parse one inbound frame and spawn its handler. Multi-frame responses
/// for one request stay ordered because the handler task sends progress
/// events itself, before the final frame, into the single writer queue.
fn handle_frame(state: &Arc<AppState>, text: &str, out_tx: &mpsc::Sender<String>, conn_id: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn_id, error = %e, "malformed frame, ignoring");
            return;
        }
    };
    let Some(req) = frame.as_req() else {
        debug!(conn_id, frame_type = %frame.frame_type, "non-request frame ignored");
        return;
    };

    let state = Arc::clone(state);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let res = execute_request(&state, &req, &out_tx).await;
        let json = serde_json::to_string(&res).unwrap_or_default();
        let _ = out_tx.send(json).await;
    });
}

async fn execute_request(
    state: &Arc<AppState>,
    req: &ReqFrame,
    out_tx: &mpsc::Sender<String>,
) -> ResFrame {
    // idempotency: a repeated key replays the cached payload
    if let Some(key) = &req.idempotency_key {
        if let Some(cached) = state.idempotency.get(key) {
            debug!(id = %req.id, "idempotent replay");
            return ResFrame::ok(&req.id, cached);
        }
    }

    // agent runs stream progress frames tagged with the request id
    let progress = if req.method == methods::AGENT {
        let (tx, mut rx) = mpsc::channel(64);
        let out_tx = out_tx.clone();
        let id = req.id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let frame = EventFrame::progress(&id, "agent.progress", &event);
                if let Ok(json) = serde_json::to_string(&frame) {
                    if out_tx.send(json).await.is_err() {
                        break;
                    }
                }
            }
        });
        Some(tx)
    } else {
        None
    };

    match dispatch::route(state, &req.method, req.params.as_ref(), progress).await {
        Ok(payload) => {
            if let Some(key) = &req.idempotency_key {
                state.idempotency.put(key, payload.clone());
            }
            ResFrame::ok(&req.id, payload)
        }
        Err((code, message)) => ResFrame::err(&req.id, code, &message),
    }
}
