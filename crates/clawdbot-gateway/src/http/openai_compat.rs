//! OpenAI-compatible /v1/chat/completions endpoint.
//!
//! The web/OpenAI channel: a request translates to one `agent` run on the
//! default agent's webchat session. Streaming responses use
//! `text/event-stream` frames and a terminal `data: [DONE]`.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use clawdbot_agent::orchestrator::AgentProgress;
use clawdbot_agent::AgentRunRequest;

use crate::app::AppState;
use crate::auth;

#[derive(Debug, Deserialize)]
pub struct OpenAiRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<OpenAiInMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiInMessage {
    pub role: String,
    pub content: String,
}

impl OpenAiRequest {
    fn last_user_message(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
    }
}

#[derive(Debug, Serialize)]
pub struct OpenAiResponse {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<OpenAiOutMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<OpenAiOutMessage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OpenAiOutMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct OpenAiError {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

impl OpenAiError {
    fn new(message: &str) -> Self {
        Self {
            error: ErrorBody {
                message: message.to_string(),
            },
        }
    }
}

/// POST /v1/chat/completions — Bearer-authenticated OpenAI surface.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OpenAiRequest>,
) -> impl IntoResponse {
    let auth_config = state.config.read().unwrap().gateway.auth.clone();
    let presented = auth::presented_secret(&headers, None);
    if let Err(reason) = auth::authorize(&auth_config, presented.as_deref()) {
        return (StatusCode::UNAUTHORIZED, Json(OpenAiError::new(&reason))).into_response();
    }

    let Some(message) = req.last_user_message() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(OpenAiError::new("no user message found")),
        )
            .into_response();
    };

    info!(model = %req.model, stream = req.stream, "openai compat request");

    let default_agent = state.config.read().unwrap().agents.default_agent.clone();
    let session_key = format!("agent:{default_agent}:webchat:direct:openai");
    let mut run = AgentRunRequest::new(session_key, message);
    run.deliver = false;
    run.lane = Some("webchat".to_string());

    if req.stream {
        handle_streaming(state, run).await.into_response()
    } else {
        handle_non_streaming(state, run).await.into_response()
    }
}

async fn handle_non_streaming(state: Arc<AppState>, run: AgentRunRequest) -> impl IntoResponse {
    match state.orchestrator.run(run, None).await {
        Ok(result) => {
            let content = result
                .payloads
                .iter()
                .filter_map(|p| p.as_text())
                .collect::<Vec<_>>()
                .join("\n\n");
            let reply = OpenAiResponse {
                id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
                object: "chat.completion".to_string(),
                model: String::new(),
                choices: vec![Choice {
                    index: 0,
                    message: Some(OpenAiOutMessage {
                        role: "assistant".to_string(),
                        content: Some(content),
                    }),
                    delta: None,
                    finish_reason: Some("stop".to_string()),
                }],
                usage: Some(Usage {
                    prompt_tokens: result.usage.input_tokens,
                    completion_tokens: result.usage.output_tokens,
                    total_tokens: result.usage.input_tokens + result.usage.output_tokens,
                }),
            };
            (StatusCode::OK, Json(reply)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "chat completions failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OpenAiError::new(&e.to_string())),
            )
                .into_response()
        }
    }
}

async fn handle_streaming(state: Arc<AppState>, run: AgentRunRequest) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<AgentProgress>(64);
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    // drive the run in the background; deltas stream out as SSE chunks
    tokio::spawn(async move {
        if let Err(e) = state.orchestrator.run(run, Some(tx)).await {
            warn!(error = %e, "streaming chat completions failed");
        }
    });

    let chunk_id = id.clone();
    let event_stream = stream::unfold((rx, false), move |(mut rx, done)| {
        let id = chunk_id.clone();
        async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Some(AgentProgress::TextDelta { text }) => {
                        let chunk = delta_chunk(&id, Some(text), None);
                        return Some((
                            Ok::<_, std::convert::Infallible>(Event::default().data(chunk)),
                            (rx, false),
                        ));
                    }
                    // reasoning/tool events are not part of this surface
                    Some(_) => continue,
                    None => {
                        // run finished: final chunk then [DONE]
                        let chunk = delta_chunk(&id, None, Some("stop".to_string()));
                        return Some((Ok(Event::default().data(chunk)), (rx, true)));
                    }
                }
            }
        }
    });
    let tail = stream::iter(vec![Ok(Event::default().data("[DONE]"))]);
    let full = futures_util::StreamExt::chain(event_stream, tail);

    Sse::new(full).keep_alive(KeepAlive::default())
}

fn delta_chunk(id: &str, content: Option<String>, finish: Option<String>) -> String {
    let chunk = OpenAiResponse {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        model: String::new(),
        choices: vec![Choice {
            index: 0,
            message: None,
            delta: Some(OpenAiOutMessage {
                role: "assistant".to_string(),
                content,
            }),
            finish_reason: finish,
        }],
        usage: None,
    };
    serde_json::to_string(&chunk).unwrap_or_default()
}
