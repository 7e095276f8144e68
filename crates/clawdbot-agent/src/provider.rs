//! The provider-run abstraction the orchestrator drives.
//!
//! Provider SDKs (streaming wire formats, tool JSON encodings) live outside
//! this workspace. The orchestrator hands a [`RunRequest`] and a
//! [`RunHooks`] implementation to a [`ProviderRunner`] and consumes the
//! hook stream. Hooks are invoked from a single consumer task per run —
//! implementations never see interleaved calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use clawdbot_channels::OutboundPayload;
use clawdbot_sessions::ThinkingLevel;

use crate::error::RunError;

/// Tool surface exposed to the model for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One provider invocation, fully resolved: session, credential, model.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_key: String,
    pub session_id: String,
    pub provider: String,
    pub model: String,
    /// Credential profile chosen by the ordering engine.
    pub profile_id: String,
    pub system_prompt: String,
    pub prompt: String,
    pub thinking: Option<ThinkingLevel>,
    pub tools: Vec<ToolDefinition>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Final result of one provider run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub payloads: Vec<OutboundPayload>,
    pub usage: RunUsage,
    pub stop_reason: String,
}

/// Named streaming hooks. The orchestrator implements this once and drives
/// typing, block streaming, and lifecycle propagation from it.
///
/// Ordering guarantee: for one run, calls arrive strictly ordered and never
/// overlap. `on_run_start` fires exactly once before anything else;
/// everything after the provider's final payload goes through the
/// [`RunOutcome`] instead of hooks.
#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn on_run_start(&self) {}
    async fn on_assistant_message_start(&self) {}
    async fn on_text_delta(&self, _text: &str) {}
    async fn on_reasoning_delta(&self, _text: &str) {}
    async fn on_tool_start(&self, _name: &str, _args: &Value) {}
    async fn on_tool_result(&self, _result: &Value) {}
    /// Block streaming decided a chunk is deliverable mid-run.
    async fn on_block_reply(&self, _payload: &OutboundPayload) {}
    /// Generic event passthrough (compaction start/end, …).
    async fn on_agent_event(&self, _event: &str, _payload: &Value) {}
}

/// No-op hooks for callers that only need the final outcome.
pub struct NullHooks;

#[async_trait]
impl RunHooks for NullHooks {}

/// The injected LLM backend. One turn per call; tool loops happen inside.
#[async_trait]
pub trait ProviderRunner: Send + Sync {
    async fn run(
        &self,
        req: &RunRequest,
        hooks: &dyn RunHooks,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError>;
}
