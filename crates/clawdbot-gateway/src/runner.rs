//! Development provider runner.
//!
//! The real LLM runtimes plug in through the `ProviderRunner` trait from
//! an external crate. This stand-in keeps the gateway fully wirable (and
//! end-to-end testable) without one: it streams the prompt back as the
//! assistant reply.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use clawdbot_agent::provider::{ProviderRunner, RunHooks, RunOutcome, RunRequest, RunUsage};
use clawdbot_agent::RunError;
use clawdbot_channels::OutboundPayload;

pub struct DevEchoRunner;

#[async_trait]
impl ProviderRunner for DevEchoRunner {
    async fn run(
        &self,
        req: &RunRequest,
        hooks: &dyn RunHooks,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        hooks.on_run_start().await;
        hooks.on_assistant_message_start().await;

        let reply = format!("[echo:{}] {}", req.model, req.prompt);
        for word in reply.split_inclusive(' ') {
            if cancel.is_cancelled() {
                return Err(RunError::Aborted);
            }
            hooks.on_text_delta(word).await;
        }

        Ok(RunOutcome {
            payloads: vec![OutboundPayload::text(reply.clone())],
            usage: RunUsage {
                input_tokens: (req.prompt.len() / 4) as u64,
                output_tokens: (reply.len() / 4) as u64,
            },
            stop_reason: "end_turn".to_string(),
        })
    }
}
